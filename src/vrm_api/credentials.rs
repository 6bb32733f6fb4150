use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::{StorageBackend, StorageError, StorageFuture};
use crate::vrm_api::resources::{portal_id_string, Installation};

/// Top-level section holding secrets
pub const SECRETS_SECTION: &str = "secrets";
/// Top-level section holding settings
pub const SETTINGS_SECTION: &str = "settings";

/// Secret key holding the long-lived access token
pub const ACCESS_TOKEN_KEY: &str = "vrmToken";
/// Secret key holding the portal id of the access token
pub const TOKEN_ID_KEY: &str = "vrmTokenId";
/// Secret key holding the account (user) id
pub const ACCOUNT_ID_KEY: &str = "vrmUserId";
/// Secret key holding the portal login name
pub const USERNAME_KEY: &str = "vrmUsername";

const CREDENTIAL_KEYS: [&str; 4] = [ACCESS_TOKEN_KEY, TOKEN_ID_KEY, ACCOUNT_ID_KEY, USERNAME_KEY];

/// Settings section owned by this integration
pub const VRM_SETTINGS_KEY: &str = "vrm";
/// Settings key for the set of enabled installations
pub const ENABLED_PORTAL_IDS_KEY: &str = "enabledPortalIds";
/// Legacy settings key listing disabled installations
pub const LEGACY_DISABLED_KEY: &str = "disabled";

/// Default location of the document inside its storage backend
pub const DEFAULT_DOCUMENT_PATH: &str = "vrm/store.json";

/// Credentials produced by a successful login + token creation
///
/// Persisted as a unit: the four secret keys are either all written or all
/// absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub access_token: String,
    pub token_id: String,
    pub account_id: String,
    pub username: String,
}

/// Snapshot of the whole credential document
///
/// The document is kept as one ordered JSON object and only the entries this
/// integration owns are edited in place, so every other key keeps its value
/// and position. Sections are never created unless something is written to
/// them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreSnapshot {
    document: Map<String, Value>,
}

impl StoreSnapshot {
    /// Parse a stored document; an empty document is an empty snapshot
    pub fn from_slice(data: &[u8]) -> Result<Self, StorageError> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(data).map_err(|e| {
            tracing::error!("Failed to parse credential document: {}", e);
            StorageError::Config(format!("JSON deserialization failed: {}", e))
        })
    }

    /// Serialize as pretty JSON with two-space indentation
    pub fn to_vec(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec_pretty(self).map_err(|e| {
            tracing::error!("Failed to serialize credential document: {}", e);
            StorageError::Config(format!("JSON serialization failed: {}", e))
        })
    }

    /// The whole document
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.document
    }

    /// The `secrets` section, if present
    pub fn secrets(&self) -> Option<&Map<String, Value>> {
        self.document.get(SECRETS_SECTION).and_then(Value::as_object)
    }

    /// The `settings` section, if present
    pub fn settings(&self) -> Option<&Map<String, Value>> {
        self.document.get(SETTINGS_SECTION).and_then(Value::as_object)
    }

    /// Object stored under `key`, created in place (or replaced if it is not
    /// an object)
    fn section_mut<'a>(
        map: &'a mut Map<String, Value>,
        key: &str,
    ) -> Option<&'a mut Map<String, Value>> {
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        entry.as_object_mut()
    }

    fn secret(&self, key: &str) -> Option<String> {
        self.secrets()?
            .get(key)
            .and_then(portal_id_string)
            .filter(|s| !s.is_empty())
    }

    /// Stored access token, if any
    pub fn access_token(&self) -> Option<String> {
        self.secret(ACCESS_TOKEN_KEY)
    }

    /// Stored account id, if any
    pub fn account_id(&self) -> Option<String> {
        self.secret(ACCOUNT_ID_KEY)
    }

    /// Stored portal login name, if any
    pub fn username(&self) -> Option<String> {
        self.secret(USERNAME_KEY)
    }

    /// The complete credential record, or `None` if any field is missing
    pub fn credentials(&self) -> Option<CredentialRecord> {
        Some(CredentialRecord {
            access_token: self.secret(ACCESS_TOKEN_KEY)?,
            token_id: self.secret(TOKEN_ID_KEY)?,
            account_id: self.secret(ACCOUNT_ID_KEY)?,
            username: self.secret(USERNAME_KEY)?,
        })
    }

    /// True if any of the four credential keys is present
    pub fn has_credential_fields(&self) -> bool {
        self.secrets()
            .map(|secrets| CREDENTIAL_KEYS.iter().any(|key| secrets.contains_key(*key)))
            .unwrap_or(false)
    }

    /// Copy of this snapshot with `record` written into the secrets section
    pub fn with_credentials(&self, record: &CredentialRecord) -> Self {
        let mut next = self.clone();
        if let Some(secrets) = Self::section_mut(&mut next.document, SECRETS_SECTION) {
            for (key, value) in [
                (ACCESS_TOKEN_KEY, &record.access_token),
                (TOKEN_ID_KEY, &record.token_id),
                (ACCOUNT_ID_KEY, &record.account_id),
                (USERNAME_KEY, &record.username),
            ] {
                secrets.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        next
    }

    /// Copy of this snapshot with the four credential keys removed
    ///
    /// The `secrets` section itself stays, even if it ends up empty.
    pub fn without_credentials(&self) -> Self {
        let mut next = self.clone();
        if let Some(Value::Object(secrets)) = next.document.get_mut(SECRETS_SECTION) {
            for key in CREDENTIAL_KEYS {
                secrets.shift_remove(key);
            }
        }
        next
    }

    fn vrm_settings(&self) -> Option<&Map<String, Value>> {
        self.settings()?.get(VRM_SETTINGS_KEY).and_then(Value::as_object)
    }

    /// Enabled installation ids, if the settings carry them
    pub fn enabled_portal_ids(&self) -> Option<Vec<String>> {
        self.vrm_settings()?
            .get(ENABLED_PORTAL_IDS_KEY)?
            .as_array()
            .map(|ids| ids.iter().filter_map(portal_id_string).collect())
    }

    /// Legacy disabled installation ids, if the old field is still present
    pub fn legacy_disabled(&self) -> Option<Vec<String>> {
        let value = self.vrm_settings()?.get(LEGACY_DISABLED_KEY)?;
        Some(match value {
            Value::Array(ids) => ids.iter().filter_map(portal_id_string).collect(),
            Value::Null => Vec::new(),
            other => portal_id_string(other).into_iter().collect(),
        })
    }

    /// Convert the legacy disabled list into an enabled set
    ///
    /// Returns `None` when there is nothing to migrate. Otherwise the returned
    /// snapshot has `enabledPortalIds` set to every discovered installation
    /// not in the disabled list (in discovery order) and no `disabled` key.
    pub fn migrate_disabled(&self, discovered: &[Installation]) -> Option<Self> {
        let disabled: HashSet<String> = self.legacy_disabled()?.into_iter().collect();

        let enabled: Vec<Value> = discovered
            .iter()
            .filter(|installation| !disabled.contains(&installation.portal_id))
            .map(|installation| Value::String(installation.portal_id.clone()))
            .collect();

        let mut next = self.clone();
        let vrm = Self::section_mut(&mut next.document, SETTINGS_SECTION)
            .and_then(|settings| Self::section_mut(settings, VRM_SETTINGS_KEY))?;
        vrm.insert(ENABLED_PORTAL_IDS_KEY.to_string(), Value::Array(enabled));
        vrm.shift_remove(LEGACY_DISABLED_KEY);
        Some(next)
    }
}

/// Durable home of the credential document
///
/// Implementations must make `write_all` all-or-nothing: after a failed write
/// a subsequent `read` returns the previous document.
pub trait CredentialStore: Send + Sync {
    /// Current contents of the document
    fn read(&self) -> StorageFuture<'_, StoreSnapshot>;

    /// Replace the whole document
    fn write_all(&self, snapshot: &StoreSnapshot) -> StorageFuture<'_, ()>;
}

impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    fn read(&self) -> StorageFuture<'_, StoreSnapshot> {
        (**self).read()
    }

    fn write_all(&self, snapshot: &StoreSnapshot) -> StorageFuture<'_, ()> {
        (**self).write_all(snapshot)
    }
}

/// [`CredentialStore`] that keeps the document at one path of a
/// [`StorageBackend`]
///
/// Every `read` reloads from the backend so edits made by the host are seen.
/// The last successfully read or written snapshot is cached; the cache only
/// changes after the backend accepted a write.
pub struct DocumentStore<B> {
    backend: B,
    path: String,
    cache: RwLock<StoreSnapshot>,
}

impl<B: StorageBackend> DocumentStore<B> {
    /// Store the document at [`DEFAULT_DOCUMENT_PATH`]
    pub fn new(backend: B) -> Self {
        Self::with_path(backend, DEFAULT_DOCUMENT_PATH)
    }

    /// Store the document at `path`
    pub fn with_path(backend: B, path: impl Into<String>) -> Self {
        Self {
            backend,
            path: path.into(),
            cache: RwLock::new(StoreSnapshot::default()),
        }
    }

    /// Last snapshot read from or written to the backend
    pub fn cached(&self) -> StoreSnapshot {
        self.cache
            .read()
            .map(|snapshot| snapshot.clone())
            .unwrap_or_default()
    }

    /// Underlying storage backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn replace_cache(&self, snapshot: StoreSnapshot) {
        match self.cache.write() {
            Ok(mut cache) => *cache = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

impl<B: StorageBackend> CredentialStore for DocumentStore<B> {
    fn read(&self) -> StorageFuture<'_, StoreSnapshot> {
        Box::pin(async move {
            let snapshot = match self.backend.read(&self.path).await? {
                Some(data) => StoreSnapshot::from_slice(&data)?,
                None => {
                    tracing::debug!("No credential document at {}", self.path);
                    StoreSnapshot::default()
                }
            };
            self.replace_cache(snapshot.clone());
            Ok(snapshot)
        })
    }

    fn write_all(&self, snapshot: &StoreSnapshot) -> StorageFuture<'_, ()> {
        let snapshot = snapshot.clone();
        Box::pin(async move {
            let data = snapshot.to_vec()?;
            self.backend.write(&self.path, &data).await.map_err(|e| {
                tracing::error!("Failed to write credential document {}: {}", self.path, e);
                e
            })?;
            tracing::debug!("Credential document {} written", self.path);
            self.replace_cache(snapshot);
            Ok(())
        })
    }
}
