//! The credential exchange and bootstrap flow.
//!
//! [`Bootstrap`] sequences [`VrmClient`] calls with a [`CredentialStore`]:
//!
//! 1. **Authenticate**: login, create a named access token, persist the
//!    credential record in one write, then discover installations.
//! 2. **Deauthenticate**: remove the credential record in one write.
//! 3. **Discover installations**: list installations and migrate the legacy
//!    disabled list to an enabled set, once.
//! 4. **Open broker connection**: mint a single-use broker password and open
//!    an MQTT session with it.
//!
//! Every operation runs its steps strictly in order and stops at the first
//! failure. The store is written only after every remote step succeeded, and
//! every failure is both logged and emitted as a [`StatusEvent`].

use std::sync::Arc;

use crate::config::VrmConfig;
use crate::vrm_api::broker::{
    BrokerSessionCredential, BrokerTransport, MqttTransport, DEFAULT_BROKER_USERNAME_PREFIX,
};
use crate::vrm_api::client::VrmClient;
use crate::vrm_api::credentials::{CredentialRecord, CredentialStore, StoreSnapshot};
use crate::vrm_api::events::{EventSink, NullSink, StatusEvent, VrmEvent};
use crate::vrm_api::resources::Installation;
use crate::vrm_api::types::VrmError;

const PLEASE_LOG_IN: &str = "Please log in";

/// Orchestrates the VRM portal integration
///
/// Operations are expected to be invoked one at a time by the host; none of
/// them can be cancelled half-way once started.
pub struct Bootstrap<S, T = MqttTransport> {
    client: VrmClient,
    store: S,
    transport: T,
    events: Arc<dyn EventSink>,
    username_prefix: String,
}

impl<S: CredentialStore> Bootstrap<S, MqttTransport> {
    /// Build from configuration, using the MQTT transport
    pub fn from_config(config: &VrmConfig, store: S) -> Self {
        Self::new(VrmClient::new(config.api_url.clone()), store, MqttTransport::new())
            .with_username_prefix(config.broker_username_prefix.clone())
    }
}

impl<S: CredentialStore, T: BrokerTransport> Bootstrap<S, T> {
    pub fn new(client: VrmClient, store: S, transport: T) -> Self {
        Self {
            client,
            store,
            transport,
            events: Arc::new(NullSink),
            username_prefix: DEFAULT_BROKER_USERNAME_PREFIX.to_string(),
        }
    }

    /// Send status and discovery events to `sink`
    pub fn with_events(mut self, sink: impl EventSink + 'static) -> Self {
        self.events = Arc::new(sink);
        self
    }

    /// Prefix for broker usernames
    pub fn with_username_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.username_prefix = prefix.into();
        self
    }

    pub fn client(&self) -> &VrmClient {
        &self.client
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn good(&self, message: &str) {
        tracing::info!("{}", message);
        self.events.emit(VrmEvent::Status(StatusEvent::success(message)));
    }

    fn fail(&self, message: String) {
        tracing::error!("{}", message);
        self.events.emit(VrmEvent::Status(StatusEvent::failure(message)));
    }

    /// Log and emit `err`, handing it back for `?`
    fn report(&self, err: VrmError) -> VrmError {
        tracing::debug!("VRM operation failed: {:?}", err);
        self.fail(err.user_message());
        err
    }

    async fn read_store(&self) -> Result<StoreSnapshot, VrmError> {
        self.store
            .read()
            .await
            .map_err(|e| self.report(VrmError::Persistence(e)))
    }

    /// Log in, create an access token named `token_name` and persist it
    ///
    /// An empty token name is rejected before any network call. The
    /// credential record is written once, after both remote calls succeeded;
    /// on any failure the store is left untouched. After a successful write
    /// installations are discovered; a discovery failure is reported through
    /// events only and does not undo the login.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        token_name: &str,
    ) -> Result<CredentialRecord, VrmError> {
        if token_name.is_empty() {
            return Err(self.report(VrmError::Validation(
                "Please enter a token name".to_string(),
            )));
        }

        self.good("Logging in");

        let session = self
            .client
            .login(username, password)
            .await
            .map_err(|e| self.report(e))?;

        let token = self
            .client
            .create_access_token(&session.session_token, &session.account_id, token_name)
            .await
            .map_err(|e| self.report(e))?;

        self.good("Token created");

        let record = CredentialRecord {
            access_token: token.access_token,
            token_id: token.token_id,
            account_id: session.account_id,
            username: username.to_string(),
        };

        let snapshot = self.read_store().await?;
        if let Err(e) = self.store.write_all(&snapshot.with_credentials(&record)).await {
            self.fail(format!(
                "Access token '{}' was created on the portal but could not be saved ({}). \
                 Retry with a new token name or log in again.",
                token_name, e
            ));
            return Err(VrmError::Persistence(e));
        }

        tracing::info!(
            "VRM credentials stored for account {} (token id {})",
            record.account_id,
            record.token_id
        );

        if let Err(e) = self.discover_installations().await {
            tracing::warn!("Installation discovery after login failed: {}", e);
        }

        Ok(record)
    }

    /// Remove the stored credential record
    ///
    /// Every other key of the document is written back unchanged. Calling
    /// this while logged out succeeds without touching the store. If the
    /// write fails nothing changes, including the store's cached snapshot.
    pub async fn deauthenticate(&self) -> Result<(), VrmError> {
        tracing::info!("Logging out of VRM");

        let snapshot = self.read_store().await?;
        if snapshot.has_credential_fields() {
            self.store
                .write_all(&snapshot.without_credentials())
                .await
                .map_err(|e| self.report(VrmError::Persistence(e)))?;
        } else {
            tracing::debug!("No VRM credentials stored, nothing to remove");
        }

        self.good("Logged out");
        Ok(())
    }

    /// Fetch the installations of the logged-in account
    ///
    /// Fails with [`VrmError::Auth`] without a network call when no access
    /// token is stored. When the settings still carry the legacy `disabled`
    /// list it is converted to `enabledPortalIds` and removed in the same
    /// write; once it is gone later discoveries leave the settings alone.
    pub async fn discover_installations(&self) -> Result<Vec<Installation>, VrmError> {
        let snapshot = self.read_store().await?;
        let (access_token, account_id) = match (snapshot.access_token(), snapshot.account_id()) {
            (Some(token), Some(account)) => (token, account),
            _ => return Err(self.report(VrmError::Auth(PLEASE_LOG_IN.to_string()))),
        };

        self.good("Getting installations");

        let installations = self
            .client
            .list_installations(&access_token, &account_id)
            .await
            .map_err(|e| self.report(e))?;

        // The listing took a round trip; migrate against the current document
        let current = self.read_store().await?;
        if let Some(migrated) = current.migrate_disabled(&installations) {
            tracing::info!(
                "Converting legacy disabled installation list to {} enabled installations",
                migrated.enabled_portal_ids().map(|ids| ids.len()).unwrap_or(0)
            );
            self.store
                .write_all(&migrated)
                .await
                .map_err(|e| self.report(VrmError::Persistence(e)))?;
        }

        self.events
            .emit(VrmEvent::Discovered(installations.clone()));
        self.good("Installations retrieved");
        Ok(installations)
    }

    /// Open a broker session at `address:port`
    ///
    /// Mints a single-use broker password from the stored access token, then
    /// connects once. No connection is attempted when there is no access
    /// token or the token exchange fails.
    pub async fn open_broker_connection(
        &self,
        address: &str,
        port: u16,
    ) -> Result<T::Connection, VrmError> {
        let snapshot = self.read_store().await?;
        let (access_token, username) = match (snapshot.access_token(), snapshot.username()) {
            (Some(token), Some(username)) => (token, username),
            _ => return Err(self.report(VrmError::Auth(PLEASE_LOG_IN.to_string()))),
        };

        let broker_token = match self.client.mint_broker_token(&access_token).await {
            Ok(token) => token,
            Err(VrmError::Auth(detail)) => {
                return Err(self.report(VrmError::Auth(format!(
                    "Broker token request failed: {}",
                    detail
                ))))
            }
            Err(VrmError::Network(api)) => {
                return Err(self.report(VrmError::Network(
                    api.context("Broker token request failed"),
                )))
            }
            Err(e) => return Err(self.report(e)),
        };

        let credential =
            BrokerSessionCredential::new(&self.username_prefix, &username, broker_token);
        let connection = self
            .transport
            .connect(address, port, credential)
            .await
            .map_err(|e| self.report(e))?;

        self.good("Connected");
        Ok(connection)
    }

    /// Stored credential record, if complete
    pub async fn credentials(&self) -> Result<Option<CredentialRecord>, VrmError> {
        Ok(self.store.read().await?.credentials())
    }

    /// True when an access token is stored
    pub async fn is_authenticated(&self) -> Result<bool, VrmError> {
        Ok(self.store.read().await?.access_token().is_some())
    }

    /// Installations enabled in the settings
    pub async fn enabled_portal_ids(&self) -> Result<Vec<String>, VrmError> {
        Ok(self
            .store
            .read()
            .await?
            .enabled_portal_ids()
            .unwrap_or_default())
    }
}
