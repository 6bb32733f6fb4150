use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use secrecy::ExposeSecret;

use super::filesystem::{read_if_present, remove_if_present, write_atomically};
use super::{check_relative, StorageBackend, StorageError, StorageFuture};

/// Environment variable holding a base64-encoded age identity
pub const ENCRYPTION_KEY_ENV: &str = "VRM_ENCRYPTION_KEY";

/// Name of the generated key file inside the storage directory
const KEY_FILE_NAME: &str = ".encryption.key";

/// Encrypted filesystem storage for the credential document
///
/// Every entry is encrypted at rest with an age x25519 identity. The identity
/// is resolved in this order:
///
/// 1. `VRM_ENCRYPTION_KEY` (base64 of the `AGE-SECRET-KEY-...` string)
/// 2. An existing key file
/// 3. A freshly generated key, written to the key file with 0600 permissions
///
/// The default key file is `<base_path>/.encryption.key`. Keep it out of
/// version control and backups that leave the machine.
pub struct EncryptedFilesystemStorage {
    base_path: PathBuf,
    recipient: age::x25519::Recipient,
    identity: age::x25519::Identity,
}

impl std::fmt::Debug for EncryptedFilesystemStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFilesystemStorage")
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

impl EncryptedFilesystemStorage {
    /// Open encrypted storage under `~/.vrm/<instance_id>`
    pub async fn new_with_instance(instance_id: &str) -> Result<Self, StorageError> {
        let home = dirs::home_dir().ok_or_else(|| {
            StorageError::KeyStorage("Cannot determine home directory".to_string())
        })?;

        Self::new(home.join(".vrm").join(instance_id)).await
    }

    /// Open encrypted storage under `base_path`, keeping the key alongside it
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        let key_path = base_path.join(KEY_FILE_NAME);
        Self::with_key_file(base_path, key_path).await
    }

    /// Open encrypted storage with an explicit key file location
    pub async fn with_key_file(
        base_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_path).await?;

        let identity = resolve_identity(key_path.as_ref()).await?;
        Ok(Self::with_identity(base_path, identity))
    }

    /// Open encrypted storage with an identity supplied by the caller
    pub fn with_identity(base_path: impl AsRef<Path>, identity: age::x25519::Identity) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            recipient: identity.to_public(),
            identity,
        }
    }

    fn resolve_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        check_relative(path)?;
        Ok(self.base_path.join(path))
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        let encryptor = age::Encryptor::with_recipients(vec![Box::new(self.recipient.clone())])
            .ok_or_else(|| StorageError::Encryption("No recipients for encryptor".to_string()))?;

        let mut encrypted = Vec::new();
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| StorageError::Encryption(format!("Failed to wrap output: {}", e)))?;
        writer
            .write_all(data)
            .map_err(|e| StorageError::Encryption(format!("Failed to encrypt data: {}", e)))?;
        writer
            .finish()
            .map_err(|e| StorageError::Encryption(format!("Failed to finalize encryption: {}", e)))?;

        Ok(encrypted)
    }

    fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>, StorageError> {
        let decryptor = match age::Decryptor::new(encrypted)
            .map_err(|e| StorageError::Encryption(format!("Failed to create decryptor: {}", e)))?
        {
            age::Decryptor::Recipients(d) => d,
            _ => {
                return Err(StorageError::Encryption(
                    "Document is passphrase-encrypted, expected x25519 recipients".to_string(),
                ))
            }
        };

        let mut reader = decryptor
            .decrypt(std::iter::once(&self.identity as &dyn age::Identity))
            .map_err(|e| StorageError::Encryption(format!("Failed to decrypt data: {}", e)))?;

        let mut decrypted = Vec::new();
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| StorageError::Encryption(format!("Failed to read decrypted data: {}", e)))?;
        Ok(decrypted)
    }
}

async fn resolve_identity(key_path: &Path) -> Result<age::x25519::Identity, StorageError> {
    if let Ok(key_base64) = std::env::var(ENCRYPTION_KEY_ENV) {
        tracing::debug!("Using encryption key from {}", ENCRYPTION_KEY_ENV);
        return parse_identity(&key_base64);
    }

    match tokio::fs::read_to_string(key_path).await {
        Ok(contents) => {
            tracing::debug!("Loaded encryption key from {:?}", key_path);
            parse_identity(contents.trim())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("Generating new encryption key at {:?}", key_path);
            generate_identity(key_path).await
        }
        Err(e) => Err(StorageError::KeyStorage(format!(
            "Failed to read key file {:?}: {}",
            key_path, e
        ))),
    }
}

/// Decode a base64-wrapped age identity
fn parse_identity(key_base64: &str) -> Result<age::x25519::Identity, StorageError> {
    let key_bytes = general_purpose::STANDARD
        .decode(key_base64.trim())
        .map_err(|e| StorageError::KeyStorage(format!("Invalid base64 key: {}", e)))?;
    let key_str = String::from_utf8(key_bytes)
        .map_err(|e| StorageError::KeyStorage(format!("Invalid UTF-8 in key: {}", e)))?;

    key_str
        .trim()
        .parse::<age::x25519::Identity>()
        .map_err(|e| StorageError::KeyStorage(format!("Invalid age identity: {}", e)))
}

/// Encode an identity the way [`parse_identity`] expects it
pub(crate) fn encode_identity(identity: &age::x25519::Identity) -> String {
    general_purpose::STANDARD.encode(identity.to_string().expose_secret().as_bytes())
}

async fn generate_identity(key_path: &Path) -> Result<age::x25519::Identity, StorageError> {
    let identity = age::x25519::Identity::generate();

    write_atomically(key_path, encode_identity(&identity).as_bytes())
        .await
        .map_err(|e| StorageError::KeyStorage(format!("Failed to write key file: {}", e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600)).map_err(
            |e| StorageError::KeyStorage(format!("Failed to set key file permissions: {}", e)),
        )?;
    }

    Ok(identity)
}

impl StorageBackend for EncryptedFilesystemStorage {
    fn write(&self, path: &str, data: &[u8]) -> StorageFuture<'_, ()> {
        let full_path = self.resolve_path(path);
        let data = data.to_vec();

        Box::pin(async move {
            let full_path = full_path?;
            let encrypted = self.encrypt(&data)?;
            write_atomically(&full_path, &encrypted).await?;
            tracing::debug!("Wrote encrypted document to {:?}", full_path);
            Ok(())
        })
    }

    fn read(&self, path: &str) -> StorageFuture<'_, Option<Vec<u8>>> {
        let full_path = self.resolve_path(path);

        Box::pin(async move {
            let full_path = full_path?;
            match read_if_present(&full_path).await? {
                Some(encrypted) => {
                    let decrypted = self.decrypt(&encrypted)?;
                    tracing::debug!("Read encrypted document from {:?}", full_path);
                    Ok(Some(decrypted))
                }
                None => Ok(None),
            }
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve_path(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn remove(&self, path: &str) -> StorageFuture<'_, ()> {
        let full_path = self.resolve_path(path);

        Box::pin(async move {
            let full_path = full_path?;
            remove_if_present(&full_path).await
        })
    }
}
