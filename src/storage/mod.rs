//! Persistence backends for the credential document.
//!
//! The VRM integration keeps its secrets and settings in a single JSON
//! document. Where that document physically lives is decided by a
//! [`StorageBackend`]:
//!
//! - [`FilesystemStorage`] writes plain JSON next to the host's other
//!   configuration files (the traditional secrets file layout).
//! - [`EncryptedFilesystemStorage`] encrypts the document at rest with `age`.
//! - [`MemoryStorage`] keeps everything in process, for tests and embedding.

mod encrypted;
mod filesystem;
mod memory;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

pub use encrypted::EncryptedFilesystemStorage;
pub use filesystem::FilesystemStorage;
pub use memory::MemoryStorage;

/// Boxed future returned by every [`StorageBackend`] operation
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Storage backend trait for persisting documents
///
/// Paths are relative to the backend's root. Writes replace the whole entry;
/// backends never expose partially written data to a subsequent read.
pub trait StorageBackend: Send + Sync {
    /// Replace the entry at `path` with `data`
    fn write(&self, path: &str, data: &[u8]) -> StorageFuture<'_, ()>;

    /// Read the entry at `path`, or `None` if it has never been written
    fn read(&self, path: &str) -> StorageFuture<'_, Option<Vec<u8>>>;

    /// Check whether an entry exists at `path`
    fn exists(&self, path: &str) -> bool;

    /// Remove the entry at `path`; removing a missing entry is not an error
    fn remove(&self, path: &str) -> StorageFuture<'_, ()>;
}

/// Storage errors
#[derive(Debug)]
pub enum StorageError {
    /// IO error
    Io(std::io::Error),
    /// Serialization or document shape error
    Config(String),
    /// Path error
    Path(String),
    /// Encryption error
    Encryption(String),
    /// Encryption key could not be loaded or stored
    KeyStorage(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Config(msg) => write!(f, "Configuration error: {}", msg),
            StorageError::Path(msg) => write!(f, "Path error: {}", msg),
            StorageError::Encryption(msg) => write!(f, "Encryption error: {}", msg),
            StorageError::KeyStorage(msg) => write!(f, "Key storage error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Config(format!("JSON error: {}", err))
    }
}

/// Reject paths that would escape the backend root
pub(crate) fn check_relative(path: &str) -> Result<(), StorageError> {
    let candidate = std::path::Path::new(path);
    if path.is_empty() || candidate.is_absolute() {
        return Err(StorageError::Path(format!("'{}' is not a relative path", path)));
    }
    if candidate
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(StorageError::Path(format!(
            "'{}' must not contain '..' components",
            path
        )));
    }
    Ok(())
}
