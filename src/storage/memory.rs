use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use super::{check_relative, StorageBackend, StorageError, StorageFuture};

/// In-process storage
///
/// Clones share the same entries, so a test can keep one handle to inspect
/// what another component wrote. Writes can be switched off with
/// [`set_read_only`](Self::set_read_only) to exercise persistence failures.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    read_only: Arc<AtomicBool>,
}

impl MemoryStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write and remove fail with a permission error
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Raw bytes stored at `path`
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(path).cloned())
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "storage is read-only",
            )));
        }
        Ok(())
    }
}

fn poisoned() -> StorageError {
    StorageError::Config("memory storage lock poisoned".to_string())
}

impl StorageBackend for MemoryStorage {
    fn write(&self, path: &str, data: &[u8]) -> StorageFuture<'_, ()> {
        let result = check_relative(path)
            .and_then(|_| self.check_writable())
            .and_then(|_| {
                let mut entries = self.entries.write().map_err(|_| poisoned())?;
                entries.insert(path.to_string(), data.to_vec());
                Ok(())
            });
        Box::pin(async move { result })
    }

    fn read(&self, path: &str) -> StorageFuture<'_, Option<Vec<u8>>> {
        let result = check_relative(path).and_then(|_| {
            let entries = self.entries.read().map_err(|_| poisoned())?;
            Ok(entries.get(path).cloned())
        });
        Box::pin(async move { result })
    }

    fn exists(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    fn remove(&self, path: &str) -> StorageFuture<'_, ()> {
        let result = check_relative(path)
            .and_then(|_| self.check_writable())
            .and_then(|_| {
                let mut entries = self.entries.write().map_err(|_| poisoned())?;
                entries.remove(path);
                Ok(())
            });
        Box::pin(async move { result })
    }
}
