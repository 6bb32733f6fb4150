use std::path::{Path, PathBuf};

use super::{check_relative, StorageBackend, StorageError, StorageFuture};

/// Plain JSON files under a base directory
///
/// This is the layout hosts traditionally use for their secrets file, so it
/// stays readable and editable by hand. Data is **not** encrypted; prefer
/// [`EncryptedFilesystemStorage`](super::EncryptedFilesystemStorage) when the
/// host does not need to read the document itself.
///
/// Writes go to a temporary sibling file which is then renamed over the
/// target, so a crash mid-write leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    base_path: PathBuf,
}

impl FilesystemStorage {
    /// Create a new filesystem storage rooted at `base_path`
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();

        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }

        Ok(Self { base_path })
    }

    /// Root directory of this storage
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        check_relative(path)?;
        Ok(self.base_path.join(path))
    }
}

/// Write `data` to `target` through a temporary file and a rename
pub(super) async fn write_atomically(target: &Path, data: &[u8]) -> Result<(), StorageError> {
    let parent = target
        .parent()
        .ok_or_else(|| StorageError::Path(format!("{:?} has no parent directory", target)))?;
    let file_name = target
        .file_name()
        .ok_or_else(|| StorageError::Path(format!("{:?} has no file name", target)))?
        .to_string_lossy();

    tokio::fs::create_dir_all(parent).await?;

    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    if let Err(e) = tokio::fs::write(&tmp_path, data).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, target).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

/// Read `target`, mapping a missing file to `None`
pub(super) async fn read_if_present(target: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match tokio::fs::read(target).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove `target`, treating a missing file as already removed
pub(super) async fn remove_if_present(target: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_file(target).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl StorageBackend for FilesystemStorage {
    fn write(&self, path: &str, data: &[u8]) -> StorageFuture<'_, ()> {
        let full_path = self.resolve_path(path);
        let data = data.to_vec();

        Box::pin(async move {
            let full_path = full_path?;
            write_atomically(&full_path, &data).await?;
            tracing::debug!("Wrote {} bytes to {:?}", data.len(), full_path);
            Ok(())
        })
    }

    fn read(&self, path: &str) -> StorageFuture<'_, Option<Vec<u8>>> {
        let full_path = self.resolve_path(path);

        Box::pin(async move {
            let full_path = full_path?;
            let data = read_if_present(&full_path).await?;
            tracing::debug!("Read {:?} (present={})", full_path, data.is_some());
            Ok(data)
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve_path(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn remove(&self, path: &str) -> StorageFuture<'_, ()> {
        let full_path = self.resolve_path(path);

        Box::pin(async move {
            let full_path = full_path?;
            remove_if_present(&full_path).await?;
            tracing::debug!("Removed {:?}", full_path);
            Ok(())
        })
    }
}
