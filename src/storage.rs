//! Blob storage for uploaded invoice files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no stored file for handle {0}")]
    Missing(String),

    #[error("invalid storage handle {0}")]
    InvalidHandle(String),
}

/// Stable identity of an upload: SHA-256 of its bytes, lowercase hex.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn store(&self, bytes: &[u8]) -> Result<String, StorageError>;
    async fn retrieve(&self, handle: &str) -> Result<Vec<u8>, StorageError>;
    async fn delete(&self, handle: &str) -> Result<(), StorageError>;
}

/// Content-addressed files under a root directory. Identical uploads map to
/// the same handle, so storing twice is harmless.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        info!(root = %root.display(), "Blob storage ready");
        Ok(Self { root })
    }

    fn path_for(&self, handle: &str) -> Result<PathBuf, StorageError> {
        let valid = !handle.is_empty()
            && handle
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
            && !handle.starts_with('.');
        if !valid {
            return Err(StorageError::InvalidHandle(handle.to_string()));
        }
        Ok(self.root.join(handle))
    }
}

#[async_trait]
impl BlobStorage for FsStorage {
    async fn store(&self, bytes: &[u8]) -> Result<String, StorageError> {
        let handle = format!("{}.pdf", content_fingerprint(bytes));
        let path = self.path_for(&handle)?;
        if tokio::fs::try_exists(&path).await? {
            debug!(handle = %handle, "Blob already stored");
            return Ok(handle);
        }

        // write-then-rename so readers never observe a partial file; the temp
        // name is unique because identical uploads may race here
        let tmp = self
            .root
            .join(format!("{handle}.{}.partial", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!(handle = %handle, bytes = bytes.len(), "Blob stored");
        Ok(handle)
    }

    async fn retrieve(&self, handle: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(handle)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::Missing(handle.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, handle: &str) -> Result<(), StorageError> {
        let path = self.path_for(handle)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(handle = %handle, "Blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
