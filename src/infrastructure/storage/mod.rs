//! Storage gateway: a uniform surface over the remote object store and the
//! local scratch filesystem. Gateways know nothing about jobs.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

pub mod local;
pub mod s3;

pub use local::LocalStorageGateway;
pub use s3::S3StorageGateway;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The remote object does not exist. Permanent.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Network or backend hiccup. Retryable.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Local disk failure while reading or writing a scratch file.
    #[error("local io failure: {0}")]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Download `remote_key` from the source bucket into `local_path`.
    async fn fetch(&self, remote_key: &str, local_path: &Path) -> StorageResult<()>;

    /// Upload `local_path` to `remote_key` in the destination bucket,
    /// overwriting whatever is there.
    async fn publish(&self, local_path: &Path, remote_key: &str) -> StorageResult<()>;

    /// Remove a local file. A missing file is not an error.
    async fn purge(&self, local_path: &Path) -> io::Result<()> {
        purge_file(local_path).await
    }

    /// Release backend resources. Called once at shutdown.
    async fn close(&self) {}
}

pub async fn purge_file(local_path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(local_path).await {
        Ok(()) => {
            debug!(path = %local_path.display(), "Scratch file purged");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Reject keys that could escape a bucket prefix or a local root.
pub fn validate_key(key: &str) -> Result<(), String> {
    let key = key.trim();
    if key.is_empty() {
        return Err("key must not be empty".to_string());
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return Err("key must be relative".to_string());
    }
    if key.split(['/', '\\']).any(|segment| segment == "..") {
        return Err("key must not contain '..' segments".to_string());
    }
    if key.chars().any(|c| c.is_control()) {
        return Err("key must not contain control characters".to_string());
    }
    Ok(())
}
