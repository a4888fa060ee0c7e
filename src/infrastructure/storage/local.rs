use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::info;

use super::{validate_key, StorageError, StorageGateway, StorageResult};

/// Filesystem-backed object store. Source objects live under `{root}/raw`,
/// published objects under `{root}/processed`.
#[derive(Clone, Debug)]
pub struct LocalStorageGateway {
    raw_root: PathBuf,
    processed_root: PathBuf,
}

impl LocalStorageGateway {
    pub async fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let raw_root = root.join("raw");
        let processed_root = root.join("processed");

        fs::create_dir_all(&raw_root).await?;
        fs::create_dir_all(&processed_root).await?;

        info!(root = %root.display(), "✅ Local object store ready");
        Ok(Self {
            raw_root,
            processed_root,
        })
    }

    pub fn raw_path(&self, key: &str) -> StorageResult<PathBuf> {
        Self::key_to_path(&self.raw_root, key)
    }

    pub fn processed_path(&self, key: &str) -> StorageResult<PathBuf> {
        Self::key_to_path(&self.processed_root, key)
    }

    fn key_to_path(base: &Path, key: &str) -> StorageResult<PathBuf> {
        validate_key(key).map_err(|reason| {
            StorageError::Io(io::Error::new(io::ErrorKind::InvalidInput, reason))
        })?;
        Ok(base.join(key.trim()))
    }
}

#[async_trait]
impl StorageGateway for LocalStorageGateway {
    async fn fetch(&self, remote_key: &str, local_path: &Path) -> StorageResult<()> {
        let source = self.raw_path(remote_key)?;

        if !fs::try_exists(&source).await? {
            return Err(StorageError::NotFound(remote_key.to_string()));
        }

        let size = fs::copy(&source, local_path).await?;

        info!(key = %remote_key, path = %local_path.display(), size_bytes = size, "⬇️ Fetched object");
        Ok(())
    }

    async fn publish(&self, local_path: &Path, remote_key: &str) -> StorageResult<()> {
        let target = self.processed_path(remote_key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Copy next to the target and rename so readers never see a partial object.
        let staging = target.with_extension("partial");
        let size = fs::copy(local_path, &staging).await?;
        fs::rename(&staging, &target).await?;

        info!(key = %remote_key, size_bytes = size, "⬆️ Published object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_missing_key_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let gateway = LocalStorageGateway::new(root.path()).await.unwrap();

        let err = gateway
            .fetch("missing.mp4", &scratch.path().join("in.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(key) if key == "missing.mp4"));
    }

    #[tokio::test]
    async fn unreadable_source_path_is_io_not_missing() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let gateway = LocalStorageGateway::new(root.path()).await.unwrap();

        // `a` is a file, so looking up `a/b.mp4` fails with ENOTDIR.
        fs::write(gateway.raw_path("a").unwrap(), b"not a directory").await.unwrap();

        let err = gateway
            .fetch("a/b.mp4", &scratch.path().join("in.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)), "{err:?}");
    }

    #[tokio::test]
    async fn fetch_then_publish_moves_bytes_between_buckets() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let gateway = LocalStorageGateway::new(root.path()).await.unwrap();

        fs::write(gateway.raw_path("a.mp4").unwrap(), b"raw bytes").await.unwrap();

        let local = scratch.path().join("in.mp4");
        gateway.fetch("a.mp4", &local).await.unwrap();
        assert_eq!(fs::read(&local).await.unwrap(), b"raw bytes");

        gateway.publish(&local, "out/a-360p.mp4").await.unwrap();
        let published = gateway.processed_path("out/a-360p.mp4").unwrap();
        assert_eq!(fs::read(&published).await.unwrap(), b"raw bytes");

        // Overwrite is allowed.
        fs::write(&local, b"second").await.unwrap();
        gateway.publish(&local, "out/a-360p.mp4").await.unwrap();
        assert_eq!(fs::read(&published).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let gateway = LocalStorageGateway::new(root.path()).await.unwrap();

        let err = gateway
            .fetch("../outside.mp4", &root.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }
}
