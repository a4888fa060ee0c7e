use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::infrastructure::storage::StorageGateway;
use crate::infrastructure::transcode::TranscodeProfile;

/// Root of all per-job scratch directories. Each job owns `{root}/{job_id}/`.
#[derive(Clone, Debug)]
pub struct ScratchSpace {
    root: PathBuf,
}

impl ScratchSpace {
    pub async fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Create the job's scratch directory and hand out its file pair.
    pub async fn acquire(
        &self,
        job_id: Uuid,
        source_key: &str,
        profile: &TranscodeProfile,
    ) -> io::Result<ScratchLease> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir).await?;

        let input_ext = Path::new(source_key)
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("bin");

        let input = dir.join(format!("input.{}", input_ext));
        let output = dir.join(format!("output-{}.{}", profile.name, profile.extension));

        debug!(job_id = %job_id, dir = %dir.display(), "Scratch acquired");
        Ok(ScratchLease {
            dir,
            input,
            output,
            released: false,
        })
    }

    /// Remove whatever a previous run left behind for `job_id`.
    pub async fn purge_job(&self, job_id: Uuid) -> io::Result<()> {
        remove_dir(&self.job_dir(job_id)).await
    }
}

/// Exclusive scratch file pair for one job run. Call [`ScratchLease::release`]
/// on every exit path; dropping an unreleased lease removes the directory
/// synchronously as a last resort.
#[derive(Debug)]
pub struct ScratchLease {
    dir: PathBuf,
    input: PathBuf,
    output: PathBuf,
    released: bool,
}

impl ScratchLease {
    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub async fn release(mut self, storage: &dyn StorageGateway) -> io::Result<()> {
        self.released = true;
        let mut first_err = None;

        for path in [&self.input, &self.output] {
            if let Err(e) = storage.purge(path).await {
                warn!(path = %path.display(), error = %e, "Failed to purge scratch file");
                first_err.get_or_insert(e);
            }
        }
        // Anything the engine left next to the pair (temp files, logs).
        if let Err(e) = remove_dir(&self.dir).await {
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ScratchLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!(dir = %self.dir.display(), "Scratch removed on drop"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "Failed to remove scratch on drop"),
        }
    }
}

async fn remove_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::LocalStorageGateway;

    fn profile() -> TranscodeProfile {
        TranscodeProfile::named("360p").unwrap()
    }

    #[tokio::test]
    async fn leases_are_per_job() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::new(root.path()).await.unwrap();

        let a = scratch.acquire(Uuid::new_v4(), "a.mp4", &profile()).await.unwrap();
        let b = scratch.acquire(Uuid::new_v4(), "a.mp4", &profile()).await.unwrap();

        assert_ne!(a.input(), b.input());
        assert_ne!(a.output(), b.output());
        assert!(a.input().ends_with("input.mp4"));
        assert!(a.output().ends_with("output-360p.mp4"));
    }

    #[tokio::test]
    async fn release_purges_files_and_directory() {
        let root = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let gateway = LocalStorageGateway::new(store.path()).await.unwrap();
        let scratch = ScratchSpace::new(root.path()).await.unwrap();
        let id = Uuid::new_v4();

        let lease = scratch.acquire(id, "clip", &profile()).await.unwrap();
        assert!(lease.input().ends_with("input.bin"));
        tokio::fs::write(lease.input(), b"in").await.unwrap();
        tokio::fs::write(lease.output(), b"out").await.unwrap();

        lease.release(&gateway).await.unwrap();
        assert!(!scratch.job_dir(id).exists());
    }

    #[tokio::test]
    async fn dropped_lease_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::new(root.path()).await.unwrap();
        let id = Uuid::new_v4();

        {
            let lease = scratch.acquire(id, "a.mp4", &profile()).await.unwrap();
            std::fs::write(lease.input(), b"partial").unwrap();
        }

        assert!(!scratch.job_dir(id).exists());
    }
}
