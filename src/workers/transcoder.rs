use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::common::scratch::ScratchSpace;
use crate::infrastructure::storage::{StorageError, StorageGateway};
use crate::infrastructure::transcode::{TranscodeEngine, TranscodeError, TranscodeProfile};
use crate::modules::jobs::model::{Job, JobState};
use crate::modules::jobs::repository::{JobLedger, LedgerError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transcode(TranscodeError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("unknown transcode profile '{0}'")]
    UnknownProfile(String),

    #[error("cancelled by request")]
    Cancelled,
}

impl From<TranscodeError> for PipelineError {
    fn from(err: TranscodeError) -> Self {
        match err {
            TranscodeError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Transcode(other),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Storage(StorageError::Io(err))
    }
}

/// What the scheduler does with a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// FAILED, then back to PENDING for another attempt.
    Retry,
    /// FAILED for good.
    Fail,
    /// Another actor owns the job now; leave the ledger alone.
    Abandon,
    /// The ledger cannot persist state; halt the service.
    Fatal,
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Storage(StorageError::NotFound(_)) => "NotFound",
            PipelineError::Storage(StorageError::Transient(_)) => "TransientError",
            PipelineError::Storage(StorageError::Io(_)) => "IOError",
            PipelineError::Transcode(_) | PipelineError::UnknownProfile(_) => "TranscodeError",
            PipelineError::Ledger(_) => "ConflictError",
            PipelineError::Cancelled => "Cancelled",
        }
    }

    /// `lastError` text: the taxonomy name first, then the detail.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }

    pub fn disposition(&self, attempt: i32, max_attempts: i32, shutting_down: bool) -> Disposition {
        let within = |limit: i32| {
            if attempt < limit {
                Disposition::Retry
            } else {
                Disposition::Fail
            }
        };

        match self {
            PipelineError::Storage(StorageError::NotFound(_)) => Disposition::Fail,
            PipelineError::Storage(StorageError::Transient(_)) => within(max_attempts),
            // Local disk trouble gets one more go, then it is fatal for the job.
            PipelineError::Storage(StorageError::Io(_)) => within(max_attempts.min(2)),
            PipelineError::Transcode(TranscodeError::Spawn(_)) => within(max_attempts.min(2)),
            PipelineError::Transcode(_) => within(max_attempts),
            PipelineError::UnknownProfile(_) => Disposition::Fail,
            // Shutdown is not the caller's decision; the job goes back to PENDING.
            PipelineError::Cancelled if shutting_down => within(max_attempts),
            PipelineError::Cancelled => Disposition::Fail,
            PipelineError::Ledger(e) if e.is_durability_failure() => Disposition::Fatal,
            PipelineError::Ledger(_) => Disposition::Abandon,
        }
    }
}

/// A run that stopped early. `job` is the last ledger snapshot, so its
/// `state` is the stage that failed.
#[derive(Debug)]
pub struct JobFailure {
    pub job: Job,
    pub error: PipelineError,
}

/// Drives one job through DOWNLOADING → TRANSCODING → UPLOADING → DONE.
#[derive(Clone)]
pub struct TranscodeWorker {
    storage: Arc<dyn StorageGateway>,
    engine: Arc<dyn TranscodeEngine>,
    scratch: ScratchSpace,
}

impl TranscodeWorker {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        engine: Arc<dyn TranscodeEngine>,
        scratch: ScratchSpace,
    ) -> Self {
        Self {
            storage,
            engine,
            scratch,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageGateway> {
        &self.storage
    }

    pub fn scratch(&self) -> &ScratchSpace {
        &self.scratch
    }

    /// Process a PENDING job. Every transition is persisted before the side
    /// effect it announces, and scratch files are purged before the outcome is
    /// returned, whichever way the run ends.
    pub async fn run(
        &self,
        ledger: &dyn JobLedger,
        job: Job,
        cancel: &CancellationToken,
    ) -> Result<Job, JobFailure> {
        let Some(profile) = TranscodeProfile::named(&job.profile) else {
            let error = PipelineError::UnknownProfile(job.profile.clone());
            return Err(JobFailure { job, error });
        };

        let mut current = match ledger
            .transition(job.id, JobState::Pending, JobState::Downloading)
            .await
        {
            Ok(job) => job,
            Err(e) => return Err(JobFailure { job, error: e.into() }),
        };

        info!(
            job_id = %current.id,
            attempt = current.attempt,
            source = %current.source_key,
            "📦 Processing job"
        );

        let lease = match self
            .scratch
            .acquire(current.id, &current.source_key, &profile)
            .await
        {
            Ok(lease) => lease,
            Err(e) => return Err(JobFailure { job: current, error: e.into() }),
        };

        let outcome = self
            .run_stages(ledger, &mut current, &profile, lease.input(), lease.output(), cancel)
            .await;

        if let Err(e) = lease.release(self.storage.as_ref()).await {
            warn!(job_id = %current.id, error = %e, "Scratch cleanup incomplete");
        }

        if let Err(error) = outcome {
            return Err(JobFailure { job: current, error });
        }

        match ledger
            .transition(current.id, JobState::Uploading, JobState::Done)
            .await
        {
            Ok(done) => Ok(done),
            Err(e) => Err(JobFailure { job: current, error: e.into() }),
        }
    }

    async fn run_stages(
        &self,
        ledger: &dyn JobLedger,
        current: &mut Job,
        profile: &TranscodeProfile,
        input: &std::path::Path,
        output: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        info!(job_id = %current.id, key = %current.source_key, "⬇️ Downloading source");
        cancellable(cancel, self.storage.fetch(&current.source_key, input)).await?;

        *current = ledger
            .transition(current.id, JobState::Downloading, JobState::Transcoding)
            .await?;

        self.engine.transcode(input, output, profile, cancel).await?;

        *current = ledger
            .transition(current.id, JobState::Transcoding, JobState::Uploading)
            .await?;

        info!(job_id = %current.id, key = %current.destination_key, "⬆️ Publishing result");
        cancellable(cancel, self.storage.publish(output, &current.destination_key)).await?;

        Ok(())
    }
}

async fn cancellable<F>(cancel: &CancellationToken, fut: F) -> Result<(), PipelineError>
where
    F: Future<Output = Result<(), StorageError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        res = fut => res.map_err(PipelineError::from),
    }
}
