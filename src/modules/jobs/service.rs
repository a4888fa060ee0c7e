use std::time::Duration;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use super::dto::{CancelJobResponse, JobCreatedResponse, JobStatusResponse, SubmitJobRequest};
use super::model::{JobState, NewJob};
use super::repository::LedgerError;
use crate::infrastructure::transcode::TranscodeProfile;
use crate::state::AppState;
use crate::workers::scheduler::CancelOutcome;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Invalid(String),

    #[error("worker capacity exhausted")]
    Backpressure { retry_after: Duration },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job is already {0}")]
    AlreadyTerminal(JobState),

    #[error(transparent)]
    Ledger(LedgerError),
}

impl From<LedgerError> for CancelError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => CancelError::NotFound(id),
            other => CancelError::Ledger(other),
        }
    }
}

pub struct JobService;

impl JobService {
    /// Admit, durably record, then enqueue. Nothing is written when the
    /// scheduler is at capacity.
    pub async fn submit(state: AppState, req: SubmitJobRequest) -> Result<JobCreatedResponse, SubmitError> {
        req.validate().map_err(|e| SubmitError::Invalid(first_message(&e)))?;

        let profile_name = req
            .profile
            .unwrap_or_else(|| state.config.transcode_profile.clone());
        let profile = TranscodeProfile::named(&profile_name).ok_or_else(|| {
            SubmitError::Invalid(format!(
                "unknown profile '{}', expected one of {}",
                profile_name,
                TranscodeProfile::names().join(", ")
            ))
        })?;

        let (Some(source_key), Some(destination_key)) = (req.source_key, req.destination_key) else {
            return Err(SubmitError::Invalid("sourceKey and destinationKey are required".into()));
        };

        let admission = state
            .scheduler
            .try_admit()
            .map_err(|bp| SubmitError::Backpressure { retry_after: bp.retry_after })?;

        let job = state
            .ledger
            .create(NewJob {
                source_key,
                destination_key,
                profile: profile.name.to_string(),
                max_attempts: state.config.max_attempts,
            })
            .await?;

        info!(
            job_id = %job.id,
            source = %job.source_key,
            destination = %job.destination_key,
            profile = %job.profile,
            "📥 Job accepted"
        );

        state.scheduler.enqueue(admission, &job);
        Ok(JobCreatedResponse { id: job.id })
    }

    pub async fn status(state: AppState, id: Uuid) -> Result<Option<JobStatusResponse>, LedgerError> {
        let job = state.ledger.get(id).await?;
        Ok(job.map(JobStatusResponse::from))
    }

    pub async fn cancel(state: AppState, id: Uuid) -> Result<CancelJobResponse, CancelError> {
        match state.scheduler.cancel(id).await? {
            CancelOutcome::Cancelled => Ok(CancelJobResponse { id, in_flight: false }),
            CancelOutcome::Signalled => Ok(CancelJobResponse { id, in_flight: true }),
            CancelOutcome::AlreadyTerminal(state) => Err(CancelError::AlreadyTerminal(state)),
        }
    }
}

fn first_message(errors: &ValidationErrors) -> String {
    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));

    fields
        .into_iter()
        .flat_map(|(field, errs)| errs.iter().map(move |e| (field.clone(), e)))
        .next()
        .map(|(field, e)| match &e.message {
            Some(message) => message.to_string(),
            None => format!("{} is invalid", field),
        })
        .unwrap_or_else(|| "invalid request".to_string())
}
