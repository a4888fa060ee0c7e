use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::model::{Job, JobState};
use crate::infrastructure::storage::validate_key;

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    #[validate(
        required(message = "sourceKey is required"),
        length(min = 1, max = 1024, message = "sourceKey must be 1-1024 characters"),
        custom(function = "object_key")
    )]
    pub source_key: Option<String>,

    #[validate(
        required(message = "destinationKey is required"),
        length(min = 1, max = 1024, message = "destinationKey must be 1-1024 characters"),
        custom(function = "object_key")
    )]
    pub destination_key: Option<String>,

    /// Transcode profile name; the server default when omitted.
    #[schema(example = "360p")]
    pub profile: Option<String>,
}

fn object_key(key: &str) -> Result<(), ValidationError> {
    validate_key(key).map_err(|reason| {
        let mut err = ValidationError::new("object_key");
        err.message = Some(reason.into());
        err
    })
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobCreatedResponse {
    pub id: Uuid,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub id: Uuid,
    pub state: JobState,
    pub attempt: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub source_key: String,
    pub destination_key: String,
    pub profile: String,
    pub max_attempts: i32,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            state: job.state,
            attempt: job.attempt,
            last_error: job.last_error,
            source_key: job.source_key,
            destination_key: job.destination_key,
            profile: job.profile,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelJobResponse {
    pub id: Uuid,
    /// `true` when the job was running and its worker had to be stopped.
    /// Either way the job is `FAILED` by the time this is returned.
    pub in_flight: bool,
}
