use super::dto::{CancelJobResponse, JobCreatedResponse, JobStatusResponse, SubmitJobRequest};
use super::repository::LedgerError;
use super::service::{CancelError, JobService, SubmitError};
use crate::common::response::{ApiError, ApiResponse, TooManyRequests};
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;
use uuid::Uuid;

/// Ids that do not parse can never name a job.
fn job_id(raw: &str) -> Result<Uuid, Response> {
    raw.parse::<Uuid>()
        .map_err(|_| ApiError("Job not found".to_string(), StatusCode::NOT_FOUND).into_response())
}

/// Submit a transcode job
#[utoipa::path(
    post,
    path = "/jobs",
    request_body = SubmitJobRequest,
    responses(
        (status = 201, description = "Job accepted", body = JobCreatedResponse),
        (status = 400, description = "Missing or invalid keys", body = ApiResponse),
        (status = 429, description = "Worker capacity exhausted", body = ApiResponse, headers(
            ("Retry-After" = u64, description = "Seconds to wait before resubmitting")
        ))
    ),
    tag = "Jobs"
)]
pub async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return ApiError(rejection.body_text(), StatusCode::BAD_REQUEST).into_response(),
    };

    match JobService::submit(state, payload).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(SubmitError::Invalid(message)) => ApiError(message, StatusCode::BAD_REQUEST).into_response(),
        Err(SubmitError::Backpressure { retry_after }) => TooManyRequests {
            message: "Worker capacity exhausted, retry later".to_string(),
            retry_after,
        }
        .into_response(),
        Err(SubmitError::Ledger(e)) => {
            error!(error = %e, "Failed to record job");
            ApiError("Failed to record job".to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response()
        }
    }
}

/// Get job status
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job status", body = JobStatusResponse),
        (status = 404, description = "Job not found", body = ApiResponse)
    ),
    tag = "Jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match JobService::status(state, id).await {
        Ok(Some(status)) => Json(status).into_response(),
        Ok(None) => ApiError("Job not found".to_string(), StatusCode::NOT_FOUND).into_response(),
        Err(e) => {
            error!(job_id = %id, error = %e, "Failed to read job");
            ApiError(e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response()
        }
    }
}

/// Cancel a job
#[utoipa::path(
    post,
    path = "/jobs/{id}/cancel",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 202, description = "Job cancelled", body = CancelJobResponse),
        (status = 404, description = "Job not found", body = ApiResponse),
        (status = 409, description = "Job already finished", body = ApiResponse)
    ),
    tag = "Jobs"
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match job_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match JobService::cancel(state, id).await {
        Ok(cancelled) => (StatusCode::ACCEPTED, Json(cancelled)).into_response(),
        Err(CancelError::NotFound(_)) => {
            ApiError("Job not found".to_string(), StatusCode::NOT_FOUND).into_response()
        }
        Err(e @ CancelError::AlreadyTerminal(_)) => ApiError(e.to_string(), StatusCode::CONFLICT).into_response(),
        Err(CancelError::Ledger(e @ LedgerError::Conflict { .. })) => {
            ApiError(e.to_string(), StatusCode::CONFLICT).into_response()
        }
        Err(CancelError::Ledger(e)) => {
            error!(job_id = %id, error = %e, "Failed to cancel job");
            ApiError(e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response()
        }
    }
}
