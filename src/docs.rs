use utoipa::OpenApi;
use crate::common::response::ApiResponse;
use crate::modules::jobs::dto::*;
use crate::modules::jobs::model::JobState;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::modules::jobs::handler::submit_job,
        crate::modules::jobs::handler::get_job,
        crate::modules::jobs::handler::cancel_job,
    ),
    components(
        schemas(
            SubmitJobRequest, JobCreatedResponse, JobStatusResponse, CancelJobResponse, JobState, ApiResponse,
        )
    ),
    tags(
        (name = "Jobs", description = "Video transcode jobs")
    )
)]
pub struct ApiDoc;
