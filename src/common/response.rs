use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

/// Body of every error response. Successful responses carry their DTO bare.
#[derive(Serialize, ToSchema)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
}

impl ApiResponse {
    pub fn error(message: &str) -> Self {
        Self {
            status: "error".to_string(),
            message: message.to_string(),
        }
    }
}

pub struct ApiError(pub String, pub StatusCode);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (message, status) = (self.0, self.1);
        let response = ApiResponse::error(&message);
        (status, Json(response)).into_response()
    }
}

/// `429 Too Many Requests` with a `Retry-After` header in whole seconds.
pub struct TooManyRequests {
    pub message: String,
    pub retry_after: Duration,
}

impl IntoResponse for TooManyRequests {
    fn into_response(self) -> Response {
        let seconds = self.retry_after.as_secs().max(1);
        let mut response = ApiError(self.message, StatusCode::TOO_MANY_REQUESTS).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        response
    }
}
