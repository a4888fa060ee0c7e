use axum::routing::{get, post};
use axum::Router;
use crate::state::AppState;

pub mod dto;
pub mod handler;
pub mod memory;
pub mod model;
pub mod repository;
pub mod service;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(handler::submit_job))
        .route("/{id}", get(handler::get_job))
        .route("/{id}/cancel", post(handler::cancel_job))
}
