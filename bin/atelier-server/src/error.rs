//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON body of the form
//! `{"error": "..."}` with a matching status code.
//!
//! Engine and storage failures are logged in full, but callers only see a
//! generic message so file paths and device details stay private.

use atelier_core::RuntimeError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the generation runtime.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ServerError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Runtime(e) => match e {
                RuntimeError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
                RuntimeError::NotReady { .. }
                | RuntimeError::InvalidState { .. }
                | RuntimeError::Cancelled => (StatusCode::CONFLICT, e.to_string()),
                RuntimeError::InvalidRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
                RuntimeError::QueueFull { .. } | RuntimeError::WorkerShutdown => {
                    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
                }
                RuntimeError::Timeout(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                RuntimeError::Generation(_) => {
                    error!(error = %e, "generation failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "image generation failed".to_owned(),
                    )
                }
                RuntimeError::Storage(_) => {
                    error!(error = %e, "artifact storage failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "failed to save generated image".to_owned(),
                    )
                }
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = self.status_and_message();
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}
