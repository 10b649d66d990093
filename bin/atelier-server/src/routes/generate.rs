//! Image generation endpoints.

use std::sync::Arc;

use atelier_core::api::{GenerateParams, GenerationOutput, SubmitReceipt};
use atelier_core::TaskId;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tracing::info;

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/generate", post(generate))
        .route("/generate/async", post(generate_async))
        .route("/generate-async", post(generate_async))
}

/// Body shared by the synchronous endpoint and task result lookups.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub image_base64: String,
    pub file_path: String,
    pub prompt: String,
    pub seed: u64,
    pub steps: u32,
    /// Completion time formatted as `YYYYmmdd_HHMMSS`.
    pub timestamp: String,
    pub task_id: TaskId,
}

impl From<GenerationOutput> for GenerateResponse {
    fn from(output: GenerationOutput) -> Self {
        Self {
            image_base64: STANDARD.encode(&output.image),
            file_path: output.locator,
            prompt: output.prompt,
            seed: output.seed,
            steps: output.steps,
            timestamp: output.completed_at.format("%Y%m%d_%H%M%S").to_string(),
            task_id: output.task_id,
        }
    }
}

/// Generate an image and wait for it.
pub async fn generate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerateParams>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ServerError> {
    let Json(params) = payload.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    info!(prompt = %params.prompt, seed = ?params.seed, "sync generation requested");

    let output = state.studio.submit_sync(params).await?;
    Ok(Json(GenerateResponse::from(output)))
}

/// Queue an image generation and return its task id.
pub async fn generate_async(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerateParams>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitReceipt>), ServerError> {
    let Json(params) = payload.map_err(|e| ServerError::BadRequest(e.body_text()))?;

    let receipt = state.studio.submit_async(params).await?;
    info!(task_id = %receipt.task_id, "async generation queued");
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}
