//! Task inspection and control endpoints.
//!
//! Ids that do not parse as task ids are answered with 404, the same as ids
//! that were never issued.

use std::sync::Arc;

use atelier_core::api::{TaskStatusView, TaskSummary};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::error::ServerError;
use crate::routes::generate::GenerateResponse;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/result", get(get_task_result))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/task/{id}", get(get_task))
        .route("/result/{id}", get(get_task_result))
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskSummary>,
}

pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<TaskListResponse> {
    Json(TaskListResponse {
        tasks: state.studio.list_tasks().await,
    })
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusView>, ServerError> {
    Ok(Json(state.studio.get_status(&id).await?))
}

pub async fn get_task_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<GenerateResponse>, ServerError> {
    let output = state.studio.get_result(&id).await?;
    Ok(Json(GenerateResponse::from(output)))
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusView>, ServerError> {
    let view = state.studio.cancel(&id).await?;
    info!(task_id = %id, "task cancelled via API");
    Ok(Json(view))
}
