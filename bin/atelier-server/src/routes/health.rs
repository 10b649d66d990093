//! Service info and health endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::state::AppState;

/// Routes mounted at the root (`/`).
pub fn root_router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(service_info))
}

/// Routes mounted under `/api`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

pub async fn service_info() -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status":  "running",
    }))
}

/// Returns `{"status": "ok", "model_loaded": bool}` with HTTP 200.
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status":       "ok",
        "model_loaded": state.studio.model_loaded(),
    }))
}
