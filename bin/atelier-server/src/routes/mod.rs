//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - `GET /` service info
//! - `/api` generation, task and health routes
//! - CORS and per-request trace-id middleware

mod generate;
mod health;
mod tasks;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use tower::ServiceBuilder;

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .merge(health::router())
        .merge(generate::router())
        .merge(tasks::router());

    Router::new()
        .merge(health::root_router())
        .nest("/api", api_router)
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(&state.config)))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}
