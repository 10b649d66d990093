//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use atelier_core::api::Studio;

use crate::config::Config;

#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (file + env derived).
    pub config: Arc<Config>,
    /// Entry point to the generation runtime.
    pub studio: Studio,
}
