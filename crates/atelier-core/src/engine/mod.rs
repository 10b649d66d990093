//! Inference engine seam.
//!
//! The model call itself lives behind [`InferenceEngine`]. The runner only
//! ever calls it from one blocking thread at a time, so implementations do
//! not need their own serialization.

mod procedural;

pub use procedural::{ProceduralConfig, ProceduralEngine};

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::runtime::types::{GenerationRequest, TaskFailure};

/// All errors an engine can report.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `generate` was called before the model was loaded.
    #[error("model not loaded")]
    NotLoaded,

    /// The model could not be loaded.
    #[error("model load failed: {0}")]
    LoadFailed(String),

    /// The request parameters are outside what the model accepts.
    #[error("invalid generation params: {0}")]
    InvalidParams(String),

    /// The caller raised the cancellation signal mid-generation.
    #[error("generation cancelled")]
    Cancelled,

    /// Encoding the generated image failed.
    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),

    /// Any other model/runtime failure.
    #[error("{0}")]
    Inference(String),
}

impl From<EngineError> for TaskFailure {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Cancelled => TaskFailure::Cancelled,
            other => TaskFailure::Generation(other.to_string()),
        }
    }
}

/// One progress report: `step` of `total` steps have finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub step: u32,
    pub total: u32,
}

/// Side channel handed to [`InferenceEngine::generate`].
///
/// Reports flow one way, from the engine thread to the worker, which applies
/// them to the task store. Reporting never blocks the engine.
#[derive(Debug)]
pub struct ProgressSink {
    progress_tx: mpsc::UnboundedSender<Progress>,
    cancel_rx: watch::Receiver<bool>,
}

impl ProgressSink {
    pub fn new(
        progress_tx: mpsc::UnboundedSender<Progress>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            progress_tx,
            cancel_rx,
        }
    }

    /// A sink nobody listens to and that is never cancelled.
    pub fn detached() -> Self {
        let (progress_tx, _) = mpsc::unbounded_channel();
        let (_, cancel_rx) = watch::channel(false);
        Self::new(progress_tx, cancel_rx)
    }

    /// Report that `step` of `total` steps are done.
    pub fn report(&self, step: u32, total: u32) {
        // The worker may already have moved on; a closed channel is fine.
        let _ = self.progress_tx.send(Progress { step, total });
    }

    /// Whether the task this call belongs to has been cancelled or timed out.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }
}

/// A blocking image-synthesis model.
pub trait InferenceEngine: Send + Sync {
    /// Load weights. Must be idempotent; the runner calls it before every
    /// generation in case startup preloading was skipped.
    fn load(&self) -> Result<(), EngineError>;

    fn is_loaded(&self) -> bool;

    /// Run one generation and return encoded image bytes.
    ///
    /// Implementations should call [`ProgressSink::report`] after each step
    /// and return [`EngineError::Cancelled`] once
    /// [`ProgressSink::is_cancelled`] turns true.
    fn generate(
        &self,
        request: &GenerationRequest,
        progress: &ProgressSink,
    ) -> Result<Vec<u8>, EngineError>;
}
