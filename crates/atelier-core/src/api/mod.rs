//! Public-facing facade for atelier-core.
//!
//! Transports (the HTTP server, tests, a CLI) talk to [`Studio`] only. It
//! resolves defaults, validates parameters, and turns task records into the
//! views callers see. Task ids arrive as strings; anything that does not
//! parse as an id is reported as [`RuntimeError::NotFound`].
//!
//! # Quick-start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use atelier_core::api::{GenerateParams, GenerationDefaults, Studio};
//! use atelier_core::artifact::MemoryArtifactStore;
//! use atelier_core::engine::{ProceduralConfig, ProceduralEngine};
//! use atelier_core::{RunnerConfig, TaskRunner};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let runner = TaskRunner::start(
//!     Arc::new(ProceduralEngine::new(ProceduralConfig::default())),
//!     Arc::new(MemoryArtifactStore::new()),
//!     RunnerConfig::default(),
//! );
//! let studio = Studio::new(runner, GenerationDefaults::default());
//!
//! let receipt = studio
//!     .submit_async(GenerateParams::new("mountain lake").seed(123))
//!     .await
//!     .unwrap();
//! let status = studio.get_status(&receipt.task_id.to_string()).await.unwrap();
//! println!("{} is {}", status.task_id, status.status);
//! # }
//! ```
mod types;

use std::sync::{Arc, RwLock};

pub use crate::runtime::types::{RuntimeError, TaskId, TaskStatus};
use crate::runtime::runner::TaskRunner;
use crate::runtime::types::{GenerationRequest, Task, TaskState};
pub use types::{
    GenerateParams, GenerationDefaults, GenerationOutput, SubmitReceipt, TaskStatusView,
    TaskSummary,
};

#[derive(Debug, Clone)]
pub struct Studio {
    runner: TaskRunner,
    defaults: Arc<RwLock<GenerationDefaults>>,
}

impl Studio {
    pub fn new(runner: TaskRunner, defaults: GenerationDefaults) -> Self {
        Self {
            runner,
            defaults: Arc::new(RwLock::new(defaults)),
        }
    }

    pub fn defaults(&self) -> GenerationDefaults {
        match self.defaults.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Replace the defaults applied to future submissions. Tasks already
    /// submitted keep the values captured when they were created.
    pub fn set_defaults(&self, defaults: GenerationDefaults) {
        match self.defaults.write() {
            Ok(mut guard) => *guard = defaults,
            Err(poisoned) => *poisoned.into_inner() = defaults,
        }
    }

    /// Generate and wait for the image.
    pub async fn submit_sync(&self, params: GenerateParams) -> Result<GenerationOutput, RuntimeError> {
        let request = self.resolve(params)?;
        let done = self.runner.submit_sync(request).await?;
        Ok(GenerationOutput {
            task_id: done.task_id,
            image: done.artifact.image,
            locator: done.artifact.locator,
            prompt: done.request.prompt.clone(),
            seed: done.request.seed,
            steps: done.request.steps,
            completed_at: done.artifact.completed_at,
        })
    }

    /// Queue a generation and return at once.
    pub async fn submit_async(&self, params: GenerateParams) -> Result<SubmitReceipt, RuntimeError> {
        let request = self.resolve(params)?;
        let task_id = self.runner.submit_async(request).await?;
        Ok(SubmitReceipt {
            task_id,
            status: TaskStatus::Pending,
        })
    }

    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatusView, RuntimeError> {
        let task = self.lookup(task_id).await?;
        Ok(TaskStatusView::from(&task))
    }

    /// The finished image of a completed task.
    ///
    /// Fails with [`RuntimeError::NotReady`] for any task that is not
    /// `Completed`, including failed ones.
    pub async fn get_result(&self, task_id: &str) -> Result<GenerationOutput, RuntimeError> {
        let task = self.lookup(task_id).await?;
        match task.state {
            TaskState::Completed { artifact } => Ok(GenerationOutput {
                task_id: task.id,
                image: artifact.image,
                locator: artifact.locator,
                prompt: task.request.prompt.clone(),
                seed: task.request.seed,
                steps: task.request.steps,
                completed_at: artifact.completed_at,
            }),
            state => Err(RuntimeError::NotReady {
                task_id: task.id,
                status: state.status(),
            }),
        }
    }

    pub async fn list_tasks(&self) -> Vec<TaskSummary> {
        self.runner
            .store()
            .list()
            .await
            .iter()
            .map(TaskSummary::from)
            .collect()
    }

    /// Cancel a pending or running task and return its new status.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskStatusView, RuntimeError> {
        let id = parse_task_id(task_id)?;
        self.runner.cancel(id).await?;
        self.get_status(task_id).await
    }

    pub fn model_loaded(&self) -> bool {
        self.runner.engine_loaded()
    }

    /// Stop the worker. Queued tasks fail; the running one finishes.
    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
    }

    fn resolve(&self, params: GenerateParams) -> Result<GenerationRequest, RuntimeError> {
        let prompt = params.prompt.trim();
        if prompt.is_empty() {
            return Err(RuntimeError::InvalidRequest("prompt must not be empty".into()));
        }
        let defaults = self.defaults();
        let steps = params.steps.unwrap_or(defaults.steps);
        if steps == 0 {
            return Err(RuntimeError::InvalidRequest("steps must be at least 1".into()));
        }
        Ok(GenerationRequest::new(
            prompt,
            params.seed.unwrap_or(defaults.seed),
            steps,
        ))
    }

    async fn lookup(&self, task_id: &str) -> Result<Task, RuntimeError> {
        let id = parse_task_id(task_id)?;
        self.runner.store().get(id).await
    }
}

fn parse_task_id(task_id: &str) -> Result<TaskId, RuntimeError> {
    task_id.parse().map_err(|_| RuntimeError::NotFound {
        task_id: task_id.to_owned(),
    })
}
