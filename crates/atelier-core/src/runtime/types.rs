use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a submitted generation task.
///
/// Identifiers are random v4 UUIDs and are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Parameters of one generation call, captured when the task is submitted.
///
/// Defaults (seed, step count) are resolved before this snapshot is taken, so
/// a task always reflects the values that were in force at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub seed: u64,
    pub steps: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, seed: u64, steps: u32) -> Self {
        Self {
            prompt: prompt.into(),
            seed,
            steps,
        }
    }
}

/// A persisted generation result.
///
/// `image` shares its buffer on clone, so handing snapshots to readers never
/// copies the encoded image.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// Encoded image bytes as produced by the engine.
    pub image: Bytes,
    /// Where the [`ArtifactStore`](crate::artifact::ArtifactStore) put it.
    pub locator: String,
    pub completed_at: DateTime<Utc>,
}

/// Cause recorded on a task that ended in [`TaskStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskFailure {
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("artifact storage failed: {0}")]
    Storage(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("task worker shut down before the task ran")]
    WorkerShutdown,
}

/// Lifecycle state of a task, carrying the data each state owns.
///
/// Keeping the artifact and the failure cause inside the variants means a
/// task can never hold both, or hold either while still running.
#[derive(Debug, Clone)]
pub enum TaskState {
    /// Accepted and queued; the worker has not picked it up yet.
    Pending,
    /// The engine is running; `progress` counts finished steps.
    InProgress { progress: u32, total_steps: u32 },
    /// Generation succeeded and the artifact was persisted.
    Completed { artifact: Artifact },
    /// Generation, persistence, or the surrounding system ended the task.
    Failed { error: TaskFailure },
}

impl TaskState {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskState::Pending => TaskStatus::Pending,
            TaskState::InProgress { .. } => TaskStatus::InProgress,
            TaskState::Completed { .. } => TaskStatus::Completed,
            TaskState::Failed { .. } => TaskStatus::Failed,
        }
    }

    /// Returns `true` for `Completed` and `Failed`; no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Coarse status label reported to API callers.
///
/// Variants are declared in lifecycle order, so `Ord` matches the direction
/// tasks are allowed to move in.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// An owned, point-in-time copy of a task record.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub request: Arc<GenerationRequest>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: TaskState,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// `(progress, total_steps)` while the task is running.
    pub fn progress(&self) -> Option<(u32, u32)> {
        match self.state {
            TaskState::InProgress {
                progress,
                total_steps,
            } => Some((progress, total_steps)),
            _ => None,
        }
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        match &self.state {
            TaskState::Completed { artifact } => Some(artifact),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TaskFailure> {
        match &self.state {
            TaskState::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Errors produced by the runtime layer.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// The referenced task does not exist (or the id is not a task id).
    #[error("task not found: {task_id}")]
    NotFound { task_id: String },

    /// A result was requested for a task that has not completed.
    #[error("task {task_id} has no result yet (status: {status})")]
    NotReady { task_id: TaskId, status: TaskStatus },

    /// A mutation was attempted on a task that is already terminal.
    #[error("cannot {action} task {task_id}: already {status}")]
    InvalidState {
        task_id: TaskId,
        status: TaskStatus,
        action: &'static str,
    },

    /// The submitted parameters were rejected before a task was created.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The inference engine reported an error.
    #[error("generation failed: {0}")]
    Generation(String),

    /// The artifact could not be persisted.
    #[error("artifact storage failed: {0}")]
    Storage(String),

    /// The submission queue is at capacity.
    #[error("task queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The worker has stopped and no longer accepts work.
    #[error("task worker shut down")]
    WorkerShutdown,

    /// The task was cancelled before it produced a result.
    #[error("task cancelled")]
    Cancelled,

    /// The generation call exceeded its deadline.
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<TaskFailure> for RuntimeError {
    fn from(failure: TaskFailure) -> Self {
        match failure {
            TaskFailure::Generation(message) => RuntimeError::Generation(message),
            TaskFailure::Storage(message) => RuntimeError::Storage(message),
            TaskFailure::Cancelled => RuntimeError::Cancelled,
            TaskFailure::Timeout(limit) => RuntimeError::Timeout(limit),
            TaskFailure::WorkerShutdown => RuntimeError::WorkerShutdown,
        }
    }
}
