use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::types::{Task, TaskId, TaskStatus};

/// Caller-supplied generation parameters. Missing fields fall back to
/// [`GenerationDefaults`] at submission time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateParams {
    pub prompt: String,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub steps: Option<u32>,
}

impl GenerateParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationDefaults {
    pub seed: u64,
    pub steps: u32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self { seed: 42, steps: 23 }
    }
}

/// A finished generation, as handed back by `submit_sync` and `get_result`.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub task_id: TaskId,
    pub image: Bytes,
    pub locator: String,
    pub prompt: String,
    pub seed: u64,
    pub steps: u32,
    pub completed_at: DateTime<Utc>,
}

/// Immediate answer to an asynchronous submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Task> for TaskStatusView {
    fn from(task: &Task) -> Self {
        let progress = task.progress();
        Self {
            task_id: task.id,
            status: task.status(),
            progress: progress.map(|(step, _)| step),
            total_steps: progress.map(|(_, total)| total),
            created_at: task.created_at,
            error: task.error().map(ToString::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub status: TaskStatus,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            status: task.status(),
            prompt: task.request.prompt.clone(),
            created_at: task.created_at,
        }
    }
}
