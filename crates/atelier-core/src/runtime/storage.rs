use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::runtime::types::{
    Artifact, GenerationRequest, RuntimeError, Task, TaskFailure, TaskId, TaskState,
};

/// The complete in-memory record for a single submitted task.
#[derive(Debug)]
struct TaskRecord {
    id: TaskId,
    request: Arc<GenerationRequest>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    state: TaskState,
    /// Raised when the task fails, so a running engine can stop early.
    cancel_tx: watch::Sender<bool>,
}

impl TaskRecord {
    fn snapshot(&self) -> Task {
        Task {
            id: self.id,
            request: Arc::clone(&self.request),
            created_at: self.created_at,
            updated_at: self.updated_at,
            state: self.state.clone(),
        }
    }

    fn ensure_live(&self, action: &'static str) -> Result<(), RuntimeError> {
        if self.state.is_terminal() {
            return Err(RuntimeError::InvalidState {
                task_id: self.id,
                status: self.state.status(),
                action,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<TaskId, TaskRecord>,
    /// Insertion order, used for deterministic listing.
    order: Vec<TaskId>,
}

impl Inner {
    fn record_mut(&mut self, task_id: TaskId) -> Result<&mut TaskRecord, RuntimeError> {
        self.records
            .get_mut(&task_id)
            .ok_or_else(|| RuntimeError::NotFound {
                task_id: task_id.to_string(),
            })
    }
}

/// Centralized, thread-safe registry of every task in the process.
///
/// Uses a `tokio::sync::RwLock` so many readers can observe task state
/// concurrently while the worker updates it. The lock is only held for map
/// operations and never across an inference call. Every read returns an
/// owned [`Task`] snapshot.
#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    inner: Arc<RwLock<Inner>>,
}

impl TaskStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new [`TaskId`] and insert a `Pending` record.
    pub async fn create(&self, request: impl Into<Arc<GenerationRequest>>) -> TaskId {
        let task_id = TaskId::new();
        let now = Utc::now();
        let (cancel_tx, _cancel_rx) = watch::channel(false);

        let record = TaskRecord {
            id: task_id,
            request: request.into(),
            created_at: now,
            updated_at: now,
            state: TaskState::Pending,
            cancel_tx,
        };

        let mut guard = self.inner.write().await;
        guard.records.insert(task_id, record);
        guard.order.push(task_id);
        task_id
    }

    /// Record step progress, moving `Pending` to `InProgress` on first call.
    ///
    /// The first report fixes `total_steps` for the rest of the run; later
    /// totals are ignored. Progress never moves backwards and is clamped to
    /// that total. Fails with [`RuntimeError::InvalidState`] once the task is
    /// terminal, which callers treat as a late callback to drop.
    pub async fn update_progress(
        &self,
        task_id: TaskId,
        progress: u32,
        total_steps: u32,
    ) -> Result<(), RuntimeError> {
        let mut guard = self.inner.write().await;
        let record = guard.record_mut(task_id)?;
        record.ensure_live("update progress of")?;

        let (previous, total_steps) = match record.state {
            TaskState::InProgress {
                progress,
                total_steps,
            } => (progress, total_steps),
            _ => (0, total_steps),
        };
        record.state = TaskState::InProgress {
            progress: progress.max(previous).min(total_steps),
            total_steps,
        };
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Transition to `Completed` and attach the artifact.
    pub async fn complete(&self, task_id: TaskId, artifact: Artifact) -> Result<(), RuntimeError> {
        let mut guard = self.inner.write().await;
        let record = guard.record_mut(task_id)?;
        record.ensure_live("complete")?;

        record.state = TaskState::Completed { artifact };
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Transition to `Failed` with the given cause.
    ///
    /// Also raises the task's cancellation signal, so an engine still working
    /// on a timed-out or cancelled task can stop at its next step.
    pub async fn fail(&self, task_id: TaskId, error: TaskFailure) -> Result<(), RuntimeError> {
        let mut guard = self.inner.write().await;
        let record = guard.record_mut(task_id)?;
        record.ensure_live("fail")?;

        debug!(%task_id, %error, "task failed");
        record.state = TaskState::Failed { error };
        record.updated_at = Utc::now();
        record.cancel_tx.send_replace(true);
        Ok(())
    }

    /// Fail a non-terminal task with [`TaskFailure::Cancelled`].
    pub async fn cancel(&self, task_id: TaskId) -> Result<(), RuntimeError> {
        self.fail(task_id, TaskFailure::Cancelled).await
    }

    /// Return a snapshot of the task.
    pub async fn get(&self, task_id: TaskId) -> Result<Task, RuntimeError> {
        self.inner
            .read()
            .await
            .records
            .get(&task_id)
            .map(TaskRecord::snapshot)
            .ok_or_else(|| RuntimeError::NotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Return snapshots of every task, in creation order.
    pub async fn list(&self) -> Vec<Task> {
        let guard = self.inner.read().await;
        guard
            .order
            .iter()
            .filter_map(|id| guard.records.get(id))
            .map(TaskRecord::snapshot)
            .collect()
    }

    /// Subscribe to the task's cancellation signal.
    pub async fn cancel_signal(&self, task_id: TaskId) -> Option<watch::Receiver<bool>> {
        self.inner
            .read()
            .await
            .records
            .get(&task_id)
            .map(|r| r.cancel_tx.subscribe())
    }
}
