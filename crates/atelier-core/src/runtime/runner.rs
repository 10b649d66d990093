use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::artifact::ArtifactStore;
use crate::engine::{InferenceEngine, Progress, ProgressSink};
use crate::runtime::storage::TaskStore;
use crate::runtime::types::{
    Artifact, GenerationRequest, RuntimeError, TaskFailure, TaskId, TaskState,
};

/// Outcome delivered to a synchronous submitter.
type Outcome = Result<Artifact, TaskFailure>;

/// A unit of work on the worker's queue.
#[derive(Debug)]
struct Job {
    task_id: TaskId,
    request: Arc<GenerationRequest>,
    /// Present for synchronous submissions only.
    reply_tx: Option<oneshot::Sender<Outcome>>,
}

/// Tuning knobs for [`TaskRunner::start`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of queued (not yet running) tasks. Submissions beyond
    /// this are rejected with [`RuntimeError::QueueFull`]. Defaults to `64`.
    pub queue_capacity: usize,
    /// Fail a task whose engine call runs longer than this. Disabled by default.
    pub generation_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            generation_timeout: None,
        }
    }
}

/// A task that finished successfully, returned to synchronous submitters.
#[derive(Debug, Clone)]
pub struct CompletedTask {
    pub task_id: TaskId,
    pub request: Arc<GenerationRequest>,
    pub artifact: Artifact,
}

/// Accepts generation requests and runs them one at a time.
///
/// A single worker task drains a bounded FIFO queue. It is the only caller of
/// [`InferenceEngine::generate`], so the engine never sees two concurrent
/// calls. Synchronous and asynchronous submissions share that queue.
///
/// # Usage
///
/// ```rust,ignore
/// let runner = TaskRunner::start(engine, artifacts, RunnerConfig::default());
/// let task_id = runner.submit_async(GenerationRequest::new("mountain lake", 123, 23)).await?;
/// let task = runner.store().get(task_id).await?;
/// ```
#[derive(Clone)]
pub struct TaskRunner {
    store: TaskStore,
    engine: Arc<dyn InferenceEngine>,
    submit_tx: mpsc::Sender<Job>,
    capacity: usize,
    shutdown_tx: Arc<watch::Sender<bool>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("capacity", &self.capacity)
            .field("queued", &(self.capacity - self.submit_tx.capacity()))
            .finish()
    }
}

impl TaskRunner {
    /// Start the runner.
    ///
    /// Spawns the worker loop and returns a cloneable handle. Must be called
    /// inside a Tokio runtime.
    pub fn start(
        engine: Arc<dyn InferenceEngine>,
        artifacts: Arc<dyn ArtifactStore>,
        config: RunnerConfig,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (submit_tx, submit_rx) = mpsc::channel::<Job>(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = TaskStore::new();

        let worker = Worker {
            store: store.clone(),
            engine: Arc::clone(&engine),
            artifacts,
            timeout: config.generation_timeout,
        };
        let handle = tokio::spawn(worker.run(submit_rx, shutdown_rx));

        Self {
            store,
            engine,
            submit_tx,
            capacity,
            shutdown_tx: Arc::new(shutdown_tx),
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// The registry every task submitted through this runner lives in.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn engine_loaded(&self) -> bool {
        self.engine.is_loaded()
    }

    /// Enqueue a generation and return its id without waiting.
    pub async fn submit_async(&self, request: GenerationRequest) -> Result<TaskId, RuntimeError> {
        let task_id = self.enqueue(request, None).await?;
        info!(%task_id, "task queued");
        Ok(task_id)
    }

    /// Enqueue a generation and wait for it to finish.
    ///
    /// The task goes through the same FIFO queue as asynchronous ones and its
    /// record stays queryable afterwards.
    pub async fn submit_sync(&self, request: GenerationRequest) -> Result<CompletedTask, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let task_id = self.enqueue(request, Some(reply_tx)).await?;
        debug!(%task_id, "waiting on synchronous task");

        let artifact = reply_rx
            .await
            .map_err(|_| RuntimeError::WorkerShutdown)?
            .map_err(RuntimeError::from)?;
        let task = self.store.get(task_id).await?;

        Ok(CompletedTask {
            task_id,
            request: task.request,
            artifact,
        })
    }

    /// Cancel a task that has not finished yet.
    ///
    /// A queued task is skipped when the worker reaches it; a running one is
    /// told to stop through its [`ProgressSink`].
    pub async fn cancel(&self, task_id: TaskId) -> Result<(), RuntimeError> {
        self.store.cancel(task_id).await?;
        info!(%task_id, "task cancelled");
        Ok(())
    }

    /// Stop accepting work and wait for the worker to exit.
    ///
    /// The task currently running is allowed to finish; tasks still queued are
    /// failed with [`TaskFailure::WorkerShutdown`].
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "task worker panicked");
            }
        }
    }

    async fn enqueue(
        &self,
        request: GenerationRequest,
        reply_tx: Option<oneshot::Sender<Outcome>>,
    ) -> Result<TaskId, RuntimeError> {
        // Reserve the queue slot first so a rejected submission leaves no record.
        let permit = self.submit_tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => RuntimeError::QueueFull {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(()) => RuntimeError::WorkerShutdown,
        })?;

        let request = Arc::new(request);
        let task_id = self.store.create(Arc::clone(&request)).await;
        permit.send(Job {
            task_id,
            request,
            reply_tx,
        });
        Ok(task_id)
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

struct Worker {
    store: TaskStore,
    engine: Arc<dyn InferenceEngine>,
    artifacts: Arc<dyn ArtifactStore>,
    timeout: Option<Duration>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Job>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("task worker started");
        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                job = rx.recv() => match job {
                    Some(job) => self.handle(job).await,
                    None => break,
                },
            }
        }

        rx.close();
        while let Some(job) = rx.recv().await {
            self.abandon(job).await;
        }
        info!("task worker stopped");
    }

    async fn handle(&self, job: Job) {
        let Job {
            task_id,
            request,
            reply_tx,
        } = job;

        let outcome = self.execute(task_id, request).await;
        if let Some(tx) = reply_tx {
            let _ = tx.send(outcome);
        }
    }

    async fn abandon(&self, job: Job) {
        let outcome = match self.store.fail(job.task_id, TaskFailure::WorkerShutdown).await {
            Ok(()) => Err(TaskFailure::WorkerShutdown),
            Err(_) => self.settled_outcome(job.task_id).await,
        };
        if let Some(tx) = job.reply_tx {
            let _ = tx.send(outcome);
        }
    }

    /// Drive one task from `Pending` to a terminal state.
    async fn execute(&self, task_id: TaskId, request: Arc<GenerationRequest>) -> Outcome {
        let Some(cancel_rx) = self.store.cancel_signal(task_id).await else {
            return Err(TaskFailure::Generation(format!("task {task_id} vanished")));
        };

        // Cancelled while queued: nothing to run.
        if self.store.update_progress(task_id, 0, request.steps).await.is_err() {
            debug!(%task_id, "skipping task that finished while queued");
            return self.settled_outcome(task_id).await;
        }
        info!(%task_id, seed = request.seed, steps = request.steps, "generation started");

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<Progress>();
        let sink = ProgressSink::new(progress_tx, cancel_rx);
        let engine = Arc::clone(&self.engine);
        let engine_request = Arc::clone(&request);
        let mut call = tokio::task::spawn_blocking(move || {
            engine.load()?;
            engine.generate(&engine_request, &sink)
        });

        let deadline = self.timeout.map(|limit| (Instant::now() + limit, limit));
        let expiry = async move {
            match deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);
        let mut expired = false;

        // Keep applying progress while the blocking call runs. On timeout the
        // task is failed right away, but the call is still awaited so the
        // next task never overlaps with it.
        let joined = loop {
            tokio::select! {
                biased;

                Some(progress) = progress_rx.recv() => {
                    self.apply_progress(task_id, progress).await;
                }

                joined = &mut call => break joined,

                _ = &mut expiry, if !expired => {
                    expired = true;
                    if let Some((_, limit)) = deadline {
                        warn!(%task_id, ?limit, "generation timed out");
                        let _ = self.store.fail(task_id, TaskFailure::Timeout(limit)).await;
                    }
                }
            }
        };
        while let Ok(progress) = progress_rx.try_recv() {
            self.apply_progress(task_id, progress).await;
        }

        let image = match joined {
            Ok(Ok(image)) => image,
            Ok(Err(err)) => return self.record_failure(task_id, err.into()).await,
            Err(join_err) => {
                let failure = TaskFailure::Generation(format!("inference thread panicked: {join_err}"));
                return self.record_failure(task_id, failure).await;
            }
        };

        // Cancelled or timed out while the engine was finishing.
        if self.store.get(task_id).await.map(|t| t.is_terminal()).unwrap_or(true) {
            return self.settled_outcome(task_id).await;
        }

        let locator = match self.artifacts.save(task_id, &image).await {
            Ok(locator) => locator,
            Err(err) => {
                return self
                    .record_failure(task_id, TaskFailure::Storage(err.to_string()))
                    .await
            }
        };

        let artifact = Artifact {
            image: image.into(),
            locator,
            completed_at: chrono::Utc::now(),
        };
        match self.store.complete(task_id, artifact.clone()).await {
            Ok(()) => {
                info!(%task_id, locator = %artifact.locator, "generation completed");
                Ok(artifact)
            }
            Err(err) => {
                warn!(%task_id, error = %err, "task settled before completion was recorded");
                self.settled_outcome(task_id).await
            }
        }
    }

    async fn apply_progress(&self, task_id: TaskId, progress: Progress) {
        match self
            .store
            .update_progress(task_id, progress.step, progress.total)
            .await
        {
            Ok(()) => debug!(%task_id, step = progress.step, total = progress.total, "progress"),
            Err(err) => debug!(%task_id, error = %err, "dropping late progress"),
        }
    }

    async fn record_failure(&self, task_id: TaskId, failure: TaskFailure) -> Outcome {
        match self.store.fail(task_id, failure.clone()).await {
            Ok(()) => {
                warn!(%task_id, error = %failure, "generation failed");
                Err(failure)
            }
            Err(_) => self.settled_outcome(task_id).await,
        }
    }

    /// What the store says happened to a task that is already terminal.
    async fn settled_outcome(&self, task_id: TaskId) -> Outcome {
        match self.store.get(task_id).await {
            Ok(task) => match task.state {
                TaskState::Completed { artifact } => Ok(artifact),
                TaskState::Failed { error } => Err(error),
                TaskState::Pending | TaskState::InProgress { .. } => Err(TaskFailure::Generation(
                    format!("task {task_id} left unfinished"),
                )),
            },
            Err(err) => Err(TaskFailure::Generation(err.to_string())),
        }
    }
}
