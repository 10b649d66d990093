#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc as std_mpsc, Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tracing_test::traced_test;

    use crate::artifact::{ArtifactStore, MemoryArtifactStore, StorageError};
    use crate::engine::{
        EngineError, InferenceEngine, ProceduralConfig, ProceduralEngine, ProgressSink,
    };
    use crate::runtime::runner::{RunnerConfig, TaskRunner};
    use crate::runtime::storage::TaskStore;
    use crate::runtime::types::{
        GenerationRequest, RuntimeError, Task, TaskFailure, TaskId, TaskStatus,
    };

    // ── Test engines ──────────────────────────────────────────────────────────

    /// Returns `img:<prompt>:<seed>` and fails any prompt containing "fail".
    /// Records call order and the highest number of overlapping calls.
    #[derive(Default)]
    struct ScriptedEngine {
        calls: Mutex<Vec<String>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ScriptedEngine {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl InferenceEngine for ScriptedEngine {
        fn load(&self) -> Result<(), EngineError> {
            Ok(())
        }

        fn is_loaded(&self) -> bool {
            true
        }

        fn generate(
            &self,
            request: &GenerationRequest,
            progress: &ProgressSink,
        ) -> Result<Vec<u8>, EngineError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(request.prompt.clone());

            for step in 1..=request.steps {
                std::thread::sleep(Duration::from_millis(1));
                progress.report(step, request.steps);
            }

            self.active.fetch_sub(1, Ordering::SeqCst);
            if request.prompt.contains("fail") {
                return Err(EngineError::Inference("boom: device lost".into()));
            }
            Ok(format!("img:{}:{}", request.prompt, request.seed).into_bytes())
        }
    }

    /// Blocks each call until the test releases it, or until cancelled.
    struct GatedEngine {
        release: Mutex<std_mpsc::Receiver<()>>,
        calls: Mutex<Vec<String>>,
    }

    impl GatedEngine {
        fn new() -> (Arc<Self>, std_mpsc::Sender<()>) {
            let (tx, rx) = std_mpsc::channel();
            let engine = Arc::new(Self {
                release: Mutex::new(rx),
                calls: Mutex::new(Vec::new()),
            });
            (engine, tx)
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl InferenceEngine for GatedEngine {
        fn load(&self) -> Result<(), EngineError> {
            Ok(())
        }

        fn is_loaded(&self) -> bool {
            true
        }

        fn generate(
            &self,
            request: &GenerationRequest,
            progress: &ProgressSink,
        ) -> Result<Vec<u8>, EngineError> {
            self.calls.lock().unwrap().push(request.prompt.clone());
            let release = self.release.lock().unwrap();
            loop {
                if progress.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                match release.recv_timeout(Duration::from_millis(5)) {
                    Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
                }
            }
            progress.report(request.steps, request.steps);
            Ok(request.prompt.clone().into_bytes())
        }
    }

    // ── Test stores ───────────────────────────────────────────────────────────

    /// Refuses any image whose bytes mention "unsaved"; keeps the rest in memory.
    #[derive(Default)]
    struct PickyArtifactStore {
        inner: MemoryArtifactStore,
    }

    #[async_trait]
    impl ArtifactStore for PickyArtifactStore {
        async fn save(&self, task_id: TaskId, image: &[u8]) -> Result<String, StorageError> {
            if image.windows(7).any(|w| w == b"unsaved") {
                return Err(StorageError::Poisoned);
            }
            self.inner.save(task_id, image).await
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn start(engine: Arc<dyn InferenceEngine>, config: RunnerConfig) -> TaskRunner {
        TaskRunner::start(engine, Arc::new(MemoryArtifactStore::new()), config)
    }

    async fn wait_for(store: &TaskStore, id: TaskId, pred: impl Fn(&Task) -> bool) -> Task {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = store.get(id).await.expect("task exists");
                if pred(&task) {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("task did not reach the expected state in time")
    }

    async fn wait_terminal(store: &TaskStore, id: TaskId) -> Task {
        wait_for(store, id, Task::is_terminal).await
    }

    async fn wait_running(store: &TaskStore, id: TaskId) -> Task {
        wait_for(store, id, |t| t.status() == TaskStatus::InProgress).await
    }

    // ── Submission ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn async_task_completes_with_requested_seed() {
        let runner = start(Arc::new(ScriptedEngine::default()), RunnerConfig::default());

        let id = runner
            .submit_async(GenerationRequest::new("mountain lake", 123, 4))
            .await
            .expect("submit");
        let task = wait_terminal(runner.store(), id).await;

        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.request.seed, 123);
        let artifact = task.artifact().expect("completed task has an artifact");
        assert_eq!(&artifact.image[..], b"img:mountain lake:123");
        assert_eq!(artifact.locator, format!("memory://{id}"));
        assert!(task.error().is_none());
    }

    #[tokio::test]
    async fn sync_submission_returns_artifact_and_keeps_record() {
        let runner = start(Arc::new(ScriptedEngine::default()), RunnerConfig::default());

        let done = runner
            .submit_sync(GenerationRequest::new("harbor at dusk", 5, 3))
            .await
            .expect("sync submit");
        assert_eq!(&done.artifact.image[..], b"img:harbor at dusk:5");
        assert_eq!(done.request.prompt, "harbor at dusk");

        let task = runner.store().get(done.task_id).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.artifact(), Some(&done.artifact));
    }

    #[tokio::test]
    async fn sync_submission_surfaces_engine_failure() {
        let runner = start(Arc::new(ScriptedEngine::default()), RunnerConfig::default());

        let err = runner
            .submit_sync(GenerationRequest::new("please fail", 1, 2))
            .await
            .unwrap_err();
        match err {
            RuntimeError::Generation(message) => assert!(message.contains("boom")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    // ── Worker loop ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn engine_failure_does_not_stop_the_worker() {
        let runner = start(Arc::new(ScriptedEngine::default()), RunnerConfig::default());

        let bad = runner
            .submit_async(GenerationRequest::new("fail this one", 1, 2))
            .await
            .unwrap();
        let good = runner
            .submit_async(GenerationRequest::new("then this one", 2, 2))
            .await
            .unwrap();

        let bad = wait_terminal(runner.store(), bad).await;
        assert_eq!(bad.status(), TaskStatus::Failed);
        let cause = bad.error().expect("failed task has a cause").to_string();
        assert!(cause.contains("boom"), "cause was {cause:?}");
        assert!(bad.artifact().is_none());

        let good = wait_terminal(runner.store(), good).await;
        assert_eq!(good.status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn storage_failure_is_recorded_and_the_worker_continues() {
        let runner = TaskRunner::start(
            Arc::new(ScriptedEngine::default()),
            Arc::new(PickyArtifactStore::default()),
            RunnerConfig::default(),
        );

        let err = runner
            .submit_sync(GenerationRequest::new("unsaved sketch", 1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Storage(_)), "unexpected error: {err:?}");

        let lost = runner
            .submit_async(GenerationRequest::new("unsaved study", 2, 2))
            .await
            .unwrap();
        let kept = runner
            .submit_async(GenerationRequest::new("kept study", 3, 2))
            .await
            .unwrap();

        let lost = wait_terminal(runner.store(), lost).await;
        assert_eq!(lost.status(), TaskStatus::Failed);
        assert!(matches!(lost.error(), Some(TaskFailure::Storage(_))));
        assert!(lost.artifact().is_none());

        let kept = wait_terminal(runner.store(), kept).await;
        assert_eq!(kept.status(), TaskStatus::Completed);
        assert_eq!(&kept.artifact().expect("artifact").image[..], b"img:kept study:3");
    }

    #[tokio::test]
    async fn tasks_run_one_at_a_time_in_submission_order() {
        let engine = Arc::new(ScriptedEngine::default());
        let runner = start(engine.clone(), RunnerConfig::default());

        let mut ids = Vec::new();
        for prompt in ["first", "second", "third", "fourth"] {
            ids.push(
                runner
                    .submit_async(GenerationRequest::new(prompt, 0, 3))
                    .await
                    .unwrap(),
            );
        }
        for id in &ids {
            wait_terminal(runner.store(), *id).await;
        }

        assert_eq!(engine.calls(), vec!["first", "second", "third", "fourth"]);
        assert_eq!(engine.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_submissions_each_reach_a_terminal_state() {
        let engine = Arc::new(ScriptedEngine::default());
        let runner = start(engine.clone(), RunnerConfig::default());

        let submits = (0..16).map(|i| {
            let runner = runner.clone();
            async move {
                runner
                    .submit_async(GenerationRequest::new(format!("prompt {i}"), i, 2))
                    .await
                    .expect("submit")
            }
        });
        let mut ids = futures::future::join_all(submits).await;

        for id in &ids {
            assert!(wait_terminal(runner.store(), *id).await.is_terminal());
        }

        let listed: Vec<TaskId> = runner.store().list().await.iter().map(|t| t.id).collect();
        assert_eq!(listed.len(), 16);
        ids.sort_by_key(|id| *id.as_uuid());
        ids.dedup();
        assert_eq!(ids.len(), 16);
        assert_eq!(engine.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn observed_progress_is_monotonic_and_bounded() {
        let engine = ProceduralEngine::new(ProceduralConfig {
            width: 16,
            height: 16,
            step_delay: Duration::from_millis(3),
            ..Default::default()
        });
        let runner = start(Arc::new(engine), RunnerConfig::default());
        let id = runner
            .submit_async(GenerationRequest::new("tide pools", 8, 12))
            .await
            .unwrap();

        let mut seen = Vec::new();
        let task = loop {
            let task = runner.store().get(id).await.unwrap();
            if let Some((progress, total)) = task.progress() {
                assert_eq!(total, 12);
                assert!(progress <= total);
                seen.push(progress);
            }
            if task.is_terminal() {
                break task;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        };

        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {seen:?}");
    }

    // ── Backpressure ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn full_queue_rejects_without_creating_a_task() {
        let (engine, release) = GatedEngine::new();
        let runner = start(
            engine,
            RunnerConfig {
                queue_capacity: 1,
                ..Default::default()
            },
        );

        let running = runner
            .submit_async(GenerationRequest::new("running", 0, 1))
            .await
            .unwrap();
        wait_running(runner.store(), running).await;
        let queued = runner
            .submit_async(GenerationRequest::new("queued", 0, 1))
            .await
            .unwrap();

        let err = runner
            .submit_async(GenerationRequest::new("rejected", 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::QueueFull { capacity: 1 }));
        assert_eq!(runner.store().list().await.len(), 2);

        release.send(()).unwrap();
        release.send(()).unwrap();
        assert_eq!(wait_terminal(runner.store(), running).await.status(), TaskStatus::Completed);
        assert_eq!(wait_terminal(runner.store(), queued).await.status(), TaskStatus::Completed);
    }

    // ── Cancellation, timeout and shutdown ────────────────────────────────────

    #[tokio::test]
    #[traced_test]
    async fn cancelled_pending_task_is_never_run() {
        let (engine, release) = GatedEngine::new();
        let runner = start(engine.clone(), RunnerConfig::default());

        let first = runner
            .submit_async(GenerationRequest::new("first", 0, 1))
            .await
            .unwrap();
        wait_running(runner.store(), first).await;
        let second = runner
            .submit_async(GenerationRequest::new("second", 0, 1))
            .await
            .unwrap();

        runner.cancel(second).await.expect("cancel pending");
        assert!(logs_contain("task cancelled"));
        release.send(()).unwrap();

        assert_eq!(wait_terminal(runner.store(), first).await.status(), TaskStatus::Completed);
        let second = wait_terminal(runner.store(), second).await;
        assert_eq!(second.error(), Some(&TaskFailure::Cancelled));

        // Give the worker a moment to reach (and skip) the cancelled job.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.calls(), vec!["first"]);

        let err = runner.cancel(first).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::InvalidState {
                status: TaskStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancelling_a_running_task_stops_the_engine() {
        let (engine, release) = GatedEngine::new();
        let runner = start(engine, RunnerConfig::default());

        let id = runner
            .submit_async(GenerationRequest::new("long", 0, 50))
            .await
            .unwrap();
        wait_running(runner.store(), id).await;
        runner.cancel(id).await.unwrap();

        let task = wait_terminal(runner.store(), id).await;
        assert_eq!(task.error(), Some(&TaskFailure::Cancelled));
        assert!(task.artifact().is_none());

        // Open the gate for good; the worker must be free for the next task.
        drop(release);
        let next = runner
            .submit_sync(GenerationRequest::new("after", 0, 1))
            .await
            .expect("worker survives a cancelled task");
        assert_eq!(&next.artifact.image[..], b"after");
        assert_eq!(
            runner.store().get(id).await.unwrap().error(),
            Some(&TaskFailure::Cancelled)
        );
    }

    #[tokio::test]
    async fn slow_generation_times_out() {
        let (engine, _release) = GatedEngine::new();
        let runner = start(
            engine,
            RunnerConfig {
                generation_timeout: Some(Duration::from_millis(30)),
                ..Default::default()
            },
        );

        let err = runner
            .submit_sync(GenerationRequest::new("stuck", 0, 4))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout(limit) if limit == Duration::from_millis(30)));

        let task = runner.store().list().await.pop().expect("task retained");
        assert_eq!(
            task.error(),
            Some(&TaskFailure::Timeout(Duration::from_millis(30)))
        );
    }

    #[tokio::test]
    async fn shutdown_finishes_running_task_and_fails_queued_ones() {
        let (engine, release) = GatedEngine::new();
        let runner = start(engine, RunnerConfig::default());

        let running = runner
            .submit_async(GenerationRequest::new("running", 0, 1))
            .await
            .unwrap();
        wait_running(runner.store(), running).await;
        let queued = runner
            .submit_async(GenerationRequest::new("queued", 0, 1))
            .await
            .unwrap();

        let stopping = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        release.send(()).unwrap();
        stopping.await.unwrap();

        let running = runner.store().get(running).await.unwrap();
        assert_eq!(running.status(), TaskStatus::Completed);
        let queued = runner.store().get(queued).await.unwrap();
        assert_eq!(queued.error(), Some(&TaskFailure::WorkerShutdown));

        let err = runner
            .submit_async(GenerationRequest::new("late", 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::WorkerShutdown));
    }
}
