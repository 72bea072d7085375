//! Download manager integration tests
//!
//! Drives the orchestrator with a controllable in-process backend instead of
//! real pipelines: each "download" blocks until the test releases it, so the
//! tests can observe the queue, the concurrency limit, and the pause/cancel
//! edges deterministically.

#[cfg(test)]
mod tests {
    use super::super::assembler;
    use super::super::error_handling::DownloadError;
    use super::super::manager::{
        AcquisitionBackend, DownloadManager, EventReceiver, NewTaskRequest,
    };
    use super::super::models::{
        AppError, ControlFlags, DownloadConfig, DownloadTask, TaskStatus,
    };
    use super::super::persistence::TaskStore;
    use super::super::progress_tracker::TaskProgress;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::Semaphore;

    /// Backend whose runs block until the test hands out a completion permit.
    /// Stop flags are polled, so pause/cancel behave like the real pipelines.
    struct GatedBackend {
        gate: Semaphore,
    }

    impl GatedBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
            })
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
    }

    #[async_trait]
    impl AcquisitionBackend for GatedBackend {
        async fn run(
            &self,
            _task: DownloadTask,
            flags: ControlFlags,
            progress: Arc<TaskProgress>,
        ) -> Result<(), DownloadError> {
            loop {
                flags.check()?;
                if let Ok(permit) = self.gate.try_acquire() {
                    permit.forget();
                    progress.complete();
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    /// Backend that stages bytes the way a real pipeline would and publishes
    /// them to the final path on success, so cancellation tests can assert
    /// that nothing ever reaches the destination.
    struct PublishingBackend {
        gate: Semaphore,
        temp_dir: std::path::PathBuf,
    }

    impl PublishingBackend {
        fn new(temp_dir: std::path::PathBuf) -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                temp_dir,
            })
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
    }

    #[async_trait]
    impl AcquisitionBackend for PublishingBackend {
        async fn run(
            &self,
            task: DownloadTask,
            flags: ControlFlags,
            progress: Arc<TaskProgress>,
        ) -> Result<(), DownloadError> {
            let staging_dir = self.temp_dir.join(&task.id);
            tokio::fs::create_dir_all(&staging_dir)
                .await
                .map_err(DownloadError::assembly_io)?;
            let staging = staging_dir.join("media.ts");
            tokio::fs::write(&staging, b"partial bytes")
                .await
                .map_err(DownloadError::assembly_io)?;

            loop {
                if let Err(e) = flags.check() {
                    assembler::cleanup_dir(&staging_dir).await;
                    return Err(e);
                }
                if let Ok(permit) = self.gate.try_acquire() {
                    permit.forget();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            assembler::publish(&staging, &task.final_path()).await?;
            assembler::cleanup_dir(&staging_dir).await;
            progress.complete();
            Ok(())
        }
    }

    fn test_config(root: &std::path::Path) -> DownloadConfig {
        DownloadConfig {
            download_root: root.join("out"),
            temp_dir: root.join("tmp"),
            concurrent_tasks: 3,
            ..Default::default()
        }
    }

    async fn setup() -> (
        DownloadManager,
        Arc<GatedBackend>,
        EventReceiver,
        tempfile::TempDir,
    ) {
        let dir = tempdir().unwrap();
        let backend = GatedBackend::new();
        let config = Arc::new(test_config(dir.path()));
        let (manager, events) = DownloadManager::new(config, backend.clone(), None);
        (manager, backend, events, dir)
    }

    async fn enqueue_n(manager: &DownloadManager, n: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for i in 0..n {
            let task = manager
                .enqueue(NewTaskRequest {
                    source: format!("https://cdn.example.com/v{i}/index.m3u8"),
                    ..Default::default()
                })
                .await
                .unwrap();
            ids.push(task.id);
        }
        ids
    }

    async fn count_status(manager: &DownloadManager, status: TaskStatus) -> usize {
        manager
            .get_tasks()
            .await
            .iter()
            .filter(|t| t.status == status)
            .count()
    }

    /// Wait until the predicate holds or the deadline passes.
    async fn wait_for<F, Fut>(mut predicate: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if predicate().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }

    #[tokio::test]
    async fn concurrency_limit_admits_exactly_three() {
        let (manager, backend, _events, _dir) = setup().await;
        let ids = enqueue_n(&manager, 5).await;

        for id in &ids {
            manager.start_task(id).await.unwrap();
        }

        wait_for(|| async { count_status(&manager, TaskStatus::Downloading).await == 3 }).await;
        assert_eq!(count_status(&manager, TaskStatus::Queued).await, 2);

        // One completion promotes exactly one queued task
        backend.release(1);
        wait_for(|| async { count_status(&manager, TaskStatus::Completed).await == 1 }).await;
        wait_for(|| async { count_status(&manager, TaskStatus::Downloading).await == 3 }).await;
        assert_eq!(count_status(&manager, TaskStatus::Queued).await, 1);

        // Drain the rest
        backend.release(4);
        wait_for(|| async { count_status(&manager, TaskStatus::Completed).await == 5 }).await;

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_tasks, 5);
        assert_eq!(stats.completed_tasks, 5);
        assert_eq!(stats.active_downloads, 0);
    }

    #[tokio::test]
    async fn pause_frees_the_slot_and_resume_requeues() {
        let (manager, backend, _events, _dir) = setup().await;
        let ids = enqueue_n(&manager, 4).await;
        for id in &ids {
            manager.start_task(id).await.unwrap();
        }
        wait_for(|| async { count_status(&manager, TaskStatus::Downloading).await == 3 }).await;

        // Find one running task and pause it
        let running_id = manager
            .get_tasks()
            .await
            .into_iter()
            .find(|t| t.status == TaskStatus::Downloading)
            .unwrap()
            .id;
        manager.pause_task(&running_id).await.unwrap();

        wait_for(|| {
            let manager = manager.clone();
            let id = running_id.clone();
            async move {
                manager.get_task(&id).await.unwrap().status == TaskStatus::Paused
            }
        })
        .await;
        // The freed slot went to the queued task
        wait_for(|| async { count_status(&manager, TaskStatus::Downloading).await == 3 }).await;
        assert_eq!(count_status(&manager, TaskStatus::Queued).await, 0);

        // Resume puts it back through the queue
        manager.resume_task(&running_id).await.unwrap();
        wait_for(|| async { count_status(&manager, TaskStatus::Queued).await == 1 }).await;

        backend.release(4);
        wait_for(|| async { count_status(&manager, TaskStatus::Completed).await == 4 }).await;
    }

    #[tokio::test]
    async fn cancelled_task_is_terminal_and_produces_no_file() {
        let dir = tempdir().unwrap();
        let backend = PublishingBackend::new(dir.path().join("tmp"));
        let config = Arc::new(test_config(dir.path()));
        let (manager, _events) = DownloadManager::new(config, backend.clone(), None);

        let ids = enqueue_n(&manager, 1).await;
        manager.start_task(&ids[0]).await.unwrap();

        // Wait until the pipeline has staged partial bytes
        let staging = dir.path().join("tmp").join(&ids[0]).join("media.ts");
        wait_for(|| {
            let staging = staging.clone();
            async move { staging.exists() }
        })
        .await;

        manager.cancel_task(&ids[0]).await.unwrap();
        wait_for(|| {
            let manager = manager.clone();
            let id = ids[0].clone();
            async move {
                manager.get_task(&id).await.unwrap().status == TaskStatus::Cancelled
            }
        })
        .await;

        // The staged partial is discarded, nothing reaches the destination
        let task = manager.get_task(&ids[0]).await.unwrap();
        assert!(!task.final_path().exists());
        assert!(!staging.exists());

        // Terminal: restarting a cancelled task is rejected, and a late
        // completion permit changes nothing
        assert!(manager.start_task(&ids[0]).await.is_err());
        backend.release(1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let task = manager.get_task(&ids[0]).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(!task.final_path().exists());
    }

    /// Start and cancel issued back to back from separate tasks: whichever
    /// side wins the queue claim, the cancel must reach the pipeline and
    /// nothing may land at the destination.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_racing_admission_never_publishes() {
        for _ in 0..20 {
            let dir = tempdir().unwrap();
            let backend = PublishingBackend::new(dir.path().join("tmp"));
            let config = Arc::new(test_config(dir.path()));
            let (manager, _events) = DownloadManager::new(config, backend.clone(), None);

            let ids = enqueue_n(&manager, 1).await;
            let starter = {
                let manager = manager.clone();
                let id = ids[0].clone();
                tokio::spawn(async move {
                    // Loses to the cancel when that one lands first
                    let _ = manager.start_task(&id).await;
                })
            };
            manager.cancel_task(&ids[0]).await.unwrap();
            starter.await.unwrap();

            wait_for(|| {
                let manager = manager.clone();
                let id = ids[0].clone();
                async move {
                    manager.get_task(&id).await.unwrap().status == TaskStatus::Cancelled
                }
            })
            .await;

            // A completion permit afterwards must not revive the run
            backend.release(1);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let task = manager.get_task(&ids[0]).await.unwrap();
            assert_eq!(task.status, TaskStatus::Cancelled);
            assert!(!task.final_path().exists());
        }
    }

    #[tokio::test]
    async fn queued_cancel_never_starts_the_pipeline() {
        let (manager, _backend, _events, _dir) = setup().await;
        let ids = enqueue_n(&manager, 4).await;
        for id in &ids {
            manager.start_task(id).await.unwrap();
        }
        wait_for(|| async { count_status(&manager, TaskStatus::Queued).await == 1 }).await;

        let queued_id = manager
            .get_tasks()
            .await
            .into_iter()
            .find(|t| t.status == TaskStatus::Queued)
            .unwrap()
            .id;
        manager.cancel_task(&queued_id).await.unwrap();

        assert_eq!(
            manager.get_task(&queued_id).await.unwrap().status,
            TaskStatus::Cancelled
        );
        // The slot count is unchanged: cancelling a queued task frees nothing
        assert_eq!(count_status(&manager, TaskStatus::Downloading).await, 3);
    }

    #[tokio::test]
    async fn duplicate_live_source_is_rejected() {
        let (manager, backend, _events, _dir) = setup().await;
        let ids = enqueue_n(&manager, 1).await;

        let err = manager
            .enqueue(NewTaskRequest {
                source: "https://cdn.example.com/v0/index.m3u8".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        // Once the first task is terminal the same source is accepted again
        manager.start_task(&ids[0]).await.unwrap();
        backend.release(1);
        wait_for(|| async { count_status(&manager, TaskStatus::Completed).await == 1 }).await;

        manager
            .enqueue(NewTaskRequest {
                source: "https://cdn.example.com/v0/index.m3u8".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn traversal_destination_is_rejected_before_any_work() {
        let (manager, _backend, _events, _dir) = setup().await;

        let err = manager
            .enqueue(NewTaskRequest {
                source: "https://cdn.example.com/v/index.m3u8".to_string(),
                subdir: Some("../../outside".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Download(DownloadError::OutputPath { .. })
        ));
        assert!(manager.get_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn restore_maps_interrupted_states() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("tasks.json");

        // First manager run: persist tasks in various states
        {
            let backend = GatedBackend::new();
            let config = Arc::new(test_config(dir.path()));
            let (manager, _events) = DownloadManager::new(
                config,
                backend.clone(),
                Some(TaskStore::new(store_path.clone())),
            );
            let ids = enqueue_n(&manager, 4).await;
            manager.start_task(&ids[0]).await.unwrap();
            manager.start_task(&ids[1]).await.unwrap();
            wait_for(|| async { count_status(&manager, TaskStatus::Downloading).await == 2 }).await;

            backend.release(1);
            wait_for(|| async { count_status(&manager, TaskStatus::Completed).await == 1 }).await;
            // Leave one Downloading, one Completed, two Pending on "shutdown"
        }

        // Second run: interrupted downloads come back paused, nothing runs
        let backend = GatedBackend::new();
        let config = Arc::new(test_config(dir.path()));
        let (manager, _events) =
            DownloadManager::new(config, backend, Some(TaskStore::new(store_path)));
        let restored = manager.restore().await.unwrap();
        assert_eq!(restored, 4);

        assert_eq!(count_status(&manager, TaskStatus::Paused).await, 1);
        assert_eq!(count_status(&manager, TaskStatus::Completed).await, 1);
        assert_eq!(count_status(&manager, TaskStatus::Pending).await, 2);
        assert_eq!(count_status(&manager, TaskStatus::Downloading).await, 0);

        let paused = manager
            .get_tasks()
            .await
            .into_iter()
            .find(|t| t.status == TaskStatus::Paused)
            .unwrap();
        assert_eq!(paused.message.as_deref(), Some("interrupted by shutdown"));
    }

    #[tokio::test]
    async fn retry_failed_requeues_only_failures() {
        let dir = tempdir().unwrap();

        /// Backend that fails every run with a retryable-looking error.
        struct FailingBackend;
        #[async_trait]
        impl AcquisitionBackend for FailingBackend {
            async fn run(
                &self,
                _task: DownloadTask,
                _flags: ControlFlags,
                _progress: Arc<TaskProgress>,
            ) -> Result<(), DownloadError> {
                Err(DownloadError::ManifestFetch {
                    message: "HTTP 500 (3 attempts)".to_string(),
                })
            }
        }

        let config = Arc::new(test_config(dir.path()));
        let (manager, _events) = DownloadManager::new(config, Arc::new(FailingBackend), None);

        let ids = enqueue_n(&manager, 2).await;
        manager.start_task(&ids[0]).await.unwrap();
        wait_for(|| async { count_status(&manager, TaskStatus::Failed).await == 1 }).await;

        let failed = manager.get_task(&ids[0]).await.unwrap();
        assert!(failed.message.unwrap().contains("HTTP 500"));

        // Only the failed task goes back to the queue; the pending one stays
        let retried = manager.retry_failed().await.unwrap();
        assert_eq!(retried, 1);
        wait_for(|| async { count_status(&manager, TaskStatus::Failed).await == 1 }).await;
        assert_eq!(count_status(&manager, TaskStatus::Pending).await, 1);
    }
}
