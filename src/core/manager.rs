//! Download task orchestrator
//!
//! Owns the task table, the FIFO admission queue, and the global concurrency
//! limit. Tasks move through `Pending -> Queued -> Downloading -> {Completed |
//! Failed | Cancelled}`, with `Downloading <-> Paused` the only reversible
//! edge. At most `concurrent_tasks` pipelines run at once; a finishing task
//! immediately promotes the next queued one. All state changes are announced
//! on the event channel and mirrored to the persisted task store.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use url::Url;

use super::assembler;
use super::error_handling::DownloadError;
use super::external_downloader::{ExternalDownloader, ExternalDownloaderConfig};
use super::hls_downloader::{is_hls_source, HlsDownloader};
use super::models::{
    AcquisitionKind, AppError, AppResult, ControlFlags, DownloadConfig, DownloadStats,
    DownloadTask, ProgressUpdate, TaskStatus,
};
use super::path_safety::resolve_output_path;
use super::persistence::TaskStore;
use super::progress_tracker::TaskProgress;
use super::remux::FfmpegRemuxer;

/// Events published to the UI / embedding layer.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum DownloadEvent {
    TaskCreated {
        task_id: String,
        task: DownloadTask,
    },
    TaskQueued {
        task_id: String,
    },
    TaskStarted {
        task_id: String,
    },
    TaskProgress {
        task_id: String,
        progress: ProgressUpdate,
    },
    TaskCompleted {
        task_id: String,
        file_path: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    TaskPaused {
        task_id: String,
    },
    TaskResumed {
        task_id: String,
    },
    TaskCancelled {
        task_id: String,
    },
    TaskRemoved {
        task_id: String,
    },
    StatsUpdated {
        stats: DownloadStats,
    },
}

/// Channel for communication between download manager and UI
pub type EventSender = mpsc::UnboundedSender<DownloadEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<DownloadEvent>;

/// Admission request for a new task.
#[derive(Debug, Clone, Default)]
pub struct NewTaskRequest {
    pub source: String,
    pub display_name: Option<String>,
    /// Destination directory relative to the download root
    pub subdir: Option<String>,
    /// Output file name; derived from the source URL when absent
    pub output_name: Option<String>,
}

/// Strategy seam between the orchestrator and the per-task pipelines.
#[async_trait]
pub trait AcquisitionBackend: Send + Sync {
    async fn run(
        &self,
        task: DownloadTask,
        flags: ControlFlags,
        progress: Arc<TaskProgress>,
    ) -> Result<(), DownloadError>;
}

/// Production backend: direct HLS pipeline plus the external-tool delegate.
pub struct DefaultBackend {
    config: Arc<DownloadConfig>,
    hls: HlsDownloader,
    external: ExternalDownloader,
}

impl DefaultBackend {
    pub fn new(
        config: Arc<DownloadConfig>,
        external_config: ExternalDownloaderConfig,
    ) -> AppResult<Self> {
        let remuxer = Arc::new(FfmpegRemuxer::new(config.ffmpeg_path.clone()));
        let hls = HlsDownloader::new(Arc::clone(&config), remuxer)?;
        Ok(Self {
            config,
            hls,
            external: ExternalDownloader::new(external_config),
        })
    }
}

#[async_trait]
impl AcquisitionBackend for DefaultBackend {
    async fn run(
        &self,
        task: DownloadTask,
        flags: ControlFlags,
        progress: Arc<TaskProgress>,
    ) -> Result<(), DownloadError> {
        let final_path = task.final_path();
        match task.kind {
            AcquisitionKind::Hls => {
                self.hls
                    .download(&task.id, &task.source, &final_path, &flags, &progress)
                    .await
            }
            AcquisitionKind::External => {
                let staging_dir = self.config.temp_dir.join(&task.id);
                let ext = Path::new(&task.output_name)
                    .extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_else(|| "mp4".to_string());
                let staging = staging_dir.join(format!("external.{ext}"));

                let result = self
                    .external
                    .download(&task.source, &staging, &flags, &progress)
                    .await;

                match result {
                    Ok(()) => {
                        assembler::publish(&staging, &final_path).await?;
                        assembler::cleanup_dir(&staging_dir).await;
                        Ok(())
                    }
                    Err(e) => {
                        // The delegate cannot resume mid-file, so pause and
                        // cancel both discard the partial output.
                        assembler::cleanup_dir(&staging_dir).await;
                        Err(e)
                    }
                }
            }
        }
    }
}

struct ManagerInner {
    config: Arc<DownloadConfig>,
    backend: Arc<dyn AcquisitionBackend>,

    /// Map of all download tasks
    tasks: RwLock<HashMap<String, DownloadTask>>,
    /// FIFO admission queue of task ids waiting for a slot
    queue: parking_lot::Mutex<VecDeque<String>>,
    /// Stop flags of currently running pipelines
    flags: parking_lot::Mutex<HashMap<String, ControlFlags>>,
    /// Semaphore enforcing the global concurrent-task limit
    slots: Arc<Semaphore>,

    events: EventSender,
    progress_tx: mpsc::UnboundedSender<ProgressUpdate>,
    store: Option<TaskStore>,
}

/// Main download manager that orchestrates all download operations.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl DownloadManager {
    pub fn new(
        config: Arc<DownloadConfig>,
        backend: Arc<dyn AcquisitionBackend>,
        store: Option<TaskStore>,
    ) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ManagerInner {
            slots: Arc::new(Semaphore::new(config.concurrent_tasks.max(1))),
            config,
            backend,
            tasks: RwLock::new(HashMap::new()),
            queue: parking_lot::Mutex::new(VecDeque::new()),
            flags: parking_lot::Mutex::new(HashMap::new()),
            events,
            progress_tx,
            store,
        });

        tokio::spawn(forward_progress(Arc::clone(&inner), progress_rx));

        (Self { inner }, receiver)
    }

    /// Convenience constructor wiring up the production backend.
    pub fn with_default_backend(
        config: DownloadConfig,
        external: ExternalDownloaderConfig,
        store: Option<TaskStore>,
    ) -> AppResult<(Self, EventReceiver)> {
        let config = Arc::new(config);
        let backend = Arc::new(DefaultBackend::new(Arc::clone(&config), external)?);
        Ok(Self::new(config, backend, store))
    }

    /// Load the persisted task table. Tasks interrupted mid-download come
    /// back as `Paused`, queued ones fall back to `Pending`; nothing starts
    /// running on its own.
    pub async fn restore(&self) -> AppResult<usize> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };

        let mut loaded = store.load().await?;
        for task in &mut loaded {
            match task.status {
                TaskStatus::Downloading => {
                    task.status = TaskStatus::Paused;
                    task.message = Some("interrupted by shutdown".to_string());
                    task.speed = 0.0;
                    task.eta = None;
                }
                TaskStatus::Queued => task.status = TaskStatus::Pending,
                _ => {}
            }
        }

        let count = loaded.len();
        {
            let mut tasks = self.inner.tasks.write().await;
            for task in loaded {
                tasks.insert(task.id.clone(), task);
            }
        }
        info!(count, "restored persisted tasks");
        Ok(count)
    }

    /// Admit a new task. Validates the source URL and the destination path
    /// before anything touches the network; duplicates of a live task are
    /// rejected.
    pub async fn enqueue(&self, request: NewTaskRequest) -> AppResult<DownloadTask> {
        // Sources arrive percent-encoded from copy-pasted links; decode once
        let source = percent_decode(request.source.trim());
        Url::parse(&source).map_err(|e| AppError::Config(format!("invalid source URL: {e}")))?;

        if self.has_live_source(&source).await {
            return Err(AppError::Config(format!(
                "a task for this source already exists: {source}"
            )));
        }

        let kind = if is_hls_source(&source) {
            AcquisitionKind::Hls
        } else {
            AcquisitionKind::External
        };

        let name_hint = request
            .output_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| derive_output_name(&source));
        let subdir = PathBuf::from(request.subdir.unwrap_or_default());

        let final_path = resolve_output_path(&self.inner.config.download_root, &subdir, &name_hint)?;
        let output_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| AppError::Config("output path has no file name".to_string()))?;
        let destination_dir = final_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| AppError::Config("output path has no parent".to_string()))?;

        let task = DownloadTask {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: request.display_name.unwrap_or_else(|| output_name.clone()),
            source,
            destination_dir,
            output_name,
            kind,
            status: TaskStatus::Pending,
            progress_percent: 0.0,
            bytes_done: 0,
            bytes_total: None,
            speed: 0.0,
            eta: None,
            message: None,
            created_at: chrono::Utc::now(),
            completed_at: None,
        };

        {
            let mut tasks = self.inner.tasks.write().await;
            tasks.insert(task.id.clone(), task.clone());
        }

        info!(task_id = %task.id, kind = ?task.kind, "task created");
        self.inner.emit(DownloadEvent::TaskCreated {
            task_id: task.id.clone(),
            task: task.clone(),
        });
        self.inner.emit_stats().await;
        self.inner.persist().await;
        Ok(task)
    }

    /// Queue a task for download. Valid from `Pending`, `Paused`, and
    /// `Failed` (retry); a no-op when it is already queued or running.
    pub async fn start_task(&self, task_id: &str) -> AppResult<()> {
        let previous = {
            let mut tasks = self.inner.tasks.write().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| AppError::Config(format!("unknown task: {task_id}")))?;

            match task.status {
                TaskStatus::Pending | TaskStatus::Paused | TaskStatus::Failed => {
                    let previous = task.status;
                    task.status = TaskStatus::Queued;
                    task.message = None;
                    task.speed = 0.0;
                    task.eta = None;
                    previous
                }
                TaskStatus::Queued | TaskStatus::Downloading => return Ok(()),
                TaskStatus::Completed | TaskStatus::Cancelled => {
                    return Err(AppError::Config(format!(
                        "task {task_id} already finished"
                    )))
                }
            }
        };

        self.inner.queue.lock().push_back(task_id.to_string());

        if previous == TaskStatus::Paused {
            self.inner.emit(DownloadEvent::TaskResumed {
                task_id: task_id.to_string(),
            });
        }
        self.inner.emit(DownloadEvent::TaskQueued {
            task_id: task_id.to_string(),
        });
        self.inner.emit_stats().await;
        self.inner.persist().await;

        Arc::clone(&self.inner).pump().await;
        Ok(())
    }

    /// Pause a task. Running pipelines stop within one retry cycle and keep
    /// their partial assembly for resume; queued tasks leave the queue
    /// immediately.
    pub async fn pause_task(&self, task_id: &str) -> AppResult<()> {
        // Decided under the same table lock `pump` claims with, so a task
        // cannot slip from Queued into Downloading between the status check
        // and the transition.
        let paused_in_queue = {
            let mut tasks = self.inner.tasks.write().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| AppError::Config(format!("unknown task: {task_id}")))?;
            match task.status {
                TaskStatus::Downloading => {
                    if let Some(flags) = self.inner.flags.lock().get(task_id) {
                        flags.request_pause();
                    }
                    debug!(task_id, "pause requested");
                    false
                }
                TaskStatus::Queued => {
                    task.status = TaskStatus::Paused;
                    task.message = None;
                    task.speed = 0.0;
                    task.eta = None;
                    true
                }
                _ => false,
            }
        };

        if paused_in_queue {
            self.inner.queue.lock().retain(|id| id != task_id);
            self.inner.emit(DownloadEvent::TaskPaused {
                task_id: task_id.to_string(),
            });
            self.inner.emit_stats().await;
            self.inner.persist().await;
        }
        Ok(())
    }

    /// Resume a paused (or failed) task.
    pub async fn resume_task(&self, task_id: &str) -> AppResult<()> {
        self.start_task(task_id).await
    }

    /// Cancel a task. Terminal; the partial assembly is discarded.
    pub async fn cancel_task(&self, task_id: &str) -> AppResult<()> {
        // Same critical section as the `pump` claim; see `pause_task`.
        let cancelled_before_start = {
            let mut tasks = self.inner.tasks.write().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| AppError::Config(format!("unknown task: {task_id}")))?;
            match task.status {
                TaskStatus::Downloading => {
                    if let Some(flags) = self.inner.flags.lock().get(task_id) {
                        flags.request_cancel();
                    }
                    debug!(task_id, "cancel requested");
                    false
                }
                TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Paused => {
                    task.status = TaskStatus::Cancelled;
                    task.message = None;
                    task.speed = 0.0;
                    task.eta = None;
                    true
                }
                _ => false,
            }
        };

        if cancelled_before_start {
            self.inner.queue.lock().retain(|id| id != task_id);
            assembler::cleanup_dir(&self.inner.config.temp_dir.join(task_id)).await;
            self.inner.emit(DownloadEvent::TaskCancelled {
                task_id: task_id.to_string(),
            });
            self.inner.emit_stats().await;
            self.inner.persist().await;
        }
        Ok(())
    }

    /// Remove a task record entirely, cancelling it first if necessary.
    pub async fn remove_task(&self, task_id: &str) -> AppResult<()> {
        {
            let mut tasks = self.inner.tasks.write().await;
            let task = tasks
                .get(task_id)
                .ok_or_else(|| AppError::Config(format!("unknown task: {task_id}")))?;
            if task.status == TaskStatus::Downloading {
                if let Some(flags) = self.inner.flags.lock().get(task_id) {
                    flags.request_cancel();
                }
            }
            tasks.remove(task_id);
        }
        self.inner.queue.lock().retain(|id| id != task_id);
        assembler::cleanup_dir(&self.inner.config.temp_dir.join(task_id)).await;

        self.inner.emit(DownloadEvent::TaskRemoved {
            task_id: task_id.to_string(),
        });
        self.inner.emit_stats().await;
        self.inner.persist().await;
        Ok(())
    }

    /// Drop all terminal task records; returns how many were removed.
    pub async fn cleanup_finished(&self) -> usize {
        let removed: Vec<String> = {
            let mut tasks = self.inner.tasks.write().await;
            let ids: Vec<String> = tasks
                .values()
                .filter(|t| t.status.is_terminal())
                .map(|t| t.id.clone())
                .collect();
            for id in &ids {
                tasks.remove(id);
            }
            ids
        };

        for task_id in &removed {
            self.inner.emit(DownloadEvent::TaskRemoved {
                task_id: task_id.clone(),
            });
        }
        if !removed.is_empty() {
            self.inner.emit_stats().await;
            self.inner.persist().await;
        }
        removed.len()
    }

    /// Queue every pending task.
    pub async fn start_all_pending(&self) -> AppResult<usize> {
        let ids = self.ids_with_status(TaskStatus::Pending).await;
        for id in &ids {
            self.start_task(id).await?;
        }
        Ok(ids.len())
    }

    /// Pause everything that is queued or running.
    pub async fn pause_all(&self) -> AppResult<usize> {
        let mut ids = self.ids_with_status(TaskStatus::Queued).await;
        ids.extend(self.ids_with_status(TaskStatus::Downloading).await);
        for id in &ids {
            self.pause_task(id).await?;
        }
        Ok(ids.len())
    }

    /// Re-queue every paused task.
    pub async fn resume_all(&self) -> AppResult<usize> {
        let ids = self.ids_with_status(TaskStatus::Paused).await;
        for id in &ids {
            self.start_task(id).await?;
        }
        Ok(ids.len())
    }

    /// Cancel every non-terminal task.
    pub async fn cancel_all(&self) -> AppResult<usize> {
        let ids: Vec<String> = {
            let tasks = self.inner.tasks.read().await;
            tasks
                .values()
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.id.clone())
                .collect()
        };
        for id in &ids {
            self.cancel_task(id).await?;
        }
        Ok(ids.len())
    }

    /// Re-queue every failed task; returns how many were retried.
    pub async fn retry_failed(&self) -> AppResult<usize> {
        let ids = self.ids_with_status(TaskStatus::Failed).await;
        for id in &ids {
            self.start_task(id).await?;
        }
        Ok(ids.len())
    }

    /// All tasks, oldest first.
    pub async fn get_tasks(&self) -> Vec<DownloadTask> {
        let tasks = self.inner.tasks.read().await;
        let mut list: Vec<DownloadTask> = tasks.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub async fn get_task(&self, task_id: &str) -> Option<DownloadTask> {
        self.inner.tasks.read().await.get(task_id).cloned()
    }

    pub async fn get_stats(&self) -> DownloadStats {
        self.inner.compute_stats().await
    }

    async fn ids_with_status(&self, status: TaskStatus) -> Vec<String> {
        let tasks = self.inner.tasks.read().await;
        let mut ids: Vec<(chrono::DateTime<chrono::Utc>, String)> = tasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| (t.created_at, t.id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    async fn has_live_source(&self, source: &str) -> bool {
        let tasks = self.inner.tasks.read().await;
        tasks
            .values()
            .any(|t| t.source == source && !t.status.is_terminal())
    }
}

impl ManagerInner {
    /// Fill free slots from the queue front. Every finishing pipeline calls
    /// this again, so a released slot is handed on immediately.
    ///
    /// Returns a boxed future to break the pump -> run_task -> pump cycle
    /// in `Send` auto-trait inference.
    fn pump(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
        loop {
            let permit = match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let task_id = { self.queue.lock().pop_front() };
            let Some(task_id) = task_id else {
                // Slot freed with nothing queued
                drop(permit);
                return;
            };

            // Claim and flag registration are atomic under the table lock:
            // a pause/cancel that loses the race to this claim still finds
            // the flags of the pipeline it now addresses.
            let claimed = {
                let mut tasks = self.tasks.write().await;
                match tasks.get_mut(&task_id) {
                    Some(task) if task.status == TaskStatus::Queued => {
                        task.status = TaskStatus::Downloading;
                        let flags = ControlFlags::new();
                        self.flags.lock().insert(task_id.clone(), flags.clone());
                        Some(flags)
                    }
                    // Cancelled or removed while waiting in the queue
                    _ => None,
                }
            };
            let Some(flags) = claimed else {
                drop(permit);
                continue;
            };

            self.emit(DownloadEvent::TaskStarted {
                task_id: task_id.clone(),
            });
            self.emit_stats().await;

            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                inner.run_task(task_id, flags, permit).await;
            });
        }
        })
    }

    /// Drive one pipeline to a terminal (or paused) state, then hand the
    /// slot to the next queued task.
    async fn run_task(self: Arc<Self>, task_id: String, flags: ControlFlags, permit: OwnedSemaphorePermit) {
        let task = { self.tasks.read().await.get(&task_id).cloned() };
        let Some(task) = task else {
            drop(permit);
            return;
        };

        info!(task_id, source = %task.source, kind = ?task.kind, "download started");
        let progress = Arc::new(TaskProgress::new(task_id.clone(), self.progress_tx.clone()));

        let result = self
            .backend
            .run(task.clone(), flags.clone(), Arc::clone(&progress))
            .await;
        progress.flush();
        let snapshot = progress.snapshot();

        {
            let mut tasks = self.tasks.write().await;
            if let Some(record) = tasks.get_mut(&task_id) {
                record.bytes_done = snapshot.bytes_done;
                record.bytes_total = snapshot.bytes_total;
                record.progress_percent = record.progress_percent.max(snapshot.progress_percent);
                record.speed = 0.0;
                record.eta = None;

                match &result {
                    Ok(()) => {
                        record.status = TaskStatus::Completed;
                        record.progress_percent = 100.0;
                        record.completed_at = Some(chrono::Utc::now());
                        record.message = None;
                    }
                    Err(DownloadError::Paused) => {
                        record.status = TaskStatus::Paused;
                        record.message = Some("paused".to_string());
                    }
                    Err(DownloadError::Cancelled) => {
                        record.status = TaskStatus::Cancelled;
                        record.message = None;
                    }
                    Err(e) => {
                        record.status = TaskStatus::Failed;
                        record.message = Some(e.to_string());
                    }
                }
            }
        }
        self.flags.lock().remove(&task_id);

        match result {
            Ok(()) => {
                let file_path = task.final_path().display().to_string();
                info!(task_id, file_path, "download completed");
                self.emit(DownloadEvent::TaskCompleted { task_id, file_path });
            }
            Err(DownloadError::Paused) => {
                info!(task_id, "download paused");
                self.emit(DownloadEvent::TaskPaused { task_id });
            }
            Err(DownloadError::Cancelled) => {
                info!(task_id, "download cancelled");
                self.emit(DownloadEvent::TaskCancelled { task_id });
            }
            Err(e) => {
                error!(task_id, error = %e, "download failed");
                self.emit(DownloadEvent::TaskFailed {
                    task_id,
                    error: e.to_string(),
                });
            }
        }

        self.emit_stats().await;
        self.persist().await;

        // Free the slot before refilling, or the pump sees it as taken
        drop(permit);
        self.pump().await;
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }

    async fn compute_stats(&self) -> DownloadStats {
        let tasks = self.tasks.read().await;
        let mut stats = DownloadStats {
            total_tasks: tasks.len(),
            ..Default::default()
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Queued => stats.queued_tasks += 1,
                TaskStatus::Downloading => stats.active_downloads += 1,
                TaskStatus::Completed => stats.completed_tasks += 1,
                TaskStatus::Failed => stats.failed_tasks += 1,
                _ => {}
            }
            stats.total_downloaded += task.bytes_done;
        }
        stats
    }

    async fn emit_stats(&self) {
        let stats = self.compute_stats().await;
        self.emit(DownloadEvent::StatsUpdated { stats });
    }

    async fn snapshot_tasks(&self) -> Vec<DownloadTask> {
        let tasks = self.tasks.read().await;
        let mut list: Vec<DownloadTask> = tasks.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    async fn persist(&self) {
        if let Some(store) = &self.store {
            let tasks = self.snapshot_tasks().await;
            if let Err(e) = store.save(&tasks).await {
                warn!(error = %e, "failed to persist task table");
            }
        }
    }
}

/// Mirror pipeline progress into the task table and the event stream.
async fn forward_progress(
    inner: Arc<ManagerInner>,
    mut rx: mpsc::UnboundedReceiver<ProgressUpdate>,
) {
    while let Some(update) = rx.recv().await {
        let known = {
            let mut tasks = inner.tasks.write().await;
            match tasks.get_mut(&update.task_id) {
                Some(task) if task.status == TaskStatus::Downloading => {
                    task.progress_percent = task.progress_percent.max(update.progress_percent);
                    task.bytes_done = update.bytes_done;
                    task.bytes_total = update.bytes_total;
                    task.speed = update.speed;
                    task.eta = update.eta;
                    true
                }
                _ => false,
            }
        };
        if !known {
            continue;
        }

        inner.emit(DownloadEvent::TaskProgress {
            task_id: update.task_id.clone(),
            progress: update,
        });

        if let Some(store) = &inner.store {
            let tasks = inner.snapshot_tasks().await;
            store.save_throttled(&tasks).await;
        }
    }
}

/// Decode a percent-encoded URL once. Invalid escapes pass through verbatim.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            // Both hex digits are ASCII, so the slice is on char boundaries
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Default output file name from the source URL's last path segment.
fn derive_output_name(source: &str) -> String {
    let segment = Url::parse(source)
        .ok()
        .and_then(|url| {
            url.path_segments().and_then(|segments| {
                segments
                    .filter(|s| !s.is_empty())
                    .last()
                    .map(|s| s.to_string())
            })
        })
        .unwrap_or_default();

    let stem = Path::new(&segment)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "video".to_string());

    format!("{stem}.mp4")
}
