//! Task list persistence
//!
//! The whole task table is serialized to one JSON file so the queue
//! survives restarts. Writes go through a temp-file rename so a crash
//! mid-save never corrupts the previous snapshot, and frequent progress
//! updates are throttled to at most one save per interval.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::models::{AppError, AppResult, DownloadTask};

/// Minimum interval between throttled saves.
const SAVE_INTERVAL: Duration = Duration::from_secs(2);

/// JSON-file-backed store for the task table.
pub struct TaskStore {
    path: PathBuf,
    last_save: Mutex<Option<Instant>>,
}

impl TaskStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_save: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load the persisted task table. A missing file is an empty table, a
    /// corrupt one is reported so the caller can decide to start fresh.
    pub async fn load(&self) -> AppResult<Vec<DownloadTask>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Io(e)),
        };

        let tasks: Vec<DownloadTask> = serde_json::from_slice(&raw)
            .map_err(|e| AppError::Config(format!("corrupt task store: {e}")))?;
        debug!(count = tasks.len(), "loaded persisted tasks");
        Ok(tasks)
    }

    /// Unconditionally persist the task table (atomic temp-file rename).
    pub async fn save(&self, tasks: &[DownloadTask]) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let raw = serde_json::to_vec_pretty(tasks)
            .map_err(|e| AppError::System(format!("task serialization failed: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        *self.last_save.lock() = Some(Instant::now());
        Ok(())
    }

    /// Persist unless a save already went out within the throttle window.
    /// Used on the progress hot path; lifecycle edges call `save` directly.
    pub async fn save_throttled(&self, tasks: &[DownloadTask]) {
        let due = {
            let last = self.last_save.lock();
            match *last {
                None => true,
                Some(at) => at.elapsed() >= SAVE_INTERVAL,
            }
        };
        if !due {
            return;
        }
        if let Err(e) = self.save(tasks).await {
            warn!(error = %e, "throttled task save failed");
        }
    }
}
