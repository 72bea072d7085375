//! Core data models for the HLS batch downloader

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::error_handling::DownloadError;

/// Task status enumeration
///
/// Lifecycle: `Pending -> Queued -> Downloading -> {Completed | Failed |
/// Cancelled}`, with `Downloading <-> Paused` as the only reversible edge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Downloading)
    }
}

/// Acquisition strategy selected once per task at admission time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AcquisitionKind {
    /// Direct HLS manifest download (resolve -> fetch -> decrypt -> assemble)
    Hls,
    /// Delegated to the external generic URL downloader
    External,
}

/// Main download task record, persisted across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    /// Source URL, percent-decoded once at enqueue time
    pub source: String,
    pub display_name: String,
    /// Destination directory, already validated against the download root
    pub destination_dir: PathBuf,
    /// Sanitized output file name
    pub output_name: String,
    pub kind: AcquisitionKind,
    pub status: TaskStatus,
    /// 0.0 - 100.0, monotonic non-decreasing while Downloading
    pub progress_percent: f64,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    /// Bytes per second
    pub speed: f64,
    /// Seconds remaining, when estimable
    pub eta: Option<u64>,
    /// Last human-readable status or failure reason
    pub message: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl DownloadTask {
    /// Final output path inside the download root.
    pub fn final_path(&self) -> PathBuf {
        self.destination_dir.join(&self.output_name)
    }
}

/// Progress update emitted to the UI event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub progress_percent: f64,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub speed: f64,
    pub eta: Option<u64>,
}

/// Download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// All output paths must resolve inside this directory
    pub download_root: PathBuf,
    /// Global admission limit across all tasks
    pub concurrent_tasks: usize,
    /// Per-task segment fetch pool width
    pub segment_concurrency: usize,
    /// Attempts per network fetch (manifest, key, segment)
    pub retry_attempts: usize,
    /// Per-request timeout in seconds
    pub timeout_seconds: u64,
    pub user_agent: String,
    /// Scratch space for per-task temp files
    pub temp_dir: PathBuf,
    /// Keep temp artifacts after failure (debugging aid)
    pub keep_temp_files: bool,
    /// Remux binary invoked by the assembler
    pub ffmpeg_path: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from("downloads"),
            concurrent_tasks: 3,
            segment_concurrency: 8,
            retry_attempts: 3,
            timeout_seconds: 30,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            temp_dir: std::env::temp_dir().join("hls_batch_downloader"),
            keep_temp_files: false,
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

/// Aggregate statistics across all tasks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadStats {
    pub total_tasks: usize,
    pub queued_tasks: usize,
    pub active_downloads: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub total_downloaded: u64,
}

/// Cooperative stop signals shared between the orchestrator and one task's
/// pipeline. Cancel wins over pause when both are set.
#[derive(Debug, Clone, Default)]
pub struct ControlFlags {
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::Relaxed);
    }

    pub fn clear_pause(&self) {
        self.pause.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }

    /// Checkpoint used at every suspension point of a pipeline.
    pub fn check(&self) -> Result<(), DownloadError> {
        if self.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if self.is_paused() {
            return Err(DownloadError::Paused);
        }
        Ok(())
    }
}

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("System error: {0}")]
    System(String),
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
