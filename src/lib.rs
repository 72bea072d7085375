//! HLS Batch Downloader - Core Library
//!
//! Batch acquisition engine for HLS (m3u8) video streams: manifest
//! resolution, AES-128 segment decryption, bounded-concurrency fetching with
//! in-order assembly, and a task orchestrator with pause/resume, cancel, and
//! crash-safe persistence. Non-HLS sources are delegated to an external
//! yt-dlp style tool behind the same task model.

pub mod core;

// Re-export commonly used types
pub use core::{
    config::AppConfig,
    external_downloader::ExternalDownloaderConfig,
    manager::{
        AcquisitionBackend, DownloadEvent, DownloadManager, EventReceiver, EventSender,
        NewTaskRequest,
    },
    models::{
        AcquisitionKind, AppError, AppResult, DownloadConfig, DownloadStats, DownloadTask,
        ProgressUpdate, TaskStatus,
    },
    persistence::TaskStore,
};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level; safe to call once at startup.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hls_batch_downloader={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
