//! Error taxonomy and retry mechanism
//!
//! Every failure a task can hit is classified into one `DownloadError` kind.
//! Transient network failures are retried locally (bounded attempts with
//! exponential backoff and jitter) at the layer that owns the resource;
//! exhausted retries surface as the task's terminal `Failed` state with a
//! descriptive message. `Cancelled` and `Paused` are control-flow causes,
//! never rendered as failures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default base delay for exponential backoff (500ms)
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay cap for exponential backoff (30 seconds)
pub const MAX_DELAY_CAP: Duration = Duration::from_secs(30);

/// Detailed error information with retry classification
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum DownloadError {
    #[error("manifest fetch failed: {message}")]
    ManifestFetch { message: String },

    #[error("manifest parse failed: {message}")]
    ManifestParse { message: String },

    #[error("key fetch failed: {message}")]
    KeyFetch { message: String },

    #[error("encryption key must be 16 bytes, got {length}")]
    KeyFormat { length: usize },

    #[error("segment {index} failed after {attempts} attempts: {message}")]
    SegmentFetch {
        index: usize,
        attempts: usize,
        message: String,
    },

    #[error("segment {index} failed to decrypt: {message}")]
    Decryption { index: usize, message: String },

    #[error("assembly I/O error: {message}")]
    AssemblyIo { message: String },

    #[error("remux failed: {message}")]
    Remux { message: String },

    #[error("external downloader failed: {message}")]
    ExternalTool { message: String },

    #[error("invalid output path: {message}")]
    OutputPath { message: String },

    #[error("cancelled by user")]
    Cancelled,

    #[error("paused")]
    Paused,
}

impl DownloadError {
    /// Whether the owning layer may retry the operation that produced this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ManifestFetch { .. } | Self::KeyFetch { .. } | Self::SegmentFetch { .. }
        )
    }

    /// Stop causes end a pipeline without marking the task Failed.
    pub fn is_stop_request(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Paused)
    }

    pub fn assembly_io(err: std::io::Error) -> Self {
        Self::AssemblyIo {
            message: err.to_string(),
        }
    }
}

/// Retry strategy configuration shared by the manifest, key, and segment
/// fetch layers.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: usize,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential)
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0) to prevent thundering herd
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: MAX_DELAY_CAP,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Backoff delay before retry number `attempt` (1-based: the delay taken
    /// after the first failed attempt is `delay_for_attempt(1)`).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let raw = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exp);
        let capped = raw.min(self.max_delay.as_millis() as f64);

        let jittered = if self.jitter_factor > 0.0 {
            let spread = capped * self.jitter_factor;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            // The cap bounds the final delay, jitter included
            (capped + offset).clamp(0.0, self.max_delay.as_millis() as f64)
        } else {
            capped
        };

        Duration::from_millis(jittered as u64)
    }
}
