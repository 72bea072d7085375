//! Ordered segment assembly
//!
//! Workers finish fetching in arbitrary order, but the output file is only
//! ever appended to in strict segment-index order: a crash or pause at any
//! point leaves the temp file holding a valid prefix of the stream. A small
//! JSON sidecar records how far assembly got so a later resume can skip
//! already-persisted segments when the re-resolved manifest still matches.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::core::error_handling::DownloadError;

/// Temp media file name inside a task's scratch directory.
pub const TEMP_MEDIA_FILE: &str = "media.ts";
/// Resume sidecar next to the temp media file.
pub const SIDECAR_FILE: &str = "media.state.json";

/// Assembly progress persisted across pause/restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SinkState {
    pub source_url: String,
    pub media_sequence: u64,
    pub total_segments: usize,
    /// Lowest segment index not yet written
    pub next_index: usize,
    /// Valid prefix length of the temp file
    pub bytes_written: u64,
}

/// Write-in-order sink for decrypted segment bytes.
///
/// Out-of-order arrivals are buffered and flushed only once every lower
/// index has been written; segment `k + 1` never reaches disk before `k`.
pub struct SegmentSink {
    file: File,
    temp_path: PathBuf,
    state_path: PathBuf,
    state: SinkState,
    pending: BTreeMap<usize, Vec<u8>>,
}

impl SegmentSink {
    /// Create a fresh sink, truncating any stale temp data.
    pub async fn create(
        dir: &Path,
        source_url: &str,
        media_sequence: u64,
        total_segments: usize,
    ) -> Result<Self, DownloadError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(DownloadError::assembly_io)?;

        let temp_path = dir.join(TEMP_MEDIA_FILE);
        let state_path = dir.join(SIDECAR_FILE);

        let file = File::create(&temp_path)
            .await
            .map_err(DownloadError::assembly_io)?;

        let state = SinkState {
            source_url: source_url.to_string(),
            media_sequence,
            total_segments,
            next_index: 0,
            bytes_written: 0,
        };

        let sink = Self {
            file,
            temp_path,
            state_path,
            state,
            pending: BTreeMap::new(),
        };
        sink.persist_state().await?;
        Ok(sink)
    }

    /// Reopen a previous attempt's temp file when its sidecar still matches
    /// the re-resolved manifest; otherwise start from scratch.
    pub async fn resume_or_create(
        dir: &Path,
        source_url: &str,
        media_sequence: u64,
        total_segments: usize,
    ) -> Result<Self, DownloadError> {
        let state_path = dir.join(SIDECAR_FILE);
        let temp_path = dir.join(TEMP_MEDIA_FILE);

        let previous: Option<SinkState> = match tokio::fs::read(&state_path).await {
            Ok(raw) => serde_json::from_slice(&raw).ok(),
            Err(_) => None,
        };

        let matches = previous.as_ref().is_some_and(|s| {
            s.source_url == source_url
                && s.media_sequence == media_sequence
                && s.total_segments == total_segments
                && s.next_index <= total_segments
        });

        if !matches || !temp_path.exists() {
            if previous.is_some() {
                warn!(?dir, "stale resume state, restarting assembly from scratch");
            }
            return Self::create(dir, source_url, media_sequence, total_segments).await;
        }

        let state = previous.expect("checked above");
        let mut file = OpenOptions::new()
            .write(true)
            .open(&temp_path)
            .await
            .map_err(DownloadError::assembly_io)?;

        // Drop anything past the recorded valid prefix (a flush may have
        // been interrupted mid-segment).
        file.set_len(state.bytes_written)
            .await
            .map_err(DownloadError::assembly_io)?;
        file.seek(std::io::SeekFrom::End(0))
            .await
            .map_err(DownloadError::assembly_io)?;

        info!(
            next_index = state.next_index,
            bytes = state.bytes_written,
            "resuming assembly from persisted prefix"
        );

        Ok(Self {
            file,
            temp_path,
            state_path,
            state,
            pending: BTreeMap::new(),
        })
    }

    /// Lowest segment index the sink still needs.
    pub fn next_index(&self) -> usize {
        self.state.next_index
    }

    pub fn bytes_written(&self) -> u64 {
        self.state.bytes_written
    }

    pub fn is_complete(&self) -> bool {
        self.state.next_index >= self.state.total_segments
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Accept one decrypted segment. Buffers out-of-order arrivals and
    /// flushes every segment that became contiguous; returns the number of
    /// bytes that reached the file in this call.
    pub async fn push(&mut self, index: usize, bytes: Vec<u8>) -> Result<u64, DownloadError> {
        if index < self.state.next_index {
            // Already on disk from a resumed prefix
            return Ok(0);
        }
        self.pending.insert(index, bytes);

        let mut flushed: u64 = 0;
        while let Some(bytes) = self.pending.remove(&self.state.next_index) {
            self.file
                .write_all(&bytes)
                .await
                .map_err(DownloadError::assembly_io)?;
            self.state.bytes_written += bytes.len() as u64;
            self.state.next_index += 1;
            flushed += bytes.len() as u64;
        }

        if flushed > 0 {
            self.file
                .flush()
                .await
                .map_err(DownloadError::assembly_io)?;
            self.persist_state().await?;
            debug!(
                next_index = self.state.next_index,
                flushed, "flushed contiguous segments"
            );
        }
        Ok(flushed)
    }

    /// Durably park the sink for a later resume (pause path).
    pub async fn suspend(&mut self) -> Result<(), DownloadError> {
        self.file
            .sync_all()
            .await
            .map_err(DownloadError::assembly_io)?;
        self.persist_state().await
    }

    /// All segments written: sync and hand back the temp path for remuxing.
    pub async fn finalize(&mut self) -> Result<PathBuf, DownloadError> {
        if !self.is_complete() {
            return Err(DownloadError::AssemblyIo {
                message: format!(
                    "assembly incomplete: {}/{} segments written",
                    self.state.next_index, self.state.total_segments
                ),
            });
        }
        self.file
            .sync_all()
            .await
            .map_err(DownloadError::assembly_io)?;
        Ok(self.temp_path.clone())
    }

    async fn persist_state(&self) -> Result<(), DownloadError> {
        let raw = serde_json::to_vec(&self.state).map_err(|e| DownloadError::AssemblyIo {
            message: e.to_string(),
        })?;
        let tmp = self.state_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw)
            .await
            .map_err(DownloadError::assembly_io)?;
        tokio::fs::rename(&tmp, &self.state_path)
            .await
            .map_err(DownloadError::assembly_io)?;
        Ok(())
    }
}

/// Atomically publish a finished file into the destination directory.
///
/// Rename when possible, copy-then-remove across filesystems. The file only
/// appears at the final path once it is complete.
pub async fn publish(from: &Path, to: &Path) -> Result<(), DownloadError> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(DownloadError::assembly_io)?;
    }

    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            // Cross-device move: copy then remove the source. An interrupted
            // copy leaves partial bytes at the destination, so the failure
            // path must take them back out.
            if let Err(e) = tokio::fs::copy(from, to).await {
                let _ = tokio::fs::remove_file(to).await;
                return Err(DownloadError::assembly_io(e));
            }
            tokio::fs::remove_file(from)
                .await
                .map_err(DownloadError::assembly_io)?;
            Ok(())
        }
    }
}

/// Best-effort removal of a task's scratch directory.
pub async fn cleanup_dir(dir: &Path) {
    if dir.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            warn!(?dir, error = %e, "failed to clean temp directory");
        }
    }
}
