//! HLS acquisition pipeline
//!
//! Per-task pipeline: resolve the manifest, fetch the encryption key(s),
//! download segments through a bounded worker pool with retry/backoff,
//! decrypt, assemble strictly in order, remux, and atomically publish.
//! Segment fetch order is unconstrained; write order is sequential by
//! manifest index. Pause and cancel propagate within one fetch-retry cycle.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::assembler::{self, SegmentSink};
use crate::core::decrypt::{decrypt_segment, derive_iv};
use crate::core::error_handling::{DownloadError, RetryPolicy};
use crate::core::keys::KeyCache;
use crate::core::models::{AppResult, ControlFlags, DownloadConfig};
use crate::core::playlist::{self, MediaPlaylist};
use crate::core::progress_tracker::TaskProgress;
use crate::core::remux::Remuxer;

/// One fetched-and-decrypted segment, ready for ordered assembly.
#[derive(Debug)]
pub struct SegmentResult {
    pub index: usize,
    pub bytes: Vec<u8>,
}

/// Everything a fetch worker needs for one segment.
#[derive(Debug, Clone)]
struct SegmentJob {
    index: usize,
    uri: Url,
    sequence: u64,
    /// Key bytes plus the manifest's explicit IV, when encrypted
    key: Option<([u8; 16], Option<[u8; 16]>)>,
}

/// Quick strategy probe: does this source look like a direct HLS manifest?
pub fn is_hls_source(source: &str) -> bool {
    match Url::parse(source) {
        Ok(url) => {
            let path = url.path().to_ascii_lowercase();
            path.ends_with(".m3u8")
                || path.ends_with(".m3u")
                || url.query().is_some_and(|q| q.to_ascii_lowercase().contains("m3u8"))
        }
        Err(_) => false,
    }
}

/// Direct-HLS downloader, shared across tasks (all per-task state lives in
/// `download` locals).
pub struct HlsDownloader {
    client: Client,
    config: Arc<DownloadConfig>,
    remuxer: Arc<dyn Remuxer>,
}

impl HlsDownloader {
    pub fn new(config: Arc<DownloadConfig>, remuxer: Arc<dyn Remuxer>) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            client,
            config,
            remuxer,
        })
    }

    /// Run the full pipeline for one task. `final_path` must already have
    /// passed the output-path preconditions.
    pub async fn download(
        &self,
        task_id: &str,
        source: &str,
        final_path: &Path,
        flags: &ControlFlags,
        progress: &TaskProgress,
    ) -> Result<(), DownloadError> {
        let policy = RetryPolicy::with_attempts(self.config.retry_attempts);

        // Manifest is re-resolved on every attempt: playlist URLs and key
        // tokens expire, so nothing from a previous run is trusted except
        // the assembled byte prefix.
        let playlist = playlist::fetch_media_playlist(&self.client, source, &policy, flags).await?;
        info!(
            task_id,
            segments = playlist.segments.len(),
            duration = playlist.total_duration(),
            encrypted = playlist.is_encrypted(),
            "resolved media playlist"
        );

        let keys = self.fetch_keys(&playlist, &policy, flags).await?;

        let task_dir = self.config.temp_dir.join(task_id);
        let mut sink = SegmentSink::resume_or_create(
            &task_dir,
            source,
            playlist.media_sequence,
            playlist.segments.len(),
        )
        .await?;

        progress.set_total_units(playlist.segments.len());
        if sink.next_index() > 0 {
            info!(task_id, skip = sink.next_index(), "reusing persisted segments");
            progress.seed(sink.next_index(), sink.bytes_written());
        }

        let result = self
            .fetch_and_assemble(&playlist, &keys, &mut sink, flags, progress)
            .await;

        if let Err(error) = result {
            self.handle_stop(&task_dir, &mut sink, &error).await;
            return Err(error);
        }

        let result = self
            .remux_and_publish(&task_dir, &mut sink, final_path, flags)
            .await;

        match result {
            Ok(()) => {
                progress.complete();
                if !self.config.keep_temp_files {
                    assembler::cleanup_dir(&task_dir).await;
                }
                info!(task_id, path = %final_path.display(), "download completed");
                Ok(())
            }
            Err(error) => {
                self.handle_stop(&task_dir, &mut sink, &error).await;
                Err(error)
            }
        }
    }

    /// Prefetch key bytes for every key tag, aligned with `playlist.keys`.
    async fn fetch_keys(
        &self,
        playlist: &MediaPlaylist,
        policy: &RetryPolicy,
        flags: &ControlFlags,
    ) -> Result<Vec<[u8; 16]>, DownloadError> {
        if playlist.keys.is_empty() {
            return Ok(Vec::new());
        }

        let cache = KeyCache::new(self.client.clone(), policy.clone());
        let fetches = playlist.keys.iter().map(|tag| cache.fetch(&tag.uri, flags));
        futures::future::try_join_all(fetches).await
    }

    /// Bounded-concurrency fetch of all outstanding segments, consumed into
    /// the sink in strict index order.
    async fn fetch_and_assemble(
        &self,
        playlist: &MediaPlaylist,
        keys: &[[u8; 16]],
        sink: &mut SegmentSink,
        flags: &ControlFlags,
        progress: &TaskProgress,
    ) -> Result<(), DownloadError> {
        let total = playlist.segments.len();
        let first = sink.next_index();
        if first >= total {
            return Ok(());
        }

        let policy = RetryPolicy::with_attempts(self.config.retry_attempts);
        let pool = Arc::new(Semaphore::new(self.config.segment_concurrency.max(1)));
        let (tx, mut rx) =
            mpsc::channel::<Result<SegmentResult, DownloadError>>(self.config.segment_concurrency.max(1) * 2);

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(total - first);
        for (index, segment) in playlist.segments.iter().enumerate().skip(first) {
            let key = match segment.key {
                Some(k) => {
                    let tag = &playlist.keys[k];
                    Some((keys[k], tag.iv))
                }
                None => None,
            };
            let job = SegmentJob {
                index,
                uri: segment.uri.clone(),
                sequence: segment.sequence,
                key,
            };

            let client = self.client.clone();
            let policy = policy.clone();
            let flags = flags.clone();
            let pool = Arc::clone(&pool);
            let tx = tx.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match pool.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if flags.is_cancelled() || flags.is_paused() {
                    return;
                }
                let outcome = fetch_and_decrypt(&client, &policy, &job, &flags).await;
                match outcome {
                    // Stop requests are signalled through the flags; the
                    // consumer notices on its own clock.
                    Err(ref e) if e.is_stop_request() => {}
                    other => {
                        let _ = tx.send(other.map(|bytes| SegmentResult {
                            index: job.index,
                            bytes,
                        })).await;
                    }
                }
            }));
        }
        drop(tx);

        let outcome = self
            .consume(&mut rx, sink, total - first, flags, progress)
            .await;

        // Whatever happened, no worker may outlive the assembly stage
        for handle in &handles {
            handle.abort();
        }

        outcome
    }

    async fn consume(
        &self,
        rx: &mut mpsc::Receiver<Result<SegmentResult, DownloadError>>,
        sink: &mut SegmentSink,
        expected: usize,
        flags: &ControlFlags,
        progress: &TaskProgress,
    ) -> Result<(), DownloadError> {
        let mut received = 0usize;
        let mut poll = tokio::time::interval(Duration::from_millis(100));

        while received < expected {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(Ok(segment)) => {
                        let size = segment.bytes.len() as u64;
                        sink.push(segment.index, segment.bytes).await?;
                        progress.record_segment(size);
                        received += 1;
                    }
                    Some(Err(error)) => return Err(error),
                    None => {
                        // All senders gone without delivering everything:
                        // either a stop request drained the pool, or
                        // workers died unexpectedly.
                        flags.check()?;
                        return Err(DownloadError::AssemblyIo {
                            message: "segment workers exited prematurely".to_string(),
                        });
                    }
                },
                _ = poll.tick() => {
                    flags.check()?;
                }
            }
        }

        debug!(received, "all segments assembled");
        Ok(())
    }

    async fn remux_and_publish(
        &self,
        task_dir: &Path,
        sink: &mut SegmentSink,
        final_path: &Path,
        flags: &ControlFlags,
    ) -> Result<(), DownloadError> {
        let assembled = sink.finalize().await?;
        flags.check()?;

        let ext = final_path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "mp4".to_string());
        let staging = task_dir.join(format!("remuxed.{ext}"));

        self.remuxer.remux(&assembled, &staging, flags).await?;

        // Publish only after the remux reported success
        assembler::publish(&staging, final_path).await
    }

    /// Decide what survives an early pipeline exit: paused tasks keep their
    /// temp prefix for resume, everything else is cleaned up so no partial
    /// artifact can masquerade as a finished download.
    async fn handle_stop(&self, task_dir: &Path, sink: &mut SegmentSink, error: &DownloadError) {
        match error {
            DownloadError::Paused => {
                if let Err(e) = sink.suspend().await {
                    warn!(error = %e, "failed to persist resume state");
                }
            }
            DownloadError::Cancelled => {
                assembler::cleanup_dir(task_dir).await;
            }
            _ => {
                if !self.config.keep_temp_files {
                    assembler::cleanup_dir(task_dir).await;
                }
            }
        }
    }
}

/// Fetch one segment with bounded retries and decrypt it.
///
/// A decryption/padding failure triggers exactly one refetch (the server
/// may have served a transient truncated body); a second failure is fatal.
async fn fetch_and_decrypt(
    client: &Client,
    policy: &RetryPolicy,
    job: &SegmentJob,
    flags: &ControlFlags,
) -> Result<Vec<u8>, DownloadError> {
    let mut last_error = String::new();
    let mut decrypt_retry_used = false;
    let mut attempt = 0usize;

    while attempt < policy.max_attempts {
        attempt += 1;
        flags.check()?;

        let ciphertext = match fetch_once(client, &job.uri).await {
            Ok(bytes) => {
                flags.check()?;
                bytes
            }
            Err(message) => {
                last_error = message;
                if attempt < policy.max_attempts {
                    warn!(index = job.index, attempt, error = %last_error, "segment fetch failed, retrying");
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                }
                continue;
            }
        };

        let plaintext = match job.key {
            None => ciphertext,
            Some((key, explicit_iv)) => {
                let iv = derive_iv(explicit_iv, job.sequence);
                match decrypt_segment(&ciphertext, &key, &iv, job.index) {
                    Ok(plain) => plain,
                    Err(error) if !decrypt_retry_used => {
                        // Corrupt body: refetch this segment once, without
                        // charging the fetch attempt budget
                        decrypt_retry_used = true;
                        attempt -= 1;
                        warn!(index = job.index, %error, "decrypt failed, refetching segment once");
                        continue;
                    }
                    Err(error) => return Err(error),
                }
            }
        };

        return Ok(plaintext);
    }

    Err(DownloadError::SegmentFetch {
        index: job.index,
        attempts: policy.max_attempts,
        message: last_error,
    })
}

async fn fetch_once(client: &Client, uri: &Url) -> Result<Vec<u8>, String> {
    let response = client
        .get(uri.clone())
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }

    let body = response.bytes().await.map_err(|e| e.to_string())?;
    Ok(body.to_vec())
}
