//! Remux collaborator
//!
//! The assembler hands its finished temp file to an external remux utility
//! to produce the final container. The utility runs as a subprocess with its
//! own lifecycle: spawn, await, kill on cancel. Its failure text is reduced
//! to a short `Remux` message rather than leaking raw tool output.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::core::error_handling::DownloadError;
use crate::core::models::ControlFlags;

/// Container repackaging step between assembly and publish.
#[async_trait]
pub trait Remuxer: Send + Sync {
    /// Repackage `input` into `output`. On success the output path holds a
    /// complete, playable file; on failure no output may remain.
    async fn remux(
        &self,
        input: &Path,
        output: &Path,
        flags: &ControlFlags,
    ) -> Result<(), DownloadError>;
}

/// Stream-copy remux via the system ffmpeg binary.
pub struct FfmpegRemuxer {
    program: PathBuf,
}

impl FfmpegRemuxer {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux(
        &self,
        input: &Path,
        output: &Path,
        flags: &ControlFlags,
    ) -> Result<(), DownloadError> {
        debug!(?input, ?output, "starting ffmpeg remux");

        let mut child = tokio::process::Command::new(&self.program)
            .arg("-y")
            .arg("-nostdin")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(input)
            .arg("-c")
            .arg("copy")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DownloadError::Remux {
                message: format!("failed to spawn {:?}: {}", self.program, e),
            })?;

        let stderr = child.stderr.take();

        // Await the child while staying responsive to stop requests
        let status = loop {
            if flags.is_cancelled() || flags.is_paused() {
                warn!("stop requested, killing remux process");
                let _ = child.kill().await;
                let _ = tokio::fs::remove_file(output).await;
                flags.check()?;
            }

            match child.try_wait().map_err(|e| DownloadError::Remux {
                message: e.to_string(),
            })? {
                Some(status) => break status,
                None => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        };

        if status.success() {
            info!(?output, "remux completed");
            return Ok(());
        }

        let detail = match stderr {
            Some(mut pipe) => {
                use tokio::io::AsyncReadExt;
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                tail(&buf, 300)
            }
            None => String::new(),
        };

        let _ = tokio::fs::remove_file(output).await;
        Err(DownloadError::Remux {
            message: format!("{} exited with {}: {}", self.program.display(), status, detail),
        })
    }
}

fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let start = trimmed.len() - max;
    // Stay on a char boundary
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(start);
    format!("...{}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_truncates_long_output() {
        let long = "x".repeat(1000);
        let out = tail(&long, 300);
        assert!(out.len() <= 303);
        assert!(out.starts_with("..."));

        assert_eq!(tail("  short  ", 300), "short");
    }

    #[tokio::test]
    async fn missing_binary_is_a_remux_error() {
        let remuxer = FfmpegRemuxer::new(PathBuf::from("/nonexistent/ffmpeg-binary"));
        let flags = ControlFlags::new();
        let err = remuxer
            .remux(Path::new("/tmp/in.ts"), Path::new("/tmp/out.mp4"), &flags)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Remux { .. }));
    }
}
