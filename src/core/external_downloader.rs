//! Generic external downloader delegate
//!
//! Sources that do not resolve to a direct HLS manifest (video platforms
//! with their own extraction logic) are handed wholesale to a configured
//! yt-dlp style command-line tool. The subprocess gets its own lifecycle
//! (spawn, stream output, await exit, kill on cancel) and its progress and
//! exit status are mapped onto the same task state machine the HLS pipeline
//! uses, so the UI sees one uniform task model.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::core::error_handling::DownloadError;
use crate::core::models::ControlFlags;
use crate::core::progress_tracker::TaskProgress;

/// Configuration for the delegated downloader tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalDownloaderConfig {
    pub program: PathBuf,
    /// Argument template; `{output}` and `{url}` are substituted per task.
    pub args: Vec<String>,
}

impl Default for ExternalDownloaderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
            args: vec![
                "--newline".to_string(),
                "--no-playlist".to_string(),
                "-o".to_string(),
                "{output}".to_string(),
                "{url}".to_string(),
            ],
        }
    }
}

/// Delegate runner mapping an external tool onto the task contract.
pub struct ExternalDownloader {
    config: ExternalDownloaderConfig,
    progress_line: Regex,
}

impl ExternalDownloader {
    pub fn new(config: ExternalDownloaderConfig) -> Self {
        Self {
            config,
            // yt-dlp with --newline: "[download]  42.3% of 10.00MiB at ..."
            progress_line: Regex::new(r"\[download\]\s+([0-9]+(?:\.[0-9]+)?)%")
                .expect("static regex"),
        }
    }

    /// Run the whole acquisition through the external tool, writing to
    /// `staging_output` (inside the task's temp dir, never the final path).
    pub async fn download(
        &self,
        source: &str,
        staging_output: &Path,
        flags: &ControlFlags,
        progress: &TaskProgress,
    ) -> Result<(), DownloadError> {
        if let Some(parent) = staging_output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(DownloadError::assembly_io)?;
        }

        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| {
                a.replace("{output}", &staging_output.to_string_lossy())
                    .replace("{url}", source)
            })
            .collect();

        info!(program = ?self.config.program, "delegating to external downloader");
        debug!(?args, "external downloader arguments");

        let mut child = tokio::process::Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DownloadError::ExternalTool {
                message: format!("failed to spawn {:?}: {}", self.config.program, e),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| DownloadError::ExternalTool {
            message: "stdout pipe unavailable".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| DownloadError::ExternalTool {
            message: "stderr pipe unavailable".to_string(),
        })?;
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut last_error_line = String::new();

        let mut poll = tokio::time::interval(Duration::from_millis(200));
        let mut stdout_open = true;
        let mut stderr_open = true;

        let status = loop {
            tokio::select! {
                line = stdout_lines.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(caps) = self.progress_line.captures(&line) {
                                if let Ok(pct) = caps[1].parse::<f64>() {
                                    progress.set_percent(pct);
                                }
                            }
                        }
                        _ => stdout_open = false,
                    }
                }
                line = stderr_lines.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => {
                            if !line.trim().is_empty() {
                                last_error_line = line;
                            }
                        }
                        _ => stderr_open = false,
                    }
                }
                _ = poll.tick() => {
                    if flags.is_cancelled() || flags.is_paused() {
                        warn!("stop requested, killing external downloader");
                        let _ = child.kill().await;
                        remove_partial(staging_output).await;
                        flags.check()?;
                    }
                    if let Ok(Some(status)) = child.try_wait() {
                        break status;
                    }
                }
            }
        };

        if !status.success() {
            remove_partial(staging_output).await;
            return Err(DownloadError::ExternalTool {
                message: format!(
                    "{} exited with {}: {}",
                    self.config.program.display(),
                    status,
                    last_error_line
                ),
            });
        }

        if !staging_output.exists() {
            return Err(DownloadError::ExternalTool {
                message: "tool reported success but produced no output file".to_string(),
            });
        }

        progress.complete();
        Ok(())
    }
}

/// Remove the staging file plus the `.part` sibling yt-dlp leaves behind.
async fn remove_partial(output: &Path) {
    let _ = tokio::fs::remove_file(output).await;
    let mut part = output.as_os_str().to_os_string();
    part.push(".part");
    let _ = tokio::fs::remove_file(PathBuf::from(part)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_regex_matches_ytdlp_output() {
        let downloader = ExternalDownloader::new(ExternalDownloaderConfig::default());
        let caps = downloader
            .progress_line
            .captures("[download]  42.3% of 10.00MiB at 1.20MiB/s ETA 00:05")
            .unwrap();
        assert_eq!(&caps[1], "42.3");

        let caps = downloader
            .progress_line
            .captures("[download] 100% of 10.00MiB in 00:08")
            .unwrap();
        assert_eq!(&caps[1], "100");

        assert!(downloader
            .progress_line
            .captures("[info] Extracting URL")
            .is_none());
    }

    #[test]
    fn argument_template_substitution() {
        let config = ExternalDownloaderConfig::default();
        let rendered: Vec<String> = config
            .args
            .iter()
            .map(|a| a.replace("{output}", "/tmp/x.mp4").replace("{url}", "http://v"))
            .collect();
        assert!(rendered.contains(&"/tmp/x.mp4".to_string()));
        assert!(rendered.contains(&"http://v".to_string()));
    }

    #[tokio::test]
    async fn missing_tool_is_an_external_error() {
        let downloader = ExternalDownloader::new(ExternalDownloaderConfig {
            program: PathBuf::from("/nonexistent/downloader-tool"),
            ..Default::default()
        });
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let progress = TaskProgress::new("t", tx);
        let flags = ControlFlags::new();

        let err = downloader
            .download(
                "http://example.com/v",
                Path::new("/tmp/ext-test-out.mp4"),
                &flags,
                &progress,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::ExternalTool { .. }));
    }
}
