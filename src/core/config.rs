//! Application configuration management

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::external_downloader::ExternalDownloaderConfig;
use super::models::DownloadConfig;

/// Main application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub download: DownloadConfig,
    pub external: ExternalDownloaderConfig,
    /// "error", "warn", "info", "debug", "trace"
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            external: ExternalDownloaderConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file, creating default if not exists
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let config: AppConfig =
                serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;
            config.validate()?;

            tracing::info!("Loaded configuration from: {:?}", config_path);
            Ok(config)
        } else {
            let config = Self::default();
            config.save()?;
            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Save configuration to file (atomic temp-file rename)
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        let tmp = config_path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write config file: {:?}", tmp))?;
        std::fs::rename(&tmp, &config_path)
            .with_context(|| format!("Failed to replace config file: {:?}", config_path))?;

        tracing::info!("Saved configuration to: {:?}", config_path);
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let dirs = Self::project_dirs()?;
        Ok(dirs.config_dir().join("config.json"))
    }

    /// Get the application data directory (task store, logs)
    pub fn data_dir() -> Result<PathBuf> {
        let dirs = Self::project_dirs()?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// Path of the persisted task table
    pub fn task_store_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("tasks.json"))
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "hlsbatch", "downloader")
            .with_context(|| "Failed to get project directories")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.download.concurrent_tasks == 0 {
            anyhow::bail!("Concurrent tasks must be greater than 0");
        }
        if self.download.concurrent_tasks > 20 {
            anyhow::bail!("Concurrent tasks should not exceed 20");
        }

        if self.download.segment_concurrency == 0 {
            anyhow::bail!("Segment concurrency must be greater than 0");
        }
        if self.download.segment_concurrency > 64 {
            anyhow::bail!("Segment concurrency should not exceed 64");
        }

        if self.download.retry_attempts == 0 || self.download.retry_attempts > 10 {
            anyhow::bail!("Retry attempts should be between 1 and 10");
        }

        if self.download.timeout_seconds == 0 || self.download.timeout_seconds > 300 {
            anyhow::bail!("Timeout should be between 1 and 300 seconds");
        }

        if self.download.download_root.as_os_str().is_empty() {
            anyhow::bail!("Download root must not be empty");
        }

        if self.external.program.as_os_str().is_empty() {
            anyhow::bail!("External downloader program must not be empty");
        }
        if !self.external.args.iter().any(|a| a.contains("{url}")) {
            anyhow::bail!("External downloader arguments must contain the {{url}} placeholder");
        }

        if !["error", "warn", "info", "debug", "trace"].contains(&self.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log level: must be 'error', 'warn', 'info', 'debug', or 'trace'"
            );
        }

        Ok(())
    }
}
