//! Core business logic module
//!
//! This module contains the domain models, the per-task acquisition
//! pipelines, and the orchestrator for the HLS batch downloader.

pub mod assembler;
pub mod config;
pub mod decrypt;
pub mod error_handling;
pub mod external_downloader;
pub mod hls_downloader;
pub mod keys;
pub mod manager;
pub mod models;
pub mod path_safety;
pub mod persistence;
pub mod playlist;
pub mod progress_tracker;
pub mod remux;

#[cfg(test)]
mod pipeline_integration_tests;

#[cfg(test)]
mod manager_integration_tests;

// Re-export commonly used types
pub use config::AppConfig;
pub use manager::DownloadManager;
