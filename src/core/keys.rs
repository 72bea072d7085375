//! AES key cache
//!
//! Fetches the raw key bytes referenced by a manifest and memoizes them by
//! URI for the lifetime of one task's pipeline. Keys are never shared across
//! tasks: key servers routinely bind keys to per-session tokens, so a cache
//! hit from another task would be wrong even for an identical URI.

use std::collections::HashMap;

use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::core::error_handling::{DownloadError, RetryPolicy};
use crate::core::models::ControlFlags;

/// Per-task key cache. Owned exclusively by one pipeline.
pub struct KeyCache {
    client: Client,
    policy: RetryPolicy,
    keys: Mutex<HashMap<String, [u8; 16]>>,
}

impl KeyCache {
    pub fn new(client: Client, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the 16 key bytes for `uri`, memoized by URI string.
    ///
    /// Network failures and non-2xx responses are retried under the policy
    /// and surface as `KeyFetch`; a body of any length other than 16 bytes
    /// is a fatal `KeyFormat` error, never retried.
    pub async fn fetch(&self, uri: &Url, flags: &ControlFlags) -> Result<[u8; 16], DownloadError> {
        if let Some(key) = self.keys.lock().await.get(uri.as_str()) {
            return Ok(*key);
        }

        let key = self.fetch_uncached(uri, flags).await?;
        self.keys.lock().await.insert(uri.to_string(), key);
        debug!(key_uri = %uri, "cached AES-128 key");
        Ok(key)
    }

    async fn fetch_uncached(
        &self,
        uri: &Url,
        flags: &ControlFlags,
    ) -> Result<[u8; 16], DownloadError> {
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            flags.check()?;

            match self.try_fetch(uri).await {
                Ok(key) => return Ok(key),
                Err(FetchFailure::WrongLength(length)) => {
                    return Err(DownloadError::KeyFormat { length });
                }
                Err(FetchFailure::Transient(message)) => {
                    last_error = message;
                    if attempt < self.policy.max_attempts {
                        warn!(key_uri = %uri, attempt, error = %last_error, "key fetch failed, retrying");
                        tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        Err(DownloadError::KeyFetch {
            message: format!(
                "{} ({}, {} attempts)",
                last_error, uri, self.policy.max_attempts
            ),
        })
    }

    async fn try_fetch(&self, uri: &Url) -> Result<[u8; 16], FetchFailure> {
        let response = self
            .client
            .get(uri.clone())
            .send()
            .await
            .map_err(|e| FetchFailure::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchFailure::Transient(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchFailure::Transient(e.to_string()))?;

        if body.len() != 16 {
            return Err(FetchFailure::WrongLength(body.len()));
        }

        let mut key = [0u8; 16];
        key.copy_from_slice(&body);
        Ok(key)
    }
}

enum FetchFailure {
    Transient(String),
    WrongLength(usize),
}
