//! Collector configuration.

use beacon_retry_queue::{BackoffPolicy, RetryQueueConfig};
use std::time::Duration;

/// Configuration for [`CollectorDestination`](crate::CollectorDestination).
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Plugin name, also used in the persisted queue key.
    pub name: String,
    pub write_key: String,
    /// Base URL; verbs are posted to `<api_host>/<t|i|p|g|a|s>`.
    pub api_host: String,
    pub max_attempts: u32,
    pub max_queue_size: usize,
    pub backoff: BackoffPolicy,
    /// Upper bound of the random delay before a scheduled queue flush.
    pub flush_jitter: Duration,
    /// Integrations reported as bundled in `_metadata`, besides this one.
    pub bundled_integrations: Vec<String>,
    pub unbundled_integrations: Vec<String>,
    /// Add `bundled`/`unbundled` lists to `_metadata`.
    pub add_bundled_metadata: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            name: "Beacon.io".to_string(),
            write_key: String::new(),
            api_host: "http://localhost:8080/v1".to_string(),
            max_attempts: 10,
            max_queue_size: 1000,
            backoff: BackoffPolicy::default(),
            flush_jitter: Duration::from_secs(5),
            bundled_integrations: Vec::new(),
            unbundled_integrations: Vec::new(),
            add_bundled_metadata: true,
        }
    }
}

impl CollectorConfig {
    pub fn retry_queue_config(&self) -> RetryQueueConfig {
        RetryQueueConfig {
            max_attempts: self.max_attempts,
            max_size: self.max_queue_size,
            backoff: self.backoff.clone(),
        }
    }

    /// Name under which the retry queue is persisted.
    pub fn storage_name(&self) -> String {
        format!("dest-{}", self.name)
    }
}
