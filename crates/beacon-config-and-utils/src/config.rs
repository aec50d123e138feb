//! CLI configuration.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Collection API used when nothing else is configured.
pub const DEFAULT_API_HOST: &str = "http://localhost:8080/v1";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_RETRY_QUEUE_MAX_SIZE: usize = 1000;

/// How the collector hands payloads to the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryStrategy {
    /// One request per event.
    Standard,
    /// Events are buffered and posted together.
    Batching {
        #[serde(default = "default_batch_size")]
        size: usize,
        #[serde(default = "default_batch_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_max_payload_bytes")]
        max_payload_bytes: usize,
        #[serde(default = "default_keepalive_chunk_bytes")]
        keepalive_chunk_bytes: usize,
        #[serde(default = "default_batch_retry_attempts")]
        retry_attempts: u32,
    },
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_timeout_ms() -> u64 {
    5000
}

fn default_max_payload_bytes() -> usize {
    500 * 1024
}

fn default_keepalive_chunk_bytes() -> usize {
    64 * 1024
}

fn default_batch_retry_attempts() -> u32 {
    10
}

impl DeliveryStrategy {
    /// Batching with every knob at its default.
    pub fn batching() -> Self {
        Self::Batching {
            size: default_batch_size(),
            timeout_ms: default_batch_timeout_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            keepalive_chunk_bytes: default_keepalive_chunk_bytes(),
            retry_attempts: default_batch_retry_attempts(),
        }
    }
}

impl Default for DeliveryStrategy {
    fn default() -> Self {
        Self::Standard
    }
}

/// Beacon CLI configuration, read from `~/.beacon/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source write key sent with every payload.
    #[serde(default)]
    pub write_key: String,
    /// Collection API base URL.
    #[serde(default = "default_api_host")]
    pub api_host: String,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Delivery attempts per event before it is dropped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Retry queue capacity; the oldest entry is evicted beyond it.
    #[serde(default = "default_retry_queue_max_size")]
    pub retry_queue_max_size: usize,
    /// Keep undelivered events on disk between runs.
    #[serde(default = "default_persist_queue")]
    pub persist_queue: bool,
    #[serde(default)]
    pub delivery_strategy: DeliveryStrategy,
}

fn default_api_host() -> String {
    DEFAULT_API_HOST.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_queue_max_size() -> usize {
    DEFAULT_RETRY_QUEUE_MAX_SIZE
}

fn default_persist_queue() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write_key: String::new(),
            api_host: default_api_host(),
            log_level: default_log_level(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_queue_max_size: DEFAULT_RETRY_QUEUE_MAX_SIZE,
            persist_queue: true,
            delivery_strategy: DeliveryStrategy::Standard,
        }
    }
}

impl Config {
    /// Defaults, then environment overrides.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load the config file if present, then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `BEACON_*` overrides from `lookup`. Unparseable numbers and
    /// booleans are ignored with a warning.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).and_then(non_empty);

        if let Some(write_key) = var("BEACON_WRITE_KEY") {
            self.write_key = write_key;
        }
        if let Some(api_host) = var("BEACON_API_HOST") {
            self.api_host = api_host;
        }
        if let Some(log_level) = var("BEACON_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Some(raw) = var("BEACON_MAX_ATTEMPTS") {
            match raw.parse() {
                Ok(max_attempts) => self.max_attempts = max_attempts,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid BEACON_MAX_ATTEMPTS"),
            }
        }
        if let Some(raw) = var("BEACON_PERSIST_QUEUE") {
            match parse_bool(&raw) {
                Some(persist) => self.persist_queue = persist,
                None => tracing::warn!(value = %raw, "Ignoring invalid BEACON_PERSIST_QUEUE"),
            }
        }
    }

    /// The API host as a parsed URL.
    pub fn api_url(&self) -> CoreResult<Url> {
        Url::parse(&self.api_host).map_err(CoreError::from)
    }

    /// Fail fast on settings the engine cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        self.api_url()?;
        if self.max_attempts == 0 {
            return Err(CoreError::Config("max_attempts must be at least 1".into()));
        }
        if let DeliveryStrategy::Batching { size: 0, .. } = self.delivery_strategy {
            return Err(CoreError::Config("batch size must be at least 1".into()));
        }
        Ok(())
    }
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
