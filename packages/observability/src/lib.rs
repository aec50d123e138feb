//! # Observability
//!
//! Tracing setup for the Beacon crates.
//!
//! Library crates only emit `tracing` events. Binaries call
//! [`init_with_config`] once at startup, which installs:
//!
//! - a JSON layer appending one object per line to
//!   `~/.beacon/logs/beacon.jsonl` (or [`LogConfig::log_path`]),
//! - an optional compact stderr layer.
//!
//! Both layers filter through `RUST_LOG` when it is set and fall back to
//! [`LogConfig::default_level`] otherwise.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "beacon".into(),
//!     default_level: "debug".into(),
//!     also_stderr: true,
//!     ..Default::default()
//! })?;
//! tracing::info!("ready");
//! ```

mod json_layer;
mod writer;

use std::io;
use std::path::PathBuf;

pub use json_layer::{JsonLayer, LogLine};
pub use writer::{default_log_path, AppendWriter};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Written as `service` on every line.
    pub service_name: String,

    /// Filter used when `RUST_LOG` is unset (e.g. "debug", "beacon_collector=trace").
    pub default_level: String,

    /// JSONL destination. Defaults to [`default_log_path`].
    pub log_path: Option<PathBuf>,

    /// Also print compact lines to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "beacon".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Initialize with defaults for `service_name`.
pub fn init(service_name: &str) -> io::Result<PathBuf> {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

/// Install the global subscriber and return the JSONL path in use.
///
/// Fails when the log file cannot be opened. A second call in the same
/// process leaves the first subscriber in place.
pub fn init_with_config(config: LogConfig) -> io::Result<PathBuf> {
    writer::init_subscriber(&config)
}

pub use tracing::{debug, error, info, instrument, trace, warn, Level};
