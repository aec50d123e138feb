//! Logging initialization for the CLI.
//!
//! Structured JSONL goes to `~/.beacon/logs/beacon.jsonl` unless
//! `BEACON_LOG_PATH` points elsewhere; compact lines are mirrored to stderr.

use crate::CoreResult;
use std::path::PathBuf;

/// Install the global subscriber at `level` and return the JSONL path.
///
/// `RUST_LOG`, when set, takes precedence over `level`.
pub fn init_logging(level: &str) -> CoreResult<PathBuf> {
    let log_path = std::env::var("BEACON_LOG_PATH")
        .ok()
        .and_then(non_empty_env)
        .map(PathBuf::from);

    let path = observability::init_with_config(observability::LogConfig {
        service_name: "beacon".into(),
        default_level: level.into(),
        log_path,
        also_stderr: true,
    })?;
    Ok(path)
}

fn non_empty_env(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
