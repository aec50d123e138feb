//! File system layout under `~/.beacon`.

use crate::{CoreError, CoreResult};
use std::path::{Path, PathBuf};

/// Locations of the CLI's config, queue, and log files.
#[derive(Debug, Clone)]
pub struct Paths {
    base_dir: PathBuf,
}

impl Paths {
    /// Paths rooted at `~/.beacon`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(".beacon"),
        })
    }

    /// Paths rooted at a custom directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `~/.beacon/config.json`
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Directory holding persisted retry queues, one file per key.
    pub fn queue_dir(&self) -> PathBuf {
        self.base_dir.join("queue")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// `~/.beacon/logs/beacon.jsonl`
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("beacon.jsonl")
    }

    /// Create the base, queue, and logs directories.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.queue_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
