//! Explicit engine handle passed to plugins.

use beacon_context::Environment;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared engine state.
///
/// Constructed once per engine and cloned into the event queue and every
/// plugin `load` call. There is no process-wide instance. Apart from the list
/// of destinations that failed to load, it is read-only.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    write_key: String,
    environment: Environment,
    failed_initializations: Mutex<Vec<String>>,
}

impl EngineHandle {
    pub fn new(write_key: impl Into<String>, environment: Environment) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                write_key: write_key.into(),
                environment,
                failed_initializations: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn write_key(&self) -> &str {
        &self.inner.write_key
    }

    pub fn environment(&self) -> &Environment {
        &self.inner.environment
    }

    /// Names of destinations whose `load` failed.
    pub fn failed_initializations(&self) -> Vec<String> {
        self.inner.failed_initializations.lock().clone()
    }

    pub(crate) fn record_failed_initialization(&self, name: String) {
        let mut failed = self.inner.failed_initializations.lock();
        if !failed.contains(&name) {
            failed.push(name);
        }
    }
}
