//! Error types for the dispatcher.

use beacon_context::Cancellation;
use thiserror::Error;

/// Outcome of a failing stage hook.
///
/// Inside the pipeline both variants are folded into the context; only
/// direct callers of [`invoke`](crate::delivery::invoke) ever see them.
#[derive(Error, Debug, Clone)]
pub enum PluginError {
    /// Deliberate short-circuit.
    #[error("{0}")]
    Cancelled(Cancellation),

    /// The hook failed or panicked.
    #[error("plugin failed: {0}")]
    Failed(String),
}

impl PluginError {
    pub fn failed(reason: impl Into<String>) -> Self {
        PluginError::Failed(reason.into())
    }

    /// Whether the context should be handed back to the retry queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PluginError::Cancelled(c) if c.retry && !c.is_middleware())
    }

    pub fn is_middleware_cancellation(&self) -> bool {
        matches!(self, PluginError::Cancelled(c) if c.is_middleware())
    }

    /// The cancellation recorded on a context this error terminates.
    pub fn to_cancellation(&self) -> Cancellation {
        match self {
            PluginError::Cancelled(c) => c.clone(),
            PluginError::Failed(reason) => Cancellation::terminal("plugin Error").with_reason(reason),
        }
    }
}

impl From<Cancellation> for PluginError {
    fn from(cancellation: Cancellation) -> Self {
        PluginError::Cancelled(cancellation)
    }
}

/// Error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Plugin does not satisfy the registration contract
    #[error("Invalid plugin: {0}")]
    InvalidPlugin(String),

    /// A plugin with this name is already registered
    #[error("Plugin already registered: {0}")]
    DuplicatePlugin(String),

    /// No plugin with this name is registered
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Non-destination plugin failed to load
    #[error("Failed to load plugin {plugin}: {source}")]
    Load { plugin: String, source: PluginError },
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_plain_retryable_cancellations_retry() {
        assert!(PluginError::from(Cancellation::retryable("busy")).is_retryable());
        assert!(!PluginError::from(Cancellation::terminal("blocked")).is_retryable());
        assert!(!PluginError::from(Cancellation::middleware("skipped")).is_retryable());
        assert!(!PluginError::failed("boom").is_retryable());
    }

    #[test]
    fn failures_become_terminal_cancellations() {
        let c = PluginError::failed("boom").to_cancellation();
        assert!(!c.retry);
        assert_eq!(c.reason.as_deref(), Some("boom"));
    }
}
