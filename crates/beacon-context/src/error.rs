//! Context error types.

use thiserror::Error;

/// Context error type.
#[derive(Error, Debug)]
pub enum ContextError {
    /// The context was cancelled and its event can no longer change
    #[error("Context is cancelled ({0}); event is read-only")]
    Cancelled(String),

    /// Malformed dotted path passed to `update_event`
    #[error("Invalid event path: {0}")]
    InvalidPath(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using ContextError.
pub type ContextResult<T> = Result<T, ContextError>;
