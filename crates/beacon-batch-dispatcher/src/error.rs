//! Delivery error types.

use std::time::Duration;
use thiserror::Error;

/// Failure to hand a payload to the collection API.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Transport-level failure (connect, timeout, ...)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Server error (HTTP 5xx)
    #[error("Server error: HTTP {status}")]
    Server { status: u16 },

    /// Throttled (HTTP 429), with the server's retry-after when given
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Request refused (other non-2xx)
    #[error("Request rejected: HTTP {status}")]
    Rejected { status: u16 },

    /// Payload above the byte ceiling
    #[error("Payload of {bytes} bytes exceeds the {limit} byte limit")]
    TooLarge { bytes: usize, limit: usize },

    /// JSON encoding error
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Whether the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Http(_) | DeliveryError::Server { .. } | DeliveryError::RateLimited { .. }
        )
    }

    /// Server-requested delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, DeliveryError::RateLimited { .. })
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Http(err.to_string())
    }
}

/// Result type alias using DeliveryError.
pub type DeliveryResult<T> = Result<T, DeliveryError>;
