//! Structured cancellation and terminal-failure markers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A deliberate short-circuit raised by a plugin.
///
/// `retry` distinguishes "resubmit to the retry queue" from "permanent failure".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub retry: bool,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Cancellation {
    /// Cancellation kind used when middleware declines to forward an event.
    pub const MIDDLEWARE: &'static str = "middleware_cancellation";

    pub fn new(retry: bool, kind: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            retry,
            kind: kind.into(),
            reason,
        }
    }

    /// A cancellation that asks for the context to be retried later.
    pub fn retryable(kind: impl Into<String>) -> Self {
        Self::new(true, kind, None)
    }

    /// A cancellation that permanently fails the context.
    pub fn terminal(kind: impl Into<String>) -> Self {
        Self::new(false, kind, None)
    }

    /// Middleware skipped `next`; never retried.
    pub fn middleware(reason: impl Into<String>) -> Self {
        Self::new(false, Self::MIDDLEWARE, Some(reason.into()))
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_middleware(&self) -> bool {
        self.kind == Self::MIDDLEWARE
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new(true, "plugin Error", None)
    }
}

impl fmt::Display for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} (retry: {}): {}", self.kind, self.retry, reason),
            None => write!(f, "{} (retry: {})", self.kind, self.retry),
        }
    }
}

impl std::error::Error for Cancellation {}

/// Terminal delivery failure recorded on a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDelivery {
    pub reason: String,
}

impl FailedDelivery {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
