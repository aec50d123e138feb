//! Unit-of-work model for the Beacon event delivery engine.
//!
//! This crate provides:
//! - Event: the analytics payload (track/identify/page/group/alias/screen)
//! - Context: an event plus in-flight metadata (attempts, cancellation, stats)
//! - Cancellation: structured short-circuit distinguishing retry from terminal outcomes
//! - Environment: explicit handle for host connectivity and exit signals

mod cancellation;
mod context;
mod environment;
mod error;
mod event;
mod stats;

pub use cancellation::{Cancellation, FailedDelivery};
pub use context::{Context, LogEntry, LogLevel};
pub use environment::Environment;
pub use error::{ContextError, ContextResult};
pub use event::{Event, EventType};
pub use stats::{Metric, MetricKind, Stats};
