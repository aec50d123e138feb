//! The unit of work: one event plus its in-flight metadata.

use crate::{Cancellation, ContextError, ContextResult, Event, FailedDelivery, Stats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A log line attached to a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
    pub time: DateTime<Utc>,
}

/// One event travelling through the pipeline.
///
/// `id` is stable across every retry of the same logical event. Once
/// `cancellation` is set the context is terminal and its event is read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    id: String,
    event: Event,
    #[serde(default)]
    attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cancellation: Option<Cancellation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failed_delivery: Option<FailedDelivery>,
    #[serde(default)]
    stats: Stats,
    #[serde(default)]
    logs: Vec<LogEntry>,
}

impl Context {
    /// Create a context with a fresh id.
    pub fn new(event: Event) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), event)
    }

    /// Create a context with a caller-chosen id.
    pub fn with_id(id: impl Into<String>, event: Event) -> Self {
        Self {
            id: id.into(),
            event,
            attempts: 0,
            cancellation: None,
            failed_delivery: None,
            stats: Stats::new(),
            logs: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether `other` is the same logical event.
    pub fn is_same(&self, other: &Context) -> bool {
        self.id == other.id
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Mutable access to the event; refused once the context is cancelled.
    pub fn event_mut(&mut self) -> ContextResult<&mut Event> {
        self.ensure_mutable()?;
        Ok(&mut self.event)
    }

    /// Set a dotted `path` inside the event to `value`.
    ///
    /// Writes under `integrations.<name>` are ignored when that integration is
    /// explicitly disabled. The event is left untouched if the result would not
    /// be a valid event.
    pub fn update_event(&mut self, path: &str, value: Value) -> ContextResult<&Event> {
        self.ensure_mutable()?;

        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ContextError::InvalidPath(path.to_string()));
        }

        if segments[0] == "integrations" {
            if let Some(name) = segments.get(1) {
                if self.event.integration_setting(name) == Some(&Value::Bool(false)) {
                    return Ok(&self.event);
                }
            }
        }

        let mut doc = serde_json::to_value(&self.event)?;
        set_path(&mut doc, &segments, value);
        self.event = serde_json::from_value(doc)?;
        Ok(&self.event)
    }

    /// Number of full pipeline traversals performed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts;
    }

    /// Move the context into its terminal cancelled state.
    ///
    /// The first cancellation wins; later calls are ignored and return `false`.
    pub fn cancel(&mut self, cancellation: Cancellation) -> bool {
        if self.cancellation.is_some() {
            debug!(
                context_id = %self.id,
                ignored = %cancellation,
                "Context already cancelled"
            );
            return false;
        }
        self.cancellation = Some(cancellation);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_some()
    }

    pub fn cancellation(&self) -> Option<&Cancellation> {
        self.cancellation.as_ref()
    }

    pub fn failed_delivery(&self) -> Option<&FailedDelivery> {
        self.failed_delivery.as_ref()
    }

    pub fn set_failed_delivery(&mut self, reason: impl Into<String>) {
        self.failed_delivery = Some(FailedDelivery::new(reason));
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }

    /// Append to the context log and mirror the line to `tracing`.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, extras: Option<Value>) {
        let message = message.into();
        let extras_str = extras.as_ref().map(|e| e.to_string()).unwrap_or_default();
        match level {
            LogLevel::Debug => debug!(context_id = %self.id, extras = %extras_str, "{}", message),
            LogLevel::Info => info!(context_id = %self.id, extras = %extras_str, "{}", message),
            LogLevel::Warn => warn!(context_id = %self.id, extras = %extras_str, "{}", message),
            LogLevel::Error => error!(context_id = %self.id, extras = %extras_str, "{}", message),
        }
        self.logs.push(LogEntry {
            level,
            message,
            extras,
            time: Utc::now(),
        });
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Fold a copy of this context that travelled its own branch back in.
    ///
    /// Metrics and log lines recorded on `branch` after the fork point are
    /// appended. The branch's `failed_delivery` is kept unless one is
    /// already set.
    pub fn merge_branch(&mut self, branch: Context, metrics_at_fork: usize, logs_at_fork: usize) {
        self.stats
            .merge(branch.stats.metrics().iter().skip(metrics_at_fork).cloned());
        self.logs
            .extend(branch.logs.into_iter().skip(logs_at_fork));
        if self.failed_delivery.is_none() {
            self.failed_delivery = branch.failed_delivery;
        }
    }

    /// Serializable snapshot of the context.
    pub fn to_json(&self) -> ContextResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn ensure_mutable(&self) -> ContextResult<()> {
        match &self.cancellation {
            Some(c) => Err(ContextError::Cancelled(c.kind.clone())),
            None => Ok(()),
        }
    }
}

fn set_path(doc: &mut Value, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut cursor = doc;
    for segment in parents {
        cursor = ensure_object(cursor)
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(cursor).insert(last.to_string(), value);
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}
