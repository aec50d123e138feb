//! Wire payloads for the collection API.

use beacon_context::{Context, EventType};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Delivery bookkeeping merged into `_metadata`.
#[derive(Debug, Default)]
pub struct Metadata<'a> {
    /// Destinations that failed to load in this engine.
    pub failed_initializations: &'a [String],
    /// Previous delivery attempts of this context.
    pub retry_count: u32,
    pub bundled: &'a [String],
    pub unbundled: &'a [String],
    pub add_bundled: bool,
}

/// Endpoint path segment for a verb.
pub fn path_for(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Track => "t",
        EventType::Identify => "i",
        EventType::Page => "p",
        EventType::Group => "g",
        EventType::Alias => "a",
        EventType::Screen => "s",
    }
}

/// Build the payload posted for `ctx`.
///
/// Adds `writeKey`, a fresh `sentAt` and, when missing, a `messageId`
/// derived from the context id so that every retry carries the same one.
/// `traits` are dropped from track calls.
pub fn normalize(ctx: &Context, write_key: &str, metadata: &Metadata<'_>) -> serde_json::Result<Value> {
    let mut json = serde_json::to_value(ctx.event())?;
    let Value::Object(fields) = &mut json else {
        return Ok(json);
    };

    if ctx.event().event_type == EventType::Track {
        fields.remove("traits");
    }
    fields.insert("writeKey".to_string(), Value::from(write_key));
    fields.insert(
        "sentAt".to_string(),
        Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    if !fields.contains_key("messageId") {
        fields.insert(
            "messageId".to_string(),
            Value::from(format!("beacon-{}", ctx.id())),
        );
    }

    let mut meta = match fields.remove("_metadata") {
        Some(Value::Object(existing)) => existing,
        _ => Map::new(),
    };
    if !metadata.failed_initializations.is_empty() {
        meta.insert(
            "failedInitializations".to_string(),
            Value::from(metadata.failed_initializations.to_vec()),
        );
    }
    if metadata.retry_count > 0 {
        meta.insert("retryCount".to_string(), Value::from(metadata.retry_count));
    }
    if metadata.add_bundled {
        meta.insert("bundled".to_string(), Value::from(sorted(metadata.bundled)));
        meta.insert("unbundled".to_string(), Value::from(sorted(metadata.unbundled)));
    }
    if !meta.is_empty() {
        fields.insert("_metadata".to_string(), Value::Object(meta));
    }

    Ok(json)
}

fn sorted(names: &[String]) -> Vec<String> {
    let mut names = names.to_vec();
    names.sort();
    names.dedup();
    names
}
