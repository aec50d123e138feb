//! Collector scenarios against a recording dispatcher.
//!
//! - `harness`: scripted dispatcher and builders
//! - `delivery`: endpoints, payloads and pipeline integration
//! - `retries`: backoff, rate limits, exhaustion and offline buffering
//! - `persistence`: in-flight recovery across collector instances
//! - `pipeline`: failure reasons seen by callers of the event queue
