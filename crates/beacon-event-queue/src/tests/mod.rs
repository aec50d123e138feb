//! Scenario tests for the event queue.
//!
//! - `harness.rs`      - Configurable test plugin and queue builders
//! - `pipeline.rs`     - Stage ordering, error containment, fan-out, metrics
//! - `retry.rs`        - Retryable cancellations, attempts, offline, persistence
//! - `registration.rs` - Plugin sources, load failures, deregistration

mod pipeline;
