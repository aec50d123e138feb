//! The network-facing destination of the Beacon engine.
//!
//! This crate provides:
//! - CollectorDestination: a first-party destination plugin that sends every
//!   verb to the collection API and retries failures through its own
//!   (optionally persisted) retry queue
//! - normalize: turns an event into its wire payload
//! - connect: builds the HTTP dispatcher for a delivery mode

mod config;
mod connect;
mod destination;
mod error;
pub mod normalize;

#[cfg(test)]
mod tests;

pub use config::CollectorConfig;
pub use connect::{connect, DeliveryMode};
pub use destination::CollectorDestination;
pub use error::{CollectorError, CollectorResult};
