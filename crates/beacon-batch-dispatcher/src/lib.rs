//! Network delivery for normalized event payloads.
//!
//! This crate provides:
//! - Transport: the HTTP seam, with a reqwest implementation
//! - DeliveryError: retryable/terminal classification and rate-limit delays
//! - StandardDispatcher: one request per event
//! - BatchDispatcher: coalesces events into size- and byte-bounded batches,
//!   retries throttled or failed batches and drains in small chunks on exit

mod batch;
mod error;
mod standard;
mod transport;

#[cfg(test)]
mod tests;

pub use batch::{BatchConfig, BatchDispatcher};
pub use error::{DeliveryError, DeliveryResult};
pub use standard::StandardDispatcher;
pub use transport::{
    classify_response, retry_after_from_headers, DeliveryRequest, Dispatcher, ReqwestTransport,
    Transport,
};
