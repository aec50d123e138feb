//! Collector error types.

use beacon_batch_dispatcher::DeliveryError;
use beacon_event_queue::PluginError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Invalid API host {host}: {source}")]
    InvalidEndpoint {
        host: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<CollectorError> for PluginError {
    fn from(err: CollectorError) -> Self {
        PluginError::failed(err.to_string())
    }
}

pub type CollectorResult<T> = Result<T, CollectorError>;
