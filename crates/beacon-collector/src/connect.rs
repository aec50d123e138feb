//! HTTP dispatcher construction.

use crate::error::CollectorResult;
use beacon_batch_dispatcher::{
    BatchConfig, BatchDispatcher, Dispatcher, ReqwestTransport, StandardDispatcher, Transport,
};
use beacon_context::Environment;
use std::sync::Arc;
use std::time::Duration;

/// Timeout for requests sent while the process is exiting.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// How payloads reach the collection API.
#[derive(Debug, Clone)]
pub enum DeliveryMode {
    /// One request per event.
    Standard,
    /// Coalesced requests to `<api_host>/b`.
    Batching(BatchConfig),
}

/// Build the reqwest-backed dispatcher for `mode`.
///
/// Batching starts a background exit listener and needs a Tokio runtime.
pub fn connect(
    api_host: &str,
    mode: DeliveryMode,
    request_timeout: Duration,
    environment: &Environment,
) -> CollectorResult<Arc<dyn Dispatcher>> {
    let transport: Arc<dyn Transport> =
        Arc::new(ReqwestTransport::new(request_timeout, KEEPALIVE_TIMEOUT)?);

    let dispatcher: Arc<dyn Dispatcher> = match mode {
        DeliveryMode::Standard => Arc::new(StandardDispatcher::new(transport, environment.clone())),
        DeliveryMode::Batching(config) => Arc::new(BatchDispatcher::start(
            format!("{}/b", api_host.trim_end_matches('/')),
            config,
            transport,
            environment.clone(),
        )),
    };
    Ok(dispatcher)
}
