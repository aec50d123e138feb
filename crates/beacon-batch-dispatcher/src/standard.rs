//! One request per event.

use crate::error::DeliveryResult;
use crate::transport::{DeliveryRequest, Dispatcher, Transport};
use async_trait::async_trait;
use beacon_context::Environment;
use serde_json::Value;
use std::sync::Arc;

/// Posts every payload on its own; failures surface to the caller.
pub struct StandardDispatcher {
    transport: Arc<dyn Transport>,
    environment: Environment,
}

impl StandardDispatcher {
    pub fn new(transport: Arc<dyn Transport>, environment: Environment) -> Self {
        Self {
            transport,
            environment,
        }
    }
}

#[async_trait]
impl Dispatcher for StandardDispatcher {
    async fn dispatch(&self, url: &str, payload: Value) -> DeliveryResult<()> {
        let body = serde_json::to_string(&payload)?;
        self.transport
            .send(DeliveryRequest {
                url: url.to_string(),
                body,
                keepalive: self.environment.is_exiting(),
            })
            .await
    }
}
