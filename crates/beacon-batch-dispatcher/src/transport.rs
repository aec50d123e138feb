//! HTTP seam for delivery.

use crate::error::{DeliveryError, DeliveryResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Headers carrying a server-requested delay in seconds, in precedence order.
const RETRY_HEADERS: [&str; 2] = ["x-ratelimit-reset", "retry-after"];

/// One POST to the collection API.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    pub url: String,
    pub body: String,
    /// The request must survive process teardown.
    pub keepalive: bool,
}

/// Sends delivery requests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: DeliveryRequest) -> DeliveryResult<()>;
}

/// Hands one normalized payload to the network.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, url: &str, payload: Value) -> DeliveryResult<()>;

    /// Send anything still buffered and resolve once it has been handed off.
    async fn close(&self) {}
}

/// reqwest-backed transport.
pub struct ReqwestTransport {
    client: Client,
    keepalive_timeout: Duration,
}

impl ReqwestTransport {
    /// `timeout` bounds ordinary requests; keepalive requests get `keepalive_timeout`.
    pub fn new(timeout: Duration, keepalive_timeout: Duration) -> DeliveryResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            keepalive_timeout,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: DeliveryRequest) -> DeliveryResult<()> {
        debug!(
            url = %request.url,
            bytes = request.body.len(),
            keepalive = request.keepalive,
            "Sending delivery request"
        );

        let mut builder = self
            .client
            .post(&request.url)
            .header(CONTENT_TYPE, "text/plain")
            .body(request.body);
        if request.keepalive {
            builder = builder.timeout(self.keepalive_timeout);
        }

        let response = builder.send().await?;
        let result = classify_response(response.status().as_u16(), response.headers());
        if let Err(ref e) = result {
            warn!(url = %request.url, error = %e, "Delivery request failed");
        }
        result
    }
}

/// Map an HTTP status to a delivery outcome.
pub fn classify_response(status: u16, headers: &HeaderMap) -> DeliveryResult<()> {
    match status {
        200..=299 => Ok(()),
        429 => Err(DeliveryError::RateLimited {
            retry_after: retry_after_from_headers(headers),
        }),
        500..=u16::MAX => Err(DeliveryError::Server { status }),
        _ => Err(DeliveryError::Rejected { status }),
    }
}

/// Server-requested delay: `x-ratelimit-reset`, then `Retry-After`, both in seconds.
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    RETRY_HEADERS
        .iter()
        .find_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        })
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn success_statuses() {
        assert!(classify_response(200, &HeaderMap::new()).is_ok());
        assert!(classify_response(204, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = classify_response(503, &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, DeliveryError::Server { status: 503 }));
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_are_terminal() {
        let err = classify_response(400, &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 400 }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limit_reads_reset_header() {
        let err = classify_response(429, &headers(&[("x-ratelimit-reset", "5")])).unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn rate_limit_falls_back_to_retry_after() {
        let map = headers(&[("retry-after", "12")]);
        assert_eq!(retry_after_from_headers(&map), Some(Duration::from_secs(12)));

        let both = headers(&[("x-ratelimit-reset", "3"), ("retry-after", "12")]);
        assert_eq!(retry_after_from_headers(&both), Some(Duration::from_secs(3)));
    }

    #[test]
    fn rate_limit_without_usable_header() {
        let err = classify_response(429, &headers(&[("retry-after", "soon")])).unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), None);
    }
}
