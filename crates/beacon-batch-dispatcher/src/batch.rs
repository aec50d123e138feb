//! Coalescing dispatcher.
//!
//! Payloads are buffered and sent to a single batch endpoint as
//! `{writeKey, batch, sentAt}`. A flush happens when the buffer reaches the
//! configured count, when it gets within `flush_margin_bytes` of the byte
//! ceiling, when the process is exiting, or when the single armed timer fires.
//! Retryable failures put the batch back at the head of the buffer and re-arm
//! the timer, honouring server rate-limit delays. Until that timer fires,
//! dispatches that would flush only keep buffering.

use crate::error::{DeliveryError, DeliveryResult};
use crate::transport::{DeliveryRequest, Dispatcher, Transport};
use async_trait::async_trait;
use beacon_context::Environment;
use chrono::{SecondsFormat, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Room reserved in every request body for the envelope fields.
const ENVELOPE_BYTES: usize = 128;

/// Configuration for [`BatchDispatcher`].
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Events per batch.
    pub size: usize,
    /// Delay before a partially filled buffer is flushed.
    pub timeout: Duration,
    /// Encoded size ceiling for one request body.
    pub max_payload_bytes: usize,
    /// Flush early once the buffer is this close to the ceiling.
    pub flush_margin_bytes: usize,
    /// Body ceiling for requests sent while exiting.
    pub keepalive_chunk_bytes: usize,
    /// Retries for a failed batch before it is dropped.
    pub retry_attempts: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 10,
            timeout: Duration::from_millis(5000),
            max_payload_bytes: 500 * 1024,
            flush_margin_bytes: 50 * 1024,
            keepalive_chunk_bytes: 64 * 1024,
            retry_attempts: 10,
        }
    }
}

struct Buffered {
    payload: Value,
    bytes: usize,
}

impl Buffered {
    fn new(payload: Value) -> DeliveryResult<Self> {
        let bytes = serde_json::to_vec(&payload)?.len();
        Ok(Self { payload, bytes })
    }

    /// Stamp `_metadata.retryCount` on payloads that carry metadata.
    fn with_retry_count(mut self, attempt: u32) -> Self {
        if let Some(Value::Object(metadata)) = self.payload.get_mut("_metadata") {
            metadata.insert("retryCount".to_string(), Value::from(attempt));
            if let Ok(encoded) = serde_json::to_vec(&self.payload) {
                self.bytes = encoded.len();
            }
        }
        self
    }

    fn cost(&self) -> usize {
        // separating comma
        self.bytes + 1
    }
}

#[derive(Default)]
struct BatchState {
    buffer: VecDeque<Buffered>,
    bytes: usize,
    /// Generation of the armed timer, if any.
    timer: Option<u64>,
    generation: u64,
    /// Flushes triggered before this wait for the retry timer.
    retry_not_before: Option<Instant>,
}

impl BatchState {
    fn push_back(&mut self, item: Buffered) {
        self.bytes += item.bytes;
        self.buffer.push_back(item);
    }

    fn push_front(&mut self, item: Buffered) {
        self.bytes += item.bytes;
        self.buffer.push_front(item);
    }

    /// Longest head of the buffer within both ceilings; never empty unless the buffer is.
    fn take_prefix(&mut self, max_count: usize, max_bytes: usize) -> Vec<Buffered> {
        let mut batch = Vec::new();
        let mut used = ENVELOPE_BYTES;
        while let Some(front) = self.buffer.front() {
            if batch.len() >= max_count || (!batch.is_empty() && used + front.cost() > max_bytes) {
                break;
            }
            used += front.cost();
            if let Some(item) = self.buffer.pop_front() {
                self.bytes -= item.bytes;
                batch.push(item);
            }
        }
        batch
    }

    fn take_all(&mut self) -> Vec<Buffered> {
        self.bytes = 0;
        self.buffer.drain(..).collect()
    }

    fn cancel_timer(&mut self) {
        self.timer = None;
        self.generation += 1;
    }

    fn throttled_for(&self) -> Option<Duration> {
        self.retry_not_before
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }
}

/// Buffers payloads and delivers them in batches.
///
/// Construct with [`start`](Self::start) inside a Tokio runtime; it spawns
/// the exit listener that drains the buffer in keepalive-sized chunks.
#[derive(Clone)]
pub struct BatchDispatcher {
    inner: Arc<BatchInner>,
}

struct BatchInner {
    endpoint: String,
    config: BatchConfig,
    transport: Arc<dyn Transport>,
    environment: Environment,
    state: Mutex<BatchState>,
    /// Held for the duration of a drain so concurrent closers wait for it.
    draining: tokio::sync::Mutex<()>,
}

impl BatchDispatcher {
    /// Create a dispatcher posting to `endpoint` and start its exit listener.
    pub fn start(
        endpoint: impl Into<String>,
        config: BatchConfig,
        transport: Arc<dyn Transport>,
        environment: Environment,
    ) -> Self {
        let config = BatchConfig {
            size: config.size.max(1),
            ..config
        };
        let inner = Arc::new(BatchInner {
            endpoint: endpoint.into(),
            config,
            transport,
            environment: environment.clone(),
            state: Mutex::new(BatchState::default()),
            draining: tokio::sync::Mutex::new(()),
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            environment.exited().await;
            if let Some(inner) = weak.upgrade() {
                inner.drain_on_exit().await;
            }
        });

        Self { inner }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Number of buffered payloads.
    pub fn len(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Dispatcher for BatchDispatcher {
    /// Buffer `payload`; `url` is superseded by the batch endpoint.
    ///
    /// Only local failures are returned. Network failures are retried in the
    /// background and logged when the batch is finally dropped.
    async fn dispatch(&self, url: &str, mut payload: Value) -> DeliveryResult<()> {
        let inner = &self.inner;
        if let Some(fields) = payload.as_object_mut() {
            fields.remove("sentAt");
        }

        let item = Buffered::new(payload)?;
        let limit = inner.config.max_payload_bytes;
        if item.bytes + ENVELOPE_BYTES > limit {
            return Err(DeliveryError::TooLarge {
                bytes: item.bytes,
                limit,
            });
        }

        let exiting = inner.environment.is_exiting();
        let (flush_now, throttled) = {
            let mut state = inner.state.lock();
            state.push_back(item);
            trace!(url = %url, buffered = state.buffer.len(), "Buffered payload");
            (
                exiting || inner.should_flush(&state),
                state.throttled_for(),
            )
        };

        match (flush_now, throttled) {
            (true, Some(wait)) if !exiting => inner.arm(wait, 1, false),
            (true, _) => inner.flush(1).await,
            (false, _) => inner.arm(inner.config.timeout, 1, false),
        }
        Ok(())
    }

    /// Drain the buffer in keepalive-sized chunks, waiting for any drain
    /// already started by the exit listener.
    async fn close(&self) {
        self.inner.drain_on_exit().await;
    }
}

impl BatchInner {
    fn should_flush(&self, state: &BatchState) -> bool {
        let threshold = self
            .config
            .max_payload_bytes
            .saturating_sub(self.config.flush_margin_bytes);
        state.buffer.len() >= self.config.size || state.bytes >= threshold
    }

    /// Arm the flush timer unless one is pending; `replace` re-arms it regardless.
    fn arm(self: &Arc<Self>, delay: Duration, attempt: u32, replace: bool) {
        let generation = {
            let mut state = self.state.lock();
            if state.timer.is_some() && !replace {
                return;
            }
            state.generation += 1;
            state.timer = Some(state.generation);
            state.generation
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = inner.state.lock();
                if state.timer != Some(generation) {
                    return;
                }
                state.timer = None;
            }
            inner.flush(attempt).await;
        });
    }

    async fn flush(self: &Arc<Self>, mut attempt: u32) {
        loop {
            let keepalive = self.environment.is_exiting();
            let byte_limit = if keepalive {
                self.config.keepalive_chunk_bytes
            } else {
                self.config.max_payload_bytes
            };

            let batch = self.state.lock().take_prefix(self.config.size, byte_limit);
            if batch.is_empty() {
                return;
            }

            let events = batch.len();
            match self.send_batch(&batch, keepalive).await {
                Ok(()) => {
                    debug!(events, attempt, keepalive, "Batch delivered");
                    let (again, pending) = {
                        let state = self.state.lock();
                        (
                            self.environment.is_exiting() || self.should_flush(&state),
                            !state.buffer.is_empty(),
                        )
                    };
                    if again && pending {
                        attempt = 1;
                        continue;
                    }
                    if pending {
                        self.arm(self.config.timeout, 1, false);
                    }
                    return;
                }
                Err(e) => {
                    self.handle_failure(batch, attempt, e);
                    return;
                }
            }
        }
    }

    fn handle_failure(self: &Arc<Self>, batch: Vec<Buffered>, attempt: u32, err: DeliveryError) {
        let events = batch.len();
        if !err.is_retryable() || attempt > self.config.retry_attempts {
            error!(events, attempt, error = %err, "Dropping batch");
            return;
        }

        let delay = err.retry_after().unwrap_or(self.config.timeout);
        warn!(
            events,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Batch delivery failed, scheduling retry"
        );

        {
            let mut state = self.state.lock();
            state.retry_not_before = Some(Instant::now() + delay);
            for item in batch.into_iter().rev() {
                state.push_front(item.with_retry_count(attempt));
            }
        }
        self.arm(delay, attempt + 1, true);
    }

    async fn drain_on_exit(&self) {
        let _draining = self.draining.lock().await;
        let pending = {
            let mut state = self.state.lock();
            state.cancel_timer();
            state.take_all()
        };
        if pending.is_empty() {
            return;
        }

        let events = pending.len();
        let chunks = chunk_for_exit(pending, self.config.size, self.config.keepalive_chunk_bytes);
        info!(events, chunks = chunks.len(), "Draining batch buffer on exit");

        let sends = chunks.iter().map(|chunk| self.send_batch(chunk, true));
        for result in join_all(sends).await {
            if let Err(e) = result {
                warn!(error = %e, "Exit chunk delivery failed");
            }
        }
    }

    async fn send_batch(&self, batch: &[Buffered], keepalive: bool) -> DeliveryResult<()> {
        let mut body = Map::new();
        if let Some(write_key) = batch.first().and_then(|b| b.payload.get("writeKey")) {
            body.insert("writeKey".to_string(), write_key.clone());
        }
        body.insert(
            "batch".to_string(),
            Value::Array(batch.iter().map(|b| b.payload.clone()).collect()),
        );
        body.insert(
            "sentAt".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        self.transport
            .send(DeliveryRequest {
                url: self.endpoint.clone(),
                body: serde_json::to_string(&Value::Object(body))?,
                keepalive,
            })
            .await
    }
}

/// Split into runs of at most `max_count` events whose request body stays
/// within `limit` bytes.
///
/// A payload that alone exceeds `limit` gets a chunk of its own.
fn chunk_for_exit(items: Vec<Buffered>, max_count: usize, limit: usize) -> Vec<Vec<Buffered>> {
    let max_count = max_count.max(1);
    let mut chunks = Vec::new();
    let mut current: Vec<Buffered> = Vec::new();
    let mut used = ENVELOPE_BYTES;

    for item in items {
        if !current.is_empty() && (current.len() >= max_count || used + item.cost() > limit) {
            chunks.push(mem::take(&mut current));
            used = ENVELOPE_BYTES;
        }
        used += item.cost();
        current.push(item);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
