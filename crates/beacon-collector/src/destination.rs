//! The collection API destination.

use crate::config::CollectorConfig;
use crate::error::{CollectorError, CollectorResult};
use crate::normalize::{normalize, path_for, Metadata};
use async_trait::async_trait;
use beacon_batch_dispatcher::Dispatcher;
use beacon_context::{Context, Environment, EventType, LogLevel};
use beacon_event_queue::delivery::attempt;
use beacon_event_queue::{EngineHandle, HookResult, Plugin, PluginError, PluginKind};
use beacon_retry_queue::{DurableStore, PushResult, RejectReason, RetryQueue};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// First-party destination posting every verb to the collection API.
///
/// Failed deliveries wait in the destination's own retry queue and are
/// redelivered by a randomized scheduled flush that re-arms while work
/// remains. Contexts being sent are tracked as in flight; on exit they are
/// moved back into the queue so a persisted queue can resume them.
#[derive(Clone)]
pub struct CollectorDestination {
    inner: Arc<CollectorInner>,
}

struct CollectorInner {
    config: CollectorConfig,
    base_url: String,
    dispatcher: Arc<dyn Dispatcher>,
    environment: Environment,
    queue: Mutex<RetryQueue<Context>>,
    engine: OnceLock<EngineHandle>,
    loaded: AtomicBool,
    flush_scheduled: AtomicBool,
    watching_exit: AtomicBool,
}

impl CollectorDestination {
    /// Destination with an in-memory retry queue.
    pub fn new(
        config: CollectorConfig,
        dispatcher: Arc<dyn Dispatcher>,
        environment: Environment,
    ) -> CollectorResult<Self> {
        let queue = RetryQueue::in_memory(config.retry_queue_config());
        Self::with_queue(config, dispatcher, environment, queue)
    }

    /// Destination whose retry queue lives in `store` under
    /// `<write_key>:dest-<name>`.
    pub fn persisted(
        config: CollectorConfig,
        dispatcher: Arc<dyn Dispatcher>,
        environment: Environment,
        store: Arc<dyn DurableStore>,
    ) -> CollectorResult<Self> {
        let queue = RetryQueue::persisted(
            config.retry_queue_config(),
            store,
            &config.write_key,
            &config.storage_name(),
        );
        Self::with_queue(config, dispatcher, environment, queue)
    }

    fn with_queue(
        config: CollectorConfig,
        dispatcher: Arc<dyn Dispatcher>,
        environment: Environment,
        queue: RetryQueue<Context>,
    ) -> CollectorResult<Self> {
        Url::parse(&config.api_host).map_err(|source| CollectorError::InvalidEndpoint {
            host: config.api_host.clone(),
            source,
        })?;
        let base_url = config.api_host.trim_end_matches('/').to_string();

        Ok(Self {
            inner: Arc::new(CollectorInner {
                config,
                base_url,
                dispatcher,
                environment,
                queue: Mutex::new(queue),
                engine: OnceLock::new(),
                loaded: AtomicBool::new(false),
                flush_scheduled: AtomicBool::new(false),
                watching_exit: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.inner.config
    }

    /// URL a verb is posted to.
    pub fn endpoint(&self, event_type: EventType) -> String {
        self.inner.endpoint(event_type)
    }

    /// Contexts waiting for redelivery.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Contexts currently being sent.
    pub fn in_flight(&self) -> usize {
        self.inner.queue.lock().in_flight_count()
    }

    /// Delivery attempts recorded for a context id.
    pub fn attempts(&self, id: &str) -> u32 {
        self.inner.queue.lock().get_attempts(id)
    }

    /// Redeliver every due context now; returns how many were attempted.
    pub async fn flush(&self) -> usize {
        self.inner.flush_queue().await
    }

    /// Move in-flight contexts back into the retry queue.
    ///
    /// Runs on its own when the exit signal fires; hosts that are about to
    /// stop the runtime call it directly so a persisted queue is current.
    pub fn suspend(&self) -> usize {
        self.inner.suspend()
    }
}

#[async_trait]
impl Plugin for CollectorDestination {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Destination
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn is_first_party(&self) -> bool {
        true
    }

    fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::SeqCst)
    }

    async fn load(&self, _ctx: &Context, engine: &EngineHandle) -> Result<(), PluginError> {
        let _ = self.inner.engine.set(engine.clone());
        self.inner.loaded.store(true, Ordering::SeqCst);
        self.inner.watch_exit();

        let todo = self.inner.queue.lock().todo();
        if todo > 0 {
            info!(destination = %self.name(), todo, "Resuming queued deliveries");
            self.inner.schedule_flush();
        }
        Ok(())
    }

    async fn unload(&self, _ctx: &Context, _engine: &EngineHandle) -> Result<(), PluginError> {
        self.inner.loaded.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn track(&self, ctx: Context) -> HookResult {
        self.inner.send(ctx).await
    }

    async fn identify(&self, ctx: Context) -> HookResult {
        self.inner.send(ctx).await
    }

    async fn page(&self, ctx: Context) -> HookResult {
        self.inner.send(ctx).await
    }

    async fn group(&self, ctx: Context) -> HookResult {
        self.inner.send(ctx).await
    }

    async fn alias(&self, ctx: Context) -> HookResult {
        self.inner.send(ctx).await
    }

    async fn screen(&self, ctx: Context) -> HookResult {
        self.inner.send(ctx).await
    }
}

impl CollectorInner {
    fn endpoint(&self, event_type: EventType) -> String {
        format!("{}/{}", self.base_url, path_for(event_type))
    }

    async fn send(self: &Arc<Self>, mut ctx: Context) -> HookResult {
        let id = ctx.id().to_string();

        if self.environment.is_offline() {
            debug!(context_id = %id, "Offline, queueing context");
            let result = self.queue.lock().push(ctx.clone());
            self.record_push(&mut ctx, result);
            self.schedule_flush();
            return Ok(ctx);
        }

        let retry_count = {
            let mut queue = self.queue.lock();
            let attempts = queue.get_attempts(&id);
            if attempts >= queue.max_attempts() {
                Err(queue.remove(&id))
            } else {
                queue.mark_in_flight(ctx.clone());
                Ok(attempts)
            }
        };
        let retry_count = match retry_count {
            Ok(retry_count) => retry_count,
            Err(queued) => {
                let reason = queued
                    .as_ref()
                    .and_then(last_error)
                    .unwrap_or_else(|| exhausted_reason(&ctx));
                warn!(context_id = %id, reason = %reason, "Attempts exhausted, dropping context");
                ctx.set_failed_delivery(reason);
                return Ok(ctx);
            }
        };

        let payload = match self.payload(&ctx, retry_count) {
            Ok(payload) => payload,
            Err(e) => {
                self.queue.lock().complete(&id);
                return Err(e.into());
            }
        };
        let url = self.endpoint(ctx.event().event_type);

        match self.dispatcher.dispatch(&url, payload).await {
            Ok(()) => {
                self.queue.lock().complete(&id);
                debug!(context_id = %id, url = %url, "Delivered");
            }
            Err(e) => {
                ctx.log(
                    LogLevel::Error,
                    "Error sending event",
                    Some(json!({ "error": e.to_string() })),
                );
                if e.is_retryable() {
                    let result = self.queue.lock().push_with_backoff(ctx.clone(), e.retry_after());
                    self.record_push(&mut ctx, result);
                    self.schedule_flush();
                } else {
                    self.queue.lock().complete(&id);
                    ctx.set_failed_delivery(e.to_string());
                }
            }
        }
        Ok(ctx)
    }

    fn payload(&self, ctx: &Context, retry_count: u32) -> CollectorResult<Value> {
        let engine = self.engine.get();
        let failed = engine
            .map(EngineHandle::failed_initializations)
            .unwrap_or_default();
        let write_key = match engine {
            Some(engine) if self.config.write_key.is_empty() => engine.write_key(),
            _ => self.config.write_key.as_str(),
        };

        let mut bundled = vec![self.config.name.clone()];
        bundled.extend(self.config.bundled_integrations.iter().cloned());

        let metadata = Metadata {
            failed_initializations: &failed,
            retry_count,
            bundled: &bundled,
            unbundled: &self.config.unbundled_integrations,
            add_bundled: self.config.add_bundled_metadata,
        };
        Ok(normalize(ctx, write_key, &metadata)?)
    }

    fn record_push(&self, ctx: &mut Context, result: PushResult<Context>) {
        match result {
            PushResult::Accepted { evicted: Some(old) } => {
                warn!(context_id = %old.id(), "Retry queue full, evicted oldest context");
            }
            PushResult::Accepted { evicted: None } => {}
            PushResult::Rejected {
                reason: RejectReason::AttemptsExhausted,
                ..
            } => {
                let reason = exhausted_reason(ctx);
                warn!(context_id = %ctx.id(), reason = %reason, "Attempts exhausted, dropping context");
                ctx.set_failed_delivery(reason);
            }
            PushResult::Rejected {
                reason: RejectReason::Duplicate,
                ..
            } => {
                debug!(context_id = %ctx.id(), "Context already queued");
            }
        }
    }

    /// Arm one randomized flush of the retry queue unless one is pending.
    fn schedule_flush(self: &Arc<Self>) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let jitter_ms = self.config.flush_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        let due_in = self.queue.lock().next_ready_in().unwrap_or(Duration::ZERO);
        let delay = jitter.max(due_in);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.environment.is_offline() {
                inner.environment.online().await;
            }
            inner.flush_queue().await;
            inner.flush_scheduled.store(false, Ordering::SeqCst);

            let remaining = inner.queue.lock().len();
            if remaining > 0 {
                inner.schedule_flush();
            }
        });
    }

    async fn flush_queue(self: &Arc<Self>) -> usize {
        let due = self.queue.lock().flush(&self.environment);
        if due.is_empty() {
            return 0;
        }

        let count = due.len();
        debug!(destination = %self.config.name, count, "Flushing retry queue");
        let plugin = CollectorDestination {
            inner: Arc::clone(self),
        };
        for ctx in due {
            if let Err(failure) = attempt(ctx, &plugin).await {
                let id = failure.ctx.id().to_string();
                let mut ctx = failure.ctx;
                let result = self.queue.lock().push_with_backoff(ctx.clone(), None);
                self.record_push(&mut ctx, result);
                debug!(context_id = %id, error = %failure.error, "Redelivery failed");
            }
        }
        count
    }

    fn watch_exit(self: &Arc<Self>) {
        if self.watching_exit.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        let environment = self.environment.clone();
        tokio::spawn(async move {
            environment.exited().await;
            if let Some(inner) = weak.upgrade() {
                inner.suspend();
            }
        });
    }

    fn suspend(&self) -> usize {
        let restored = self.queue.lock().restore_in_flight();
        if restored > 0 {
            info!(
                destination = %self.config.name,
                restored,
                "Returned in-flight contexts to the retry queue"
            );
        }
        restored
    }
}

/// Most recent delivery error logged on `ctx`.
fn last_error(ctx: &Context) -> Option<String> {
    ctx.logs()
        .iter()
        .rev()
        .filter(|entry| entry.level == LogLevel::Error)
        .find_map(|entry| entry.extras.as_ref()?.get("error")?.as_str().map(str::to_string))
}

/// Reason recorded when a context runs out of attempts.
fn exhausted_reason(ctx: &Context) -> String {
    last_error(ctx).unwrap_or_else(|| "attempts exhausted".to_string())
}
