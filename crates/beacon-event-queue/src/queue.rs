//! The staged dispatcher.

use crate::delivery::{self, StageFailure};
use crate::{
    EngineError, EngineHandle, EngineResult, Plugin, PluginKind, PluginSource, QueueEvent,
};
use beacon_context::Context;
use beacon_retry_queue::{BackoffPolicy, PushResult, RetryQueue, RetryQueueConfig};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Event queue configuration.
#[derive(Debug, Clone)]
pub struct EventQueueConfig {
    /// Full traversals allowed per context.
    pub max_attempts: u32,
    /// Bound on contexts waiting in the retry queue.
    pub max_size: usize,
    /// Delay schedule between traversals.
    pub backoff: BackoffPolicy,
    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_size: 1000,
            backoff: BackoffPolicy::default(),
            event_capacity: 100,
        }
    }
}

impl EventQueueConfig {
    pub fn retry_queue_config(&self) -> RetryQueueConfig {
        RetryQueueConfig {
            max_attempts: self.max_attempts,
            max_size: self.max_size,
            backoff: self.backoff.clone(),
        }
    }
}

/// Runs contexts through `before → enrichment → destination → after`.
///
/// [`dispatch`](Self::dispatch) never fails: plugin errors, cancellations
/// and exhausted retries are all reported on the returned [`Context`].
/// Different contexts traverse concurrently; a single context visits its
/// plugins strictly in order.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

struct Inner {
    engine: EngineHandle,
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    state: Mutex<DispatchState>,
    waiting_online: AtomicBool,
    events: broadcast::Sender<QueueEvent>,
}

struct DispatchState {
    queue: RetryQueue<Context>,
    /// Contexts currently traversing the pipeline.
    processing: HashSet<String>,
    waiters: HashMap<String, Vec<oneshot::Sender<Context>>>,
}

impl DispatchState {
    fn wait_for(&mut self, id: &str) -> oneshot::Receiver<Context> {
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(id.to_string()).or_default().push(tx);
        rx
    }

    fn is_pending(&self, id: &str) -> bool {
        self.processing.contains(id) || self.queue.includes(id)
    }

    /// Hand the final context to everyone awaiting it.
    fn settle(&mut self, ctx: &Context) {
        self.processing.remove(ctx.id());
        self.queue.forget(ctx.id());
        for tx in self.waiters.remove(ctx.id()).unwrap_or_default() {
            let _ = tx.send(ctx.clone());
        }
    }
}

enum Traversal {
    Delivered(Context),
    Failed(Context),
    Retry(Context, String),
}

impl EventQueue {
    pub fn new(engine: EngineHandle, config: EventQueueConfig) -> Self {
        let queue = RetryQueue::in_memory(config.retry_queue_config());
        Self::with_retry_queue(engine, queue, config.event_capacity)
    }

    /// Build around an existing (e.g. persisted) retry queue.
    ///
    /// Contexts restored from a previous session are resumed once the first
    /// plugin is registered.
    pub fn with_retry_queue(
        engine: EngineHandle,
        queue: RetryQueue<Context>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        if !queue.is_empty() {
            info!(pending = queue.len(), "Retry queue holds contexts from a previous session");
        }
        let inner = Arc::new(Inner {
            engine,
            plugins: RwLock::new(Vec::new()),
            state: Mutex::new(DispatchState {
                queue,
                processing: HashSet::new(),
                waiters: HashMap::new(),
            }),
            waiting_online: AtomicBool::new(false),
            events,
        });
        Self { inner }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.inner.engine
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.inner.plugins.read().clone()
    }

    /// Names of destinations whose `load` failed during registration.
    pub fn failed_initializations(&self) -> Vec<String> {
        self.inner.engine.failed_initializations()
    }

    /// Contexts waiting in the retry queue.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every before and enrichment plugin reports itself loaded.
    /// Destinations that are not loaded are skipped rather than waited on.
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Load `source` and add it to the pipeline.
    ///
    /// A destination that fails to load is skipped and listed in
    /// [`failed_initializations`](Self::failed_initializations); any other
    /// stage's load failure is returned.
    pub async fn register(&self, ctx: &Context, source: PluginSource) -> EngineResult<()> {
        let plugin = source.resolve(&self.inner.engine)?;
        let name = plugin.name().to_string();
        if self.inner.plugins.read().iter().any(|p| p.name() == name) {
            return Err(EngineError::DuplicatePlugin(name));
        }

        match plugin.load(ctx, &self.inner.engine).await {
            Ok(()) => {
                info!(plugin = %name, kind = %plugin.kind(), version = %plugin.version(), "Plugin registered");
                self.inner.plugins.write().push(plugin);
            }
            Err(e) if plugin.kind() == PluginKind::Destination => {
                warn!(plugin = %name, error = %e, "Destination failed to load, skipping");
                self.inner.engine.record_failed_initialization(name);
                return Ok(());
            }
            Err(source) => return Err(EngineError::Load { plugin: name, source }),
        }

        if !self.is_empty() {
            self.inner.schedule_flush(Duration::ZERO);
        }
        Ok(())
    }

    /// Remove the plugin called `name` and await its `unload`.
    pub async fn deregister(&self, ctx: &Context, name: &str) -> EngineResult<()> {
        let plugin = {
            let mut plugins = self.inner.plugins.write();
            let index = plugins
                .iter()
                .position(|p| p.name() == name)
                .ok_or_else(|| EngineError::PluginNotFound(name.to_string()))?;
            plugins.remove(index)
        };

        if let Err(e) = plugin.unload(ctx, &self.inner.engine).await {
            warn!(plugin = %name, error = %e, "Plugin unload failed");
        }
        info!(plugin = %name, "Plugin deregistered");
        Ok(())
    }

    /// Queue `ctx` and resolve once it has been delivered or has failed.
    pub async fn dispatch(&self, mut ctx: Context) -> Context {
        ctx.stats_mut().increment("message_dispatched", 1.0, &[]);
        let fallback = ctx.clone();

        let rx = {
            let mut state = self.inner.state.lock();
            let rx = state.wait_for(ctx.id());
            if state.is_pending(ctx.id()) {
                debug!(context_id = %ctx.id(), "Context already pending");
            } else {
                match state.queue.push(ctx) {
                    PushResult::Accepted { evicted } => {
                        if let Some(evicted) = evicted {
                            self.inner.drop_evicted(&mut state, evicted);
                        }
                    }
                    PushResult::Rejected { mut item, reason } => {
                        item.set_failed_delivery(format!("not queued: {reason:?}"));
                        state.settle(&item);
                    }
                }
            }
            rx
        };

        self.inner.schedule_flush(Duration::ZERO);
        resolve(rx, fallback).await
    }

    /// Deliver `ctx` now, bypassing the queue for its first traversal.
    ///
    /// A retryable outcome still falls back to the retry queue.
    pub async fn dispatch_single(&self, mut ctx: Context) -> Context {
        ctx.stats_mut().increment("message_dispatched", 1.0, &[]);
        let fallback = ctx.clone();

        let (rx, run_now) = {
            let mut state = self.inner.state.lock();
            let rx = state.wait_for(ctx.id());
            if state.is_pending(ctx.id()) {
                (rx, false)
            } else {
                state.processing.insert(ctx.id().to_string());
                state.queue.update_attempts(ctx.id());
                (rx, true)
            }
        };

        if run_now {
            self.inner.clone().run(ctx).await;
        }
        resolve(rx, fallback).await
    }

    /// Traverse every context that is due now and return the ones that resolved.
    ///
    /// Returns nothing while offline.
    pub async fn flush(&self) -> Vec<Context> {
        if self.inner.engine.environment().is_offline() {
            return Vec::new();
        }
        let ready = self.inner.take_ready();
        join_all(ready.into_iter().map(|ctx| self.inner.clone().run(ctx)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

async fn resolve(rx: oneshot::Receiver<Context>, mut fallback: Context) -> Context {
    match rx.await {
        Ok(ctx) => ctx,
        Err(_) => {
            fallback.set_failed_delivery("dispatch abandoned");
            fallback
        }
    }
}

impl Inner {
    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    /// Before and enrichment plugins gate every traversal; destinations and
    /// after plugins that are not loaded are skipped on their own.
    fn is_ready(&self) -> bool {
        self.plugins
            .read()
            .iter()
            .filter(|p| matches!(p.kind(), PluginKind::Before | PluginKind::Enrichment))
            .all(|p| p.is_loaded())
    }

    fn schedule_flush(self: &Arc<Self>, delay: Duration) {
        let inner = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            inner.drain();
        });
    }

    /// Start a traversal task for every due context.
    fn drain(self: &Arc<Self>) {
        let env = self.engine.environment();
        if env.is_offline() {
            if !self.waiting_online.swap(true, Ordering::SeqCst) {
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.engine.environment().online().await;
                    inner.waiting_online.store(false, Ordering::SeqCst);
                    inner.drain();
                });
            }
            return;
        }

        for ctx in self.take_ready() {
            let inner = self.clone();
            tokio::spawn(async move {
                inner.run(ctx).await;
            });
        }
    }

    fn take_ready(&self) -> Vec<Context> {
        let mut state = self.state.lock();
        let mut ready = Vec::new();
        while let Some(ctx) = state.queue.pop() {
            state.processing.insert(ctx.id().to_string());
            ready.push(ctx);
        }
        ready
    }

    fn drop_evicted(&self, state: &mut DispatchState, mut evicted: Context) {
        evicted.set_failed_delivery("evicted: retry queue full");
        self.emit(QueueEvent::DeliveryFailure {
            context: evicted.clone(),
            reason: "evicted: retry queue full".to_string(),
        });
        state.settle(&evicted);
    }

    /// One traversal; returns the context if it resolved.
    async fn run(self: Arc<Self>, mut ctx: Context) -> Option<Context> {
        let attempts = self.state.lock().queue.get_attempts(ctx.id());
        ctx.set_attempts(attempts);

        match self.traverse(ctx).await {
            Traversal::Delivered(ctx) => {
                self.emit(QueueEvent::DeliverySuccess(ctx.clone()));
                self.finish(ctx, true)
            }
            Traversal::Failed(ctx) => {
                let reason = ctx
                    .failed_delivery()
                    .map(|f| f.reason.clone())
                    .unwrap_or_default();
                self.emit(QueueEvent::DeliveryFailure {
                    context: ctx.clone(),
                    reason,
                });
                self.finish(ctx, false)
            }
            Traversal::Retry(ctx, reason) => self.retry(ctx, reason),
        }
    }

    fn finish(&self, ctx: Context, delivered: bool) -> Option<Context> {
        self.state.lock().settle(&ctx);
        self.emit(QueueEvent::Flush {
            context_id: ctx.id().to_string(),
            delivered,
        });
        Some(ctx)
    }

    fn retry(self: &Arc<Self>, ctx: Context, reason: String) -> Option<Context> {
        let id = ctx.id().to_string();
        let attempts = ctx.attempts();

        let mut state = self.state.lock();
        state.processing.remove(&id);
        match state.queue.push_with_backoff(ctx, None) {
            PushResult::Accepted { evicted } => {
                if let Some(evicted) = evicted {
                    self.drop_evicted(&mut state, evicted);
                }
                let next = state.queue.next_ready_in();
                drop(state);

                debug!(context_id = %id, attempts, reason = %reason, "Context scheduled for retry");
                self.emit(QueueEvent::DeliveryRetry {
                    context_id: id,
                    attempts,
                });
                if let Some(delay) = next {
                    self.schedule_flush(delay);
                }
                None
            }
            PushResult::Rejected { mut item, .. } => {
                drop(state);
                warn!(context_id = %id, attempts, reason = %reason, "Retries exhausted");
                item.set_failed_delivery(reason.clone());
                self.emit(QueueEvent::DeliveryFailure {
                    context: item.clone(),
                    reason,
                });
                self.finish(item, false)
            }
        }
    }

    async fn traverse(&self, mut ctx: Context) -> Traversal {
        if !self.is_ready() {
            return Traversal::Retry(ctx, "plugins not ready".to_string());
        }
        let plugins = self.plugins.read().clone();
        let stage = |kind: PluginKind| plugins.iter().filter(move |p| p.kind() == kind);

        for plugin in stage(PluginKind::Before) {
            match delivery::ensure(ctx, plugin.as_ref()).await {
                Ok(next) => ctx = next,
                Err(StageFailure { ctx: failed, error }) if error.is_retryable() => {
                    return Traversal::Retry(failed, error.to_string());
                }
                Err(StageFailure { ctx: mut failed, error }) => {
                    failed.set_failed_delivery(error.to_string());
                    return Traversal::Failed(failed);
                }
            }
        }

        for plugin in stage(PluginKind::Enrichment) {
            match delivery::attempt(ctx, plugin.as_ref()).await {
                Ok(next) => ctx = next,
                Err(StageFailure { ctx: mut failed, error }) if error.is_middleware_cancellation() => {
                    failed.cancel(error.to_cancellation());
                    failed.set_failed_delivery(error.to_string());
                    return Traversal::Failed(failed);
                }
                Err(StageFailure { ctx: unchanged, error }) => {
                    debug!(context_id = %unchanged.id(), plugin = %plugin.name(), error = %error, "Enrichment failed");
                    ctx = unchanged;
                }
            }
        }
        self.emit(QueueEvent::MessageEnriched {
            context_id: ctx.id().to_string(),
        });

        let integrations = ctx.event().integrations.clone();
        let destinations: Vec<Arc<dyn Plugin>> = stage(PluginKind::Destination)
            .filter(|p| destination_enabled(p.as_ref(), integrations.as_ref()))
            .filter(|p| {
                let loaded = p.is_loaded();
                if !loaded {
                    debug!(context_id = %ctx.id(), destination = %p.name(), "Destination not loaded, skipping");
                }
                loaded
            })
            .cloned()
            .collect();

        let metrics_at_fork = ctx.stats().metrics().len();
        let logs_at_fork = ctx.logs().len();
        let deliveries = destinations.into_iter().map(|plugin| {
            let copy = ctx.clone();
            async move {
                let outcome = delivery::attempt(copy, plugin.as_ref()).await;
                (plugin.name().to_string(), outcome)
            }
        });
        let outcomes = join_all(deliveries).await;
        for (name, outcome) in outcomes {
            let copy = match outcome {
                Ok(copy) => {
                    self.emit(QueueEvent::MessageDelivered {
                        context_id: copy.id().to_string(),
                        destination: name.clone(),
                    });
                    copy
                }
                Err(StageFailure { ctx: copy, error }) => {
                    warn!(context_id = %copy.id(), destination = %name, error = %error, "Destination failed");
                    copy
                }
            };
            ctx.merge_branch(copy, metrics_at_fork, logs_at_fork);
        }

        for plugin in stage(PluginKind::After).filter(|p| p.is_loaded()) {
            match delivery::attempt(ctx, plugin.as_ref()).await {
                Ok(next) => ctx = next,
                Err(StageFailure { ctx: unchanged, error }) => {
                    debug!(context_id = %unchanged.id(), plugin = %plugin.name(), error = %error, "After plugin failed");
                    ctx = unchanged;
                }
            }
        }

        if ctx.failed_delivery().is_some() {
            Traversal::Failed(ctx)
        } else {
            Traversal::Delivered(ctx)
        }
    }
}

/// Whether `integrations` allows delivery to `plugin`.
///
/// An explicit entry for the plugin's name (or an alternative name) wins;
/// otherwise `All` decides. Only a literal `false` disables.
fn destination_enabled(plugin: &dyn Plugin, integrations: Option<&Map<String, Value>>) -> bool {
    let Some(integrations) = integrations else {
        return true;
    };
    let explicit = integrations.get(plugin.name()).or_else(|| {
        plugin
            .alternative_names()
            .iter()
            .find_map(|name| integrations.get(name))
    });
    let setting = match explicit {
        Some(value) => Some(value),
        None if plugin.is_first_party() => None,
        None => integrations.get("All"),
    };
    !matches!(setting, Some(Value::Bool(false)))
}
