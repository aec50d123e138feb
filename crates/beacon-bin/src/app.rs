//! Engine assembly for the `send` command.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use beacon_batch_dispatcher::BatchConfig;
use beacon_collector::{connect, CollectorConfig, CollectorDestination, DeliveryMode};
use beacon_config_and_utils::{Config, DeliveryStrategy, Paths};
use beacon_context::{Context, Environment, Event};
use beacon_event_queue::{EngineHandle, EventQueue, EventQueueConfig, PluginSource, QueueEvent};
use beacon_retry_queue::{DurableStore, FileStore};
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Per-request timeout outside of exit.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Dispatches allowed in flight at once.
const DISPATCH_CONCURRENCY: usize = 16;
const DRAIN_POLL: Duration = Duration::from_millis(250);

/// Outcome of one `send` run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SendSummary {
    pub read: usize,
    pub dispatched: usize,
    pub failed: usize,
    /// Left in the collector's retry queue.
    pub queued: usize,
    pub interrupted: bool,
}

impl SendSummary {
    fn record(&mut self, ctx: &Context) {
        self.dispatched += 1;
        if let Some(failure) = ctx.failed_delivery() {
            self.failed += 1;
            warn!(context_id = %ctx.id(), reason = %failure.reason, "Event not delivered");
        }
    }
}

impl fmt::Display for SendSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} read, {} dispatched, {} failed, {} queued for retry",
            self.read, self.dispatched, self.failed, self.queued
        )?;
        if self.interrupted {
            f.write_str(" (interrupted)")?;
        }
        Ok(())
    }
}

pub fn delivery_mode(strategy: &DeliveryStrategy) -> DeliveryMode {
    match strategy {
        DeliveryStrategy::Standard => DeliveryMode::Standard,
        DeliveryStrategy::Batching {
            size,
            timeout_ms,
            max_payload_bytes,
            keepalive_chunk_bytes,
            retry_attempts,
        } => DeliveryMode::Batching(BatchConfig {
            size: *size,
            timeout: Duration::from_millis(*timeout_ms),
            max_payload_bytes: *max_payload_bytes,
            keepalive_chunk_bytes: *keepalive_chunk_bytes,
            retry_attempts: *retry_attempts,
            ..BatchConfig::default()
        }),
    }
}

pub fn collector_config(config: &Config) -> CollectorConfig {
    CollectorConfig {
        write_key: config.write_key.clone(),
        api_host: config.api_host.clone(),
        max_attempts: config.max_attempts,
        max_queue_size: config.retry_queue_max_size,
        ..CollectorConfig::default()
    }
}

pub fn event_queue_config(config: &Config) -> EventQueueConfig {
    EventQueueConfig {
        max_attempts: config.max_attempts,
        max_size: config.retry_queue_max_size,
        ..EventQueueConfig::default()
    }
}

/// Deliver `events` and wait up to `drain_timeout` for retries to settle.
///
/// Ctrl-C raises the exit signal: dispatching stops, batched events are
/// drained in keepalive chunks, and in-flight events return to the queue.
pub async fn send(
    config: &Config,
    paths: &Paths,
    events: Vec<Context>,
    drain_timeout: Duration,
) -> anyhow::Result<SendSummary> {
    let environment = Environment::new();
    let engine = EngineHandle::new(config.write_key.clone(), environment.clone());
    let queue = EventQueue::new(engine, event_queue_config(config));
    spawn_event_logger(queue.subscribe());

    let dispatcher = connect(
        &config.api_host,
        delivery_mode(&config.delivery_strategy),
        REQUEST_TIMEOUT,
        &environment,
    )?;

    let collector_config = collector_config(config);
    let destination = if config.persist_queue {
        paths.ensure_dirs()?;
        let store: Arc<dyn DurableStore> = Arc::new(
            FileStore::open(paths.queue_dir()).context("failed to open the queue directory")?,
        );
        CollectorDestination::persisted(
            collector_config,
            dispatcher.clone(),
            environment.clone(),
            store,
        )?
    } else {
        CollectorDestination::new(collector_config, dispatcher.clone(), environment.clone())?
    };

    let setup = Context::new(Event::track("beacon-cli-load"));
    queue
        .register(&setup, PluginSource::plugin(destination.clone()))
        .await?;
    info!(
        events = events.len(),
        resumed = destination.pending(),
        persisted = config.persist_queue,
        "Sending events"
    );

    let exit = environment.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, flushing before exit");
            exit.signal_exit();
        }
    });

    let mut summary = SendSummary {
        read: events.len(),
        ..SendSummary::default()
    };

    let mut results = stream::iter(events)
        .map(|ctx| queue.dispatch(ctx))
        .buffered(DISPATCH_CONCURRENCY);
    loop {
        tokio::select! {
            biased;
            _ = environment.exited() => {
                summary.interrupted = true;
                break;
            }
            next = results.next() => match next {
                Some(ctx) => summary.record(&ctx),
                None => break,
            },
        }
    }
    drop(results);

    if !summary.interrupted {
        tokio::select! {
            _ = wait_for_retries(&destination) => {}
            _ = environment.exited() => summary.interrupted = true,
            _ = tokio::time::sleep(drain_timeout) => {
                warn!(pending = destination.pending(), "Drain timeout reached");
            }
        }
    }

    destination.suspend();
    dispatcher.close().await;
    summary.queued = destination.pending();

    if let Err(e) = queue.deregister(&setup, &destination.config().name).await {
        debug!(error = %e, "Deregistering collector failed");
    }
    info!(
        dispatched = summary.dispatched,
        failed = summary.failed,
        queued = summary.queued,
        "Send finished"
    );
    Ok(summary)
}

async fn wait_for_retries(destination: &CollectorDestination) {
    while destination.pending() > 0 || destination.in_flight() > 0 {
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

fn spawn_event_logger(mut events: broadcast::Receiver<QueueEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::DeliveryRetry {
                    context_id,
                    attempts,
                }) => debug!(context_id = %context_id, attempts, "Retrying delivery"),
                Ok(QueueEvent::DeliveryFailure { context, reason }) => {
                    debug!(context_id = %context.id(), reason = %reason, "Delivery failed")
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Lifecycle log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_strategy_maps_to_standard_mode() {
        assert!(matches!(
            delivery_mode(&DeliveryStrategy::Standard),
            DeliveryMode::Standard
        ));
    }

    #[test]
    fn batching_strategy_carries_its_knobs() {
        let strategy = DeliveryStrategy::Batching {
            size: 25,
            timeout_ms: 1500,
            max_payload_bytes: 100_000,
            keepalive_chunk_bytes: 32_000,
            retry_attempts: 3,
        };

        let DeliveryMode::Batching(batch) = delivery_mode(&strategy) else {
            panic!("expected batching mode");
        };
        assert_eq!(batch.size, 25);
        assert_eq!(batch.timeout, Duration::from_millis(1500));
        assert_eq!(batch.max_payload_bytes, 100_000);
        assert_eq!(batch.keepalive_chunk_bytes, 32_000);
        assert_eq!(batch.retry_attempts, 3);
        assert_eq!(
            batch.flush_margin_bytes,
            BatchConfig::default().flush_margin_bytes
        );
    }

    #[test]
    fn collector_config_follows_cli_config() {
        let config = Config {
            write_key: "wk".into(),
            api_host: "https://collect.example.com/v1".into(),
            max_attempts: 4,
            retry_queue_max_size: 50,
            ..Config::default()
        };

        let collector = collector_config(&config);
        assert_eq!(collector.write_key, "wk");
        assert_eq!(collector.api_host, "https://collect.example.com/v1");
        assert_eq!(collector.max_attempts, 4);
        assert_eq!(collector.max_queue_size, 50);
        assert_eq!(collector.name, "Beacon.io");

        let queue = event_queue_config(&config);
        assert_eq!(queue.max_attempts, 4);
        assert_eq!(queue.max_size, 50);
    }

    #[test]
    fn summary_display() {
        let summary = SendSummary {
            read: 3,
            dispatched: 3,
            failed: 1,
            queued: 1,
            interrupted: true,
        };
        assert_eq!(
            summary.to_string(),
            "3 read, 3 dispatched, 1 failed, 1 queued for retry (interrupted)"
        );
    }

    #[tokio::test]
    async fn send_with_nothing_to_do() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        let config = Config {
            persist_queue: true,
            ..Config::default()
        };

        let summary = send(&config, &paths, Vec::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(summary, SendSummary::default());
        assert!(paths.queue_dir().is_dir());
    }
}
