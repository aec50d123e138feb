//! Stage ordering, error containment, fan-out and metrics.

use super::harness::*;
use crate::{PluginKind, QueueEvent};
use beacon_context::{Cancellation, Context, Event};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

fn plugin(name: &str, kind: PluginKind, log: &CallLog) -> TestPlugin {
    TestPlugin::new(name, kind).with_log(log)
}

#[tokio::test]
async fn stages_run_in_order() {
    let log = new_log();
    let queue = queue(3);
    register_all(
        &queue,
        &[
            Arc::new(plugin("after", PluginKind::After, &log)),
            Arc::new(plugin("destination", PluginKind::Destination, &log)),
            Arc::new(plugin("enrichment", PluginKind::Enrichment, &log)),
            Arc::new(plugin("before", PluginKind::Before, &log)),
        ],
    )
    .await;

    let ctx = queue.dispatch(track("Signed Up")).await;

    assert!(ctx.failed_delivery().is_none());
    assert_eq!(ctx.attempts(), 1);
    assert_eq!(logged(&log), vec!["before", "enrichment", "destination", "after"]);
}

#[tokio::test]
async fn dispatch_without_plugins_still_resolves() {
    let queue = queue(3);
    let ctx = track("Nothing Registered");
    let out = queue.dispatch(ctx.clone()).await;
    assert!(out.is_same(&ctx));
    assert!(out.failed_delivery().is_none());
    assert_eq!(out.stats().counter("message_dispatched", None), 1.0);
}

#[tokio::test]
async fn failing_before_plugin_halts_pipeline() {
    let queue = queue(3);
    let before = Arc::new(TestPlugin::new("gate", PluginKind::Before).with_behavior(Behavior::Fail));
    let dest = Arc::new(TestPlugin::new("dest", PluginKind::Destination));
    let after = Arc::new(TestPlugin::new("after", PluginKind::After));
    register_all(&queue, &[before.clone(), dest.clone(), after.clone()]).await;

    let ctx = queue.dispatch(track("Blocked")).await;

    assert!(ctx.failed_delivery().is_some());
    assert!(ctx.is_cancelled());
    assert_eq!(before.calls(), 1);
    assert_eq!(dest.calls(), 0);
    assert_eq!(after.calls(), 0);
}

#[tokio::test]
async fn terminal_cancellation_in_before_is_not_retried() {
    let queue = queue(5);
    let before = Arc::new(
        TestPlugin::new("policy", PluginKind::Before)
            .with_behavior(Behavior::Cancel(Cancellation::terminal("dropped by policy"))),
    );
    let dest = Arc::new(TestPlugin::new("dest", PluginKind::Destination));
    register_all(&queue, &[before.clone(), dest.clone()]).await;

    let ctx = queue.dispatch(track("Dropped")).await;

    assert_eq!(ctx.cancellation().unwrap().kind, "dropped by policy");
    assert_eq!(ctx.attempts(), 1);
    assert_eq!(before.calls(), 1);
    assert_eq!(dest.calls(), 0);
}

#[tokio::test]
async fn failing_destination_does_not_affect_siblings() {
    let queue = queue(3);
    let healthy: Vec<Arc<TestPlugin>> = (0..4)
        .map(|i| Arc::new(TestPlugin::new(&format!("dest-{i}"), PluginKind::Destination)))
        .collect();
    let broken = Arc::new(TestPlugin::new("broken", PluginKind::Destination).with_behavior(Behavior::Fail));
    let panicky = Arc::new(TestPlugin::new("panicky", PluginKind::Destination).with_behavior(Behavior::Panic));

    let mut all = healthy.clone();
    all.push(broken.clone());
    all.push(panicky.clone());
    register_all(&queue, &all).await;

    let ctx = queue.dispatch(track("Fan Out")).await;

    assert!(ctx.failed_delivery().is_none());
    assert!(!ctx.is_cancelled());
    for dest in &healthy {
        assert_eq!(dest.calls(), 1);
    }
    assert_eq!(broken.calls(), 1);
    assert_eq!(ctx.stats().counter("plugin_error", Some("plugin:broken")), 1.0);
    assert_eq!(ctx.stats().counter("plugin_error", Some("plugin:panicky")), 1.0);
    assert_eq!(ctx.stats().counter("plugin_error", Some("plugin:dest-0")), 0.0);
}

#[tokio::test]
async fn failing_enrichment_is_isolated_and_its_changes_discarded() {
    let queue = queue(3);
    let enrich_ok = Arc::new(
        TestPlugin::new("enrich-ok", PluginKind::Enrichment)
            .with_behavior(Behavior::SetProperty("plan", json!("pro"))),
    );
    let enrich_bad = Arc::new(
        TestPlugin::new("enrich-bad", PluginKind::Enrichment)
            .with_behavior(Behavior::SetPropertyThenFail("poisoned")),
    );
    let dest = Arc::new(TestPlugin::new("dest", PluginKind::Destination));
    register_all(&queue, &[enrich_ok.clone(), enrich_bad.clone(), dest.clone()]).await;

    let ctx = queue.dispatch(track("Enriched")).await;

    assert!(ctx.failed_delivery().is_none());
    assert_eq!(dest.calls(), 1);
    let props = ctx.event().properties.as_ref().unwrap();
    assert_eq!(props["plan"], "pro");
    assert!(props.get("poisoned").is_none());
}

#[tokio::test]
async fn middleware_cancellation_in_enrichment_halts() {
    let queue = queue(3);
    let middleware = Arc::new(
        TestPlugin::new("middleware", PluginKind::Enrichment)
            .with_behavior(Behavior::Cancel(Cancellation::middleware("next() not called"))),
    );
    let dest = Arc::new(TestPlugin::new("dest", PluginKind::Destination));
    register_all(&queue, &[middleware.clone(), dest.clone()]).await;

    let ctx = queue.dispatch(track("Filtered")).await;

    assert!(ctx.failed_delivery().is_some());
    assert!(ctx.cancellation().unwrap().is_middleware());
    assert_eq!(dest.calls(), 0);
}

#[tokio::test]
async fn plugin_metrics_are_recorded_per_plugin() {
    let queue = queue(3);
    let before = Arc::new(TestPlugin::new("before", PluginKind::Before));
    let dest_a = Arc::new(TestPlugin::new("a", PluginKind::Destination));
    let dest_b = Arc::new(TestPlugin::new("b", PluginKind::Destination).with_behavior(Behavior::Fail));
    register_all(&queue, &[before, dest_a, dest_b]).await;

    let ctx = queue.dispatch(track("Measured")).await;

    assert_eq!(ctx.stats().gauges("plugin_time", Some("plugin:before")).len(), 1);
    assert_eq!(ctx.stats().gauges("plugin_time", Some("plugin:a")).len(), 1);
    assert_eq!(ctx.stats().gauges("plugin_time", Some("plugin:b")).len(), 1);
    assert_eq!(ctx.stats().counter("plugin_error", None), 1.0);
}

#[tokio::test]
async fn disabled_integrations_skip_destinations_only() {
    let queue = queue(3);
    let before = Arc::new(TestPlugin::new("before", PluginKind::Before));
    let mixpanel = Arc::new(TestPlugin::new("Mixpanel", PluginKind::Destination));
    let amplitude = Arc::new(TestPlugin::new("Amplitude", PluginKind::Destination));
    register_all(&queue, &[before.clone(), mixpanel.clone(), amplitude.clone()]).await;

    let mut integrations = Map::new();
    integrations.insert("All".into(), Value::Bool(false));
    integrations.insert("Mixpanel".into(), Value::Bool(true));
    let ctx = Context::new(Event::track("Scoped").with_integrations(integrations));

    let out = queue.dispatch(ctx).await;

    assert!(out.failed_delivery().is_none());
    assert_eq!(before.calls(), 1);
    assert_eq!(mixpanel.calls(), 1);
    assert_eq!(amplitude.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn contexts_dispatch_concurrently() {
    let queue = queue(3);
    let slow = Arc::new(
        TestPlugin::new("slow", PluginKind::Destination)
            .with_behavior(Behavior::Sleep(Duration::from_secs(5))),
    );
    register_all(&queue, &[slow.clone()]).await;

    let start = tokio::time::Instant::now();
    let (a, b) = tokio::join!(queue.dispatch(track("A")), queue.dispatch(track("B")));

    assert!(a.failed_delivery().is_none());
    assert!(b.failed_delivery().is_none());
    assert_eq!(slow.calls(), 2);
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn concurrent_dispatch_of_same_context_delivers_once() {
    let queue = queue(3);
    let dest = Arc::new(TestPlugin::new("dest", PluginKind::Destination));
    register_all(&queue, &[dest.clone()]).await;

    let ctx = track("Deduplicated");
    let (a, b) = tokio::join!(queue.dispatch(ctx.clone()), queue.dispatch(ctx.clone()));

    assert!(a.is_same(&ctx) && b.is_same(&ctx));
    assert_eq!(dest.calls(), 1);
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let queue = queue(3);
    register_all(&queue, &[Arc::new(TestPlugin::new("dest", PluginKind::Destination))]).await;
    let mut events = queue.subscribe();

    let ctx = queue.dispatch(track("Observed")).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(&seen[0], QueueEvent::MessageEnriched { context_id } if context_id == ctx.id()));
    assert!(matches!(&seen[1], QueueEvent::MessageDelivered { destination, .. } if destination == "dest"));
    assert!(matches!(&seen[2], QueueEvent::DeliverySuccess(c) if c.is_same(&ctx)));
    assert!(matches!(&seen[3], QueueEvent::Flush { delivered: true, .. }));
}

#[tokio::test]
async fn unhandled_verbs_pass_through() {
    let queue = queue(3);
    let dest = Arc::new(TestPlugin::new("dest", PluginKind::Destination).with_behavior(Behavior::Fail));
    register_all(&queue, &[dest.clone()]).await;

    let ctx = queue.dispatch(Context::new(Event::identify("user-1"))).await;

    assert!(ctx.failed_delivery().is_none());
    assert_eq!(dest.calls(), 0);
    assert_eq!(ctx.stats().counter("plugin_error", None), 0.0);
}

#[tokio::test]
async fn destination_failure_reaches_the_dispatched_context() {
    let queue = queue(3);
    let rejecting = Arc::new(
        TestPlugin::new("rejecting", PluginKind::Destination)
            .with_behavior(Behavior::ReportFailure("rejected with status 400")),
    );
    let healthy = Arc::new(TestPlugin::new("healthy", PluginKind::Destination));
    register_all(&queue, &[rejecting.clone(), healthy.clone()]).await;
    let mut events = queue.subscribe();

    let ctx = queue.dispatch(track("Refused")).await;

    assert_eq!(ctx.failed_delivery().unwrap().reason, "rejected with status 400");
    assert!(ctx.logs().iter().any(|l| l.message == "delivery failed"));
    assert_eq!(ctx.stats().gauges("plugin_time", Some("plugin:rejecting")).len(), 1);
    assert_eq!(healthy.calls(), 1);

    let mut failure = None;
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::DeliveryFailure { reason, .. } = event {
            failure = Some(reason);
        }
    }
    assert_eq!(failure.as_deref(), Some("rejected with status 400"));
}
