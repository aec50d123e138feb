//! Running a single plugin against a context.

use crate::plugin::call_hook;
use crate::{HookResult, Plugin, PluginError};
use beacon_context::{Context, LogLevel};
use futures_util::FutureExt;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

/// A plugin rejected the context.
///
/// `ctx` is the context as it was before the failing hook ran.
#[derive(Debug)]
pub struct StageFailure {
    pub ctx: Context,
    pub error: PluginError,
}

/// Call the plugin hook for `ctx`'s verb and return its result unchanged.
///
/// Unlike [`attempt`], failures propagate to the caller.
pub async fn invoke(plugin: &dyn Plugin, ctx: Context) -> HookResult {
    call_hook(plugin, ctx).await
}

/// Run one plugin against `ctx`, containing errors and panics.
///
/// Records `plugin_time` (ms) and, on failure, `plugin_error`, both tagged
/// `plugin:<name>`.
pub async fn attempt(mut ctx: Context, plugin: &dyn Plugin) -> Result<Context, StageFailure> {
    let tags = [format!("plugin:{}", plugin.name())];
    let start = Instant::now();

    let result = AssertUnwindSafe(call_hook(plugin, ctx.clone()))
        .catch_unwind()
        .await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let error = match result {
        Ok(Ok(mut next)) => {
            next.stats_mut().gauge("plugin_time", elapsed_ms, &tags);
            return Ok(next);
        }
        Ok(Err(error)) => error,
        Err(panic) => PluginError::failed(panic_message(panic.as_ref())),
    };

    ctx.stats_mut().gauge("plugin_time", elapsed_ms, &tags);
    ctx.stats_mut().increment("plugin_error", 1.0, &tags);
    ctx.log(
        LogLevel::Error,
        "plugin Error",
        Some(json!({ "plugin": plugin.name(), "error": error.to_string() })),
    );
    Err(StageFailure { ctx, error })
}

/// [`attempt`] for stages whose failure stops the pipeline.
///
/// Terminal failures also cancel the context; retryable cancellations leave
/// it untouched so it can be queued again.
pub async fn ensure(ctx: Context, plugin: &dyn Plugin) -> Result<Context, StageFailure> {
    let mut failure = match attempt(ctx, plugin).await {
        Ok(ctx) => return Ok(ctx),
        Err(failure) => failure,
    };

    failure.ctx.stats_mut().increment("context_canceled", 1.0, &[]);
    if !failure.error.is_retryable() {
        failure.ctx.cancel(failure.error.to_cancellation());
    }
    failure.ctx.log(
        LogLevel::Debug,
        "Context canceled",
        Some(json!({ "plugin": plugin.name(), "retry": failure.error.is_retryable() })),
    );
    Err(failure)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::harness::{Behavior, TestPlugin};
    use crate::PluginKind;
    use beacon_context::{Cancellation, Event};
    use serde_json::Value;

    fn ctx() -> Context {
        Context::new(Event::track("Clicked"))
    }

    #[tokio::test]
    async fn attempt_records_time_on_success() {
        let plugin = TestPlugin::new("enricher", PluginKind::Enrichment)
            .with_behavior(Behavior::SetProperty("seen", Value::Bool(true)));

        let out = attempt(ctx(), &plugin).await.unwrap();
        assert_eq!(out.event().properties.as_ref().unwrap()["seen"], true);
        assert_eq!(out.stats().gauges("plugin_time", Some("plugin:enricher")).len(), 1);
        assert_eq!(out.stats().counter("plugin_error", None), 0.0);
    }

    #[tokio::test]
    async fn attempt_contains_failures_and_keeps_original_context() {
        let plugin = TestPlugin::new("broken", PluginKind::Destination)
            .with_behavior(Behavior::SetPropertyThenFail("seen"));

        let failure = attempt(ctx(), &plugin).await.unwrap_err();
        assert!(failure.ctx.event().properties.as_ref().unwrap().get("seen").is_none());
        assert_eq!(failure.ctx.stats().counter("plugin_error", Some("plugin:broken")), 1.0);
        assert!(!failure.ctx.is_cancelled());
    }

    #[tokio::test]
    async fn attempt_contains_panics() {
        let plugin = TestPlugin::new("panicky", PluginKind::After).with_behavior(Behavior::Panic);

        let failure = attempt(ctx(), &plugin).await.unwrap_err();
        assert!(matches!(failure.error, PluginError::Failed(ref m) if m.contains("panicked")));
    }

    #[tokio::test]
    async fn ensure_cancels_on_terminal_failure_only() {
        let terminal = TestPlugin::new("gate", PluginKind::Before)
            .with_behavior(Behavior::Cancel(Cancellation::terminal("dropped by policy")));
        let failure = ensure(ctx(), &terminal).await.unwrap_err();
        assert!(failure.ctx.is_cancelled());
        assert_eq!(failure.ctx.stats().counter("context_canceled", None), 1.0);

        let retryable = TestPlugin::new("gate", PluginKind::Before)
            .with_behavior(Behavior::Cancel(Cancellation::retryable("busy")));
        let failure = ensure(ctx(), &retryable).await.unwrap_err();
        assert!(!failure.ctx.is_cancelled());
        assert!(failure.error.is_retryable());
    }

    #[tokio::test]
    async fn invoke_propagates_hook_errors() {
        let plugin = TestPlugin::new("broken", PluginKind::Destination).with_behavior(Behavior::Fail);
        assert!(matches!(invoke(&plugin, ctx()).await, Err(PluginError::Failed(_))));
    }

    #[tokio::test]
    async fn missing_hook_passes_through() {
        // TestPlugin only overrides `track`; identify falls back to the default hook.
        let plugin = TestPlugin::new("broken", PluginKind::Destination).with_behavior(Behavior::Fail);
        let identify = Context::new(Event::identify("user-1"));
        let out = invoke(&plugin, identify.clone()).await.unwrap();
        assert!(out.is_same(&identify));
        assert_eq!(plugin.calls(), 0);
    }
}
