//! Plugin contract and registration sources.

use crate::{EngineError, EngineHandle, EngineResult, PluginError};
use async_trait::async_trait;
use beacon_context::{Context, EventType};
use std::fmt;
use std::sync::Arc;

/// Pipeline stage a plugin belongs to. Stages run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    Before,
    Enrichment,
    Destination,
    After,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Before => "before",
            PluginKind::Enrichment => "enrichment",
            PluginKind::Destination => "destination",
            PluginKind::After => "after",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a verb hook: the (possibly modified) context, or a failure.
pub type HookResult = Result<Context, PluginError>;

/// A pipeline stage supplied by the host application.
///
/// Every verb hook defaults to passing the context through unchanged, so a
/// plugin only implements the verbs it cares about.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> PluginKind;

    fn version(&self) -> &str;

    /// Extra names matched against `integrations` settings.
    fn alternative_names(&self) -> &[String] {
        &[]
    }

    /// First-party destinations are disabled only by name, never by `All: false`.
    fn is_first_party(&self) -> bool {
        false
    }

    fn is_loaded(&self) -> bool;

    async fn load(&self, ctx: &Context, engine: &EngineHandle) -> Result<(), PluginError>;

    async fn unload(&self, _ctx: &Context, _engine: &EngineHandle) -> Result<(), PluginError> {
        Ok(())
    }

    async fn track(&self, ctx: Context) -> HookResult {
        Ok(ctx)
    }

    async fn identify(&self, ctx: Context) -> HookResult {
        Ok(ctx)
    }

    async fn page(&self, ctx: Context) -> HookResult {
        Ok(ctx)
    }

    async fn group(&self, ctx: Context) -> HookResult {
        Ok(ctx)
    }

    async fn alias(&self, ctx: Context) -> HookResult {
        Ok(ctx)
    }

    async fn screen(&self, ctx: Context) -> HookResult {
        Ok(ctx)
    }
}

/// Builds a plugin from the engine handle at registration time.
pub type PluginFactory =
    Arc<dyn Fn(&EngineHandle) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync>;

/// What a caller may hand to [`EventQueue::register`](crate::EventQueue::register).
#[derive(Clone)]
pub enum PluginSource {
    Plugin(Arc<dyn Plugin>),
    Factory(PluginFactory),
}

impl PluginSource {
    pub fn plugin(plugin: impl Plugin + 'static) -> Self {
        PluginSource::Plugin(Arc::new(plugin))
    }

    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn(&EngineHandle) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        PluginSource::Factory(Arc::new(factory))
    }

    /// Produce the plugin and check it against the required contract.
    pub fn resolve(&self, engine: &EngineHandle) -> EngineResult<Arc<dyn Plugin>> {
        let plugin = match self {
            PluginSource::Plugin(plugin) => plugin.clone(),
            PluginSource::Factory(factory) => factory(engine)
                .map_err(|e| EngineError::InvalidPlugin(format!("factory failed: {e}")))?,
        };
        validate(plugin.as_ref())?;
        Ok(plugin)
    }
}

impl fmt::Debug for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginSource::Plugin(p) => f.debug_tuple("Plugin").field(&p.name()).finish(),
            PluginSource::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

fn validate(plugin: &dyn Plugin) -> EngineResult<()> {
    if plugin.name().trim().is_empty() {
        return Err(EngineError::InvalidPlugin("missing name".to_string()));
    }
    if plugin.version().trim().is_empty() {
        return Err(EngineError::InvalidPlugin(format!(
            "{}: missing version",
            plugin.name()
        )));
    }
    Ok(())
}

/// Route `ctx` to the hook matching its verb.
pub(crate) async fn call_hook(plugin: &dyn Plugin, ctx: Context) -> HookResult {
    match ctx.event().event_type {
        EventType::Track => plugin.track(ctx).await,
        EventType::Identify => plugin.identify(ctx).await,
        EventType::Page => plugin.page(ctx).await,
        EventType::Group => plugin.group(ctx).await,
        EventType::Alias => plugin.alias(ctx).await,
        EventType::Screen => plugin.screen(ctx).await,
    }
}
