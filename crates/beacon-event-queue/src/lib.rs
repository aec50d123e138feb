//! Staged plugin dispatcher.
//!
//! This crate provides:
//! - Plugin: the stage contract (before, enrichment, destination, after)
//! - PluginSource: validated plugin or factory accepted at registration
//! - EngineHandle: explicit engine state handed to plugins on load
//! - EventQueue: runs contexts through the pipeline and folds every outcome
//!   into the returned Context
//! - delivery: per-plugin `attempt`/`ensure`, plus `invoke` for direct calls

pub mod delivery;
mod engine;
mod error;
mod events;
mod plugin;
mod queue;

#[cfg(test)]
mod tests;

pub use engine::EngineHandle;
pub use error::{EngineError, EngineResult, PluginError};
pub use events::QueueEvent;
pub use plugin::{HookResult, Plugin, PluginFactory, PluginKind, PluginSource};
pub use queue::{EventQueue, EventQueueConfig};
