//! Configuration, paths, and logging setup for the Beacon CLI.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, DeliveryStrategy, DEFAULT_API_HOST, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging};
pub use paths::Paths;
