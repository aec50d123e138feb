//! Beacon - replay analytics events through the delivery engine.

mod app;
mod input;

use std::path::PathBuf;
use std::time::Duration;

use beacon_config_and_utils::{init_logging, Config, DeliveryStrategy, Paths};
use clap::{Parser, Subcommand};
use tracing::debug;

/// Beacon command-line interface.
#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Send analytics events to a collection API with retries and batching")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, queue, and logs. Defaults to ~/.beacon
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Deliver newline-delimited JSON events
    Send {
        /// File with one event per line
        #[arg(short, long)]
        file: PathBuf,

        /// Coalesce events into batch requests
        #[arg(long)]
        batch: bool,

        /// Keep undelivered events on disk for the next run
        #[arg(long)]
        persist: bool,

        /// Write key, overriding the configured one
        #[arg(long, env = "BEACON_WRITE_KEY")]
        write_key: Option<String>,

        /// Seconds to wait for queued retries before exiting
        #[arg(long, default_value_t = 30)]
        drain_timeout: u64,
    },
    /// Show or initialize configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write a config file with default values
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let mut config = Config::load(&paths)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    let log_path = init_logging(&config.log_level)?;
    debug!(
        log_path = %log_path.display(),
        level = %config.log_level,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Send {
            file,
            batch,
            persist,
            write_key,
            drain_timeout,
        } => {
            if let Some(write_key) = write_key {
                config.write_key = write_key;
            }
            if batch && !matches!(config.delivery_strategy, DeliveryStrategy::Batching { .. }) {
                config.delivery_strategy = DeliveryStrategy::batching();
            }
            config.persist_queue |= persist;
            config.validate()?;

            let events = input::read_events(&file)?;
            let summary = app::send(
                &config,
                &paths,
                events,
                Duration::from_secs(drain_timeout),
            )
            .await?;
            println!("{summary}");
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigCommands::Init => {
                Config::default().save(&paths)?;
                println!("Wrote {}", paths.config_file().display());
            }
        },
    }

    Ok(())
}
