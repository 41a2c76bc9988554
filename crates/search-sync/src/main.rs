//! Search Sync CLI
//!
//! Commands:
//! - `run`: bootstrap the index and consume change notifications
//! - `config`: print the effective configuration and exit

use anyhow::Context;
use clap::{Parser, Subcommand};
use search_sync::SyncEngine;
use search_sync_core::SyncConfig;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "search-sync")]
#[command(about = "Keeps a search index in sync with the upstream item service")]
#[command(version)]
struct Args {
    /// Configuration file (toml, yaml or json)
    #[arg(short, long, env = "SEARCH_SYNC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, env = "LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Override the configured log format (json or pretty)
    #[arg(long, env = "LOG_FORMAT", global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the synchronizer (default)
    Run,
    /// Print the effective configuration as JSON
    Config,
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = args.config.as_ref().map(|p| p.to_string_lossy().into_owned());
    let mut config = SyncConfig::load(path.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }
    if let Some(format) = args.log_format {
        config.observability.log_format = format;
    }

    if let Some(Command::Config) = args.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_tracing(&config.observability.log_level, &config.observability.log_format);
    config.validate().context("Invalid configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        upstream = %config.upstream.base_url,
        index = ?config.index.backend,
        bootstrap = ?config.bootstrap.mode,
        "Starting search-sync"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            cancel.cancel();
        });
    }

    let engine = SyncEngine::from_config(&config).await?;

    if let Err(e) = engine.run(cancel).await {
        error!(error = %e, "search-sync failed");
        return Err(e.into());
    }

    info!("search-sync stopped");
    Ok(())
}
