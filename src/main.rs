//! Executable entry point for the fogwillow daemon.
//!
//! Loads configuration, initializes logging, starts the daemon, and waits
//! for SIGINT or SIGTERM before running the ordered shutdown. Configuration
//! or bind failures exit non-zero before any task starts.

use anyhow::{Context, Result};
use clap::Parser;
use fogwillow::{app::Fog, config::Config};
use log::{info, LevelFilter};
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "fogwillow")]
#[command(about = "UDP log coalescing daemon", long_about = None)]
struct Cli {
    /// Config file path.
    #[arg(long, default_value = "/config/fog.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    let default_level = if config.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        default_level.to_string(),
    ))
    .init();

    config.log_summary();

    let mut fog = Fog::new(config);
    fog.start().await.context("starting fogwillow")?;

    wait_for_signal().await?;

    info!("shutting down: caught signal");
    fog.shutdown().await;

    Ok(())
}

/// Block until SIGINT or SIGTERM arrives.
async fn wait_for_signal() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
        _ = terminate.recv() => {}
    }

    Ok(())
}
