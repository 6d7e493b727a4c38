//! Ridgecast Tower - the streaming half of the radio engine.
//!
//! Ingests PCM from the station, paces emission on a fixed-rate clock,
//! encodes through a supervised ffmpeg child, and fans the MP3 program
//! out to HTTP listeners. Runs headless as a background daemon.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ridgecast_core::TowerRuntime;
use tokio::signal;

use crate::config::ServerConfig;

/// Ridgecast Tower - PCM ingest, MP3 encode, HTTP fan-out.
#[derive(Parser, Debug)]
#[command(name = "ridgecast-tower")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "RIDGECAST_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Ridgecast Tower v{}", env!("CARGO_PKG_VERSION"));

    // Startup failures (bad config, occupied port) exit 1; after this
    // point the audio contract forbids exiting on faults
    let config = ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let runtime = TowerRuntime::start(config.to_core_config())
        .await
        .context("Failed to start tower")?;

    shutdown_signal().await;
    log::info!("Shutdown signal received, draining...");

    runtime.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
