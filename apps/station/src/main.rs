//! Ridgecast Station - the playout half of the radio engine.
//!
//! Decodes MP3 segments into a continuous, real-time paced PCM stream,
//! feeds the tower, and announces segment lifecycle on the control
//! plane. This binary supplies only a thin content layer (directory
//! rotation and play history); the real selection intelligence is an
//! upstream concern.

mod config;
mod playlist;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use ridgecast_core::StationRuntime;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::playlist::{run_feeder, PlayLog, Playlist};

/// Ridgecast Station - segment playout and PCM feed.
#[derive(Parser, Debug)]
#[command(name = "ridgecast-station")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory of MP3 files to rotate through (overrides config).
    #[arg(value_name = "MUSIC_DIR")]
    music_dir: Option<PathBuf>,

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

    log::info!("Ridgecast Station v{}", env!("CARGO_PKG_VERSION"));

    let mut config = DaemonConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(dir) = args.music_dir {
        config.music_dir = Some(dir);
    }

    // Content inputs are startup-fatal like any other configuration error
    let music_dir = config
        .music_dir
        .clone()
        .context("No music directory configured (set STATION_MUSIC_DIR or pass MUSIC_DIR)")?;
    let playlist = Playlist::scan(&music_dir)?;

    let playlog_path = config.playlog_path.clone();
    let playlog = Arc::new(Mutex::new(PlayLog::load(&playlog_path)));

    let runtime = StationRuntime::start(config.to_core_config())
        .await
        .context("Failed to start station")?;

    // The pre-shutdown hook persists play history before teardown
    {
        let playlog = Arc::clone(&playlog);
        let playlog_path = playlog_path.clone();
        runtime.set_pre_shutdown_hook(Box::new(move || {
            if let Err(e) = playlog.lock().save(&playlog_path) {
                log::warn!("Failed to save play log to {}: {e}", playlog_path.display());
            } else {
                log::info!("Play log saved to {}", playlog_path.display());
            }
        }));
    }

    let feeder_cancel = CancellationToken::new();
    let feeder = tokio::spawn(run_feeder(
        Arc::clone(runtime.scheduler()),
        playlist,
        playlog,
        feeder_cancel.clone(),
    ));

    shutdown_signal().await;
    log::info!("Shutdown signal received, draining...");

    feeder_cancel.cancel();
    let _ = feeder.await;
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
