//! Station configuration.
//!
//! YAML file plus `STATION_*` environment overrides, mirroring the tower
//! daemon's loader.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ridgecast_core::{FeedEndpoint, PidConfig, StationConfig};
use serde::Deserialize;

/// Station daemon configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory of MP3 segments to rotate through.
    /// Override: `STATION_MUSIC_DIR`
    pub music_dir: Option<PathBuf>,

    /// Tower HTTP base URL (buffer polling, events).
    /// Override: `STATION_TOWER_URL`
    pub tower_url: String,

    /// Tower PCM unix socket path. Takes precedence over `pcm_tcp_addr`.
    /// Override: `STATION_PCM_SOCKET_PATH`
    pub pcm_socket_path: Option<PathBuf>,

    /// Tower PCM TCP address, used when no socket path is configured.
    pub pcm_tcp_addr: SocketAddr,

    /// Where the play history document is written.
    /// Override: `STATION_PLAYLOG_PATH`
    pub playlog_path: PathBuf,

    /// Adaptive decode pacing.
    /// Overrides: `STATION_PID_ENABLED`, `STATION_PID_TARGET_RATIO`,
    /// `STATION_PID_KP`, `STATION_PID_KI`, `STATION_PID_KD`
    pub pid_enabled: bool,
    pub pid_target_ratio: f64,
    pub pid_kp: f64,
    pub pid_ki: f64,
    pub pid_kd: f64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            music_dir: None,
            tower_url: "http://127.0.0.1:8005".into(),
            pcm_socket_path: default_socket_path(),
            pcm_tcp_addr: ([127, 0, 0, 1], 8006).into(),
            playlog_path: PathBuf::from("playlog.json"),
            pid_enabled: false,
            pid_target_ratio: 0.5,
            pid_kp: 0.1,
            pid_ki: 0.01,
            pid_kd: 0.05,
        }
    }
}

#[cfg(unix)]
fn default_socket_path() -> Option<PathBuf> {
    Some(PathBuf::from("/tmp/ridgecast-pcm.sock"))
}

#[cfg(not(unix))]
fn default_socket_path() -> Option<PathBuf> {
    None
}

impl DaemonConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("STATION_MUSIC_DIR") {
            self.music_dir = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("STATION_TOWER_URL") {
            self.tower_url = val;
        }
        if let Ok(val) = std::env::var("STATION_PCM_SOCKET_PATH") {
            self.pcm_socket_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("STATION_PLAYLOG_PATH") {
            self.playlog_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("STATION_PID_ENABLED") {
            self.pid_enabled = val
                .parse()
                .with_context(|| format!("STATION_PID_ENABLED invalid: {val}"))?;
        }
        if let Ok(val) = std::env::var("STATION_PID_TARGET_RATIO") {
            self.pid_target_ratio = val
                .parse()
                .with_context(|| format!("STATION_PID_TARGET_RATIO invalid: {val}"))?;
        }
        if let Ok(val) = std::env::var("STATION_PID_KP") {
            self.pid_kp = val
                .parse()
                .with_context(|| format!("STATION_PID_KP invalid: {val}"))?;
        }
        if let Ok(val) = std::env::var("STATION_PID_KI") {
            self.pid_ki = val
                .parse()
                .with_context(|| format!("STATION_PID_KI invalid: {val}"))?;
        }
        if let Ok(val) = std::env::var("STATION_PID_KD") {
            self.pid_kd = val
                .parse()
                .with_context(|| format!("STATION_PID_KD invalid: {val}"))?;
        }
        Ok(())
    }

    /// Converts to ridgecast-core's `StationConfig`.
    pub fn to_core_config(&self) -> StationConfig {
        let feed_endpoint = match &self.pcm_socket_path {
            #[cfg(unix)]
            Some(path) => FeedEndpoint::Unix(path.clone()),
            #[cfg(not(unix))]
            Some(_) => FeedEndpoint::Tcp(self.pcm_tcp_addr),
            None => FeedEndpoint::Tcp(self.pcm_tcp_addr),
        };

        let events_url = format!(
            "{}/tower/events",
            self.tower_url
                .replacen("http://", "ws://", 1)
                .replacen("https://", "wss://", 1)
                .trim_end_matches('/')
        );

        StationConfig {
            feed_endpoint,
            tower_http_url: self.tower_url.clone(),
            tower_events_url: events_url,
            pid: PidConfig {
                enabled: self.pid_enabled,
                target_ratio: self.pid_target_ratio,
                kp: self.pid_kp,
                ki: self.pid_ki,
                kd: self.pid_kd,
                ..PidConfig::default()
            },
            ..StationConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_url_derives_from_tower_url() {
        let config = DaemonConfig {
            tower_url: "http://10.0.0.5:8005/".into(),
            ..DaemonConfig::default()
        };
        let core = config.to_core_config();
        assert_eq!(core.tower_events_url, "ws://10.0.0.5:8005/tower/events");
    }
}
