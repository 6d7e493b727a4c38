//! Tower configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! The `TOWER_*` variables are the canonical deployment interface; the
//! YAML file exists for dev setups that want everything in one place.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ridgecast_core::{FallbackMode, IngressEndpoint, TowerConfig};
use serde::Deserialize;

/// Tower daemon configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP bind host.
    /// Override: `TOWER_HOST`
    pub host: IpAddr,

    /// HTTP bind port.
    /// Override: `TOWER_PORT`
    pub port: u16,

    /// PCM ingest unix socket path. Takes precedence over `pcm_tcp_addr`.
    /// Override: `TOWER_PCM_SOCKET_PATH`
    pub pcm_socket_path: Option<PathBuf>,

    /// PCM ingest TCP address, used when no socket path is configured.
    pub pcm_tcp_addr: SocketAddr,

    /// Ring buffer capacity in frames.
    /// Override: `TOWER_BUFFER_CAPACITY`
    pub buffer_capacity: usize,

    /// Per-listener write stall timeout in milliseconds.
    /// Override: `TOWER_CLIENT_TIMEOUT_MS`
    pub client_timeout_ms: u64,

    /// Per-listener pending byte cap.
    /// Override: `TOWER_CLIENT_BUFFER_BYTES`
    pub client_buffer_bytes: usize,

    /// Underrun grace window in seconds.
    /// Override: `TOWER_ENCODER_GRACE_S`
    pub encoder_grace_s: u64,

    /// Fallback audio flavor: `silence` or `tone`.
    /// Override: `TOWER_FALLBACK_MODE`
    pub fallback_mode: FallbackMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: [0, 0, 0, 0].into(),
            port: 8005,
            pcm_socket_path: default_socket_path(),
            pcm_tcp_addr: ([127, 0, 0, 1], 8006).into(),
            buffer_capacity: 234,
            client_timeout_ms: 5000,
            client_buffer_bytes: 64 * 1024,
            encoder_grace_s: 5,
            fallback_mode: FallbackMode::Silence,
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

impl ServerConfig {
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

    /// Applies the `TOWER_*` environment variables.
    ///
    /// Unparseable values are configuration errors, not silent defaults:
    /// a typo in a deployment should fail loudly at startup.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("TOWER_HOST") {
            self.host = val
                .parse()
                .with_context(|| format!("TOWER_HOST invalid: {val}"))?;
        }
        if let Ok(val) = std::env::var("TOWER_PORT") {
            self.port = val
                .parse()
                .with_context(|| format!("TOWER_PORT invalid: {val}"))?;
        }
        if let Ok(val) = std::env::var("TOWER_PCM_SOCKET_PATH") {
            self.pcm_socket_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("TOWER_BUFFER_CAPACITY") {
            self.buffer_capacity = val
                .parse()
                .with_context(|| format!("TOWER_BUFFER_CAPACITY invalid: {val}"))?;
        }
        if let Ok(val) = std::env::var("TOWER_CLIENT_TIMEOUT_MS") {
            self.client_timeout_ms = val
                .parse()
                .with_context(|| format!("TOWER_CLIENT_TIMEOUT_MS invalid: {val}"))?;
        }
        if let Ok(val) = std::env::var("TOWER_CLIENT_BUFFER_BYTES") {
            self.client_buffer_bytes = val
                .parse()
                .with_context(|| format!("TOWER_CLIENT_BUFFER_BYTES invalid: {val}"))?;
        }
        if let Ok(val) = std::env::var("TOWER_ENCODER_GRACE_S") {
            self.encoder_grace_s = val
                .parse()
                .with_context(|| format!("TOWER_ENCODER_GRACE_S invalid: {val}"))?;
        }
        if let Ok(val) = std::env::var("TOWER_FALLBACK_MODE") {
            self.fallback_mode = val
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("TOWER_FALLBACK_MODE invalid: {val}"))?;
        }
        Ok(())
    }

    /// Converts to ridgecast-core's `TowerConfig`.
    pub fn to_core_config(&self) -> TowerConfig {
        let pcm_endpoint = match &self.pcm_socket_path {
            #[cfg(unix)]
            Some(path) => IngressEndpoint::Unix(path.clone()),
            #[cfg(not(unix))]
            Some(_) => IngressEndpoint::Tcp(self.pcm_tcp_addr),
            None => IngressEndpoint::Tcp(self.pcm_tcp_addr),
        };

        TowerConfig {
            http_addr: SocketAddr::new(self.host, self.port),
            pcm_endpoint,
            buffer_capacity: self.buffer_capacity,
            client_buffer_bytes: self.client_buffer_bytes,
            client_timeout: Duration::from_millis(self.client_timeout_ms),
            encoder_grace: Duration::from_secs(self.encoder_grace_s),
            fallback_mode: self.fallback_mode,
        }
    }
}
