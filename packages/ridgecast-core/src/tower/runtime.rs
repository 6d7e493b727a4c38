//! Tower bootstrap and lifecycle.
//!
//! This is the composition root for the tower daemon: all services are
//! instantiated and wired together here, in dependency order, and torn
//! down in the drain order the audio contract requires. Keeping the wiring
//! in one place makes the dependency graph visible and lets tests assemble
//! the same pipeline against ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::buffer::FrameRing;
use crate::clock::MasterClock;
use crate::error::{RidgecastError, RidgecastResult};
use crate::events::{ControlPayload, EventHub};
use crate::fallback::{FallbackGenerator, FallbackMode};
use crate::protocol_constants::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_CLIENT_BUFFER_BYTES, DEFAULT_CLIENT_TIMEOUT_MS,
    DEFAULT_ENCODER_GRACE_SECS, FRAME_DURATION,
};
use crate::tower::broadcast::{Broadcaster, BroadcasterConfig};
use crate::tower::encoder::{EncoderManager, PcmSink};
use crate::tower::ffmpeg::{FfmpegSupervisor, PcmHandle};
use crate::tower::ingress::{IngressEndpoint, PcmIngress};
use crate::tower::pump::AudioPump;

/// Everything the tower needs to come up.
#[derive(Debug, Clone)]
pub struct TowerConfig {
    /// HTTP bind address (stream, buffer status, events).
    pub http_addr: SocketAddr,
    /// PCM ingest endpoint.
    pub pcm_endpoint: IngressEndpoint,
    /// Ring buffer capacity in frames.
    pub buffer_capacity: usize,
    /// Per-listener pending byte cap.
    pub client_buffer_bytes: usize,
    /// Per-listener write stall timeout.
    pub client_timeout: Duration,
    /// Underrun grace window.
    pub encoder_grace: Duration,
    /// What fallback audio sounds like.
    pub fallback_mode: FallbackMode,
}

impl Default for TowerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8005).into(),
            pcm_endpoint: IngressEndpoint::Tcp(([127, 0, 0, 1], 8006).into()),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            client_buffer_bytes: DEFAULT_CLIENT_BUFFER_BYTES,
            client_timeout: Duration::from_millis(DEFAULT_CLIENT_TIMEOUT_MS),
            encoder_grace: Duration::from_secs(DEFAULT_ENCODER_GRACE_SECS),
            fallback_mode: FallbackMode::Silence,
        }
    }
}

impl TowerConfig {
    /// Rejects configurations that would misbehave at runtime.
    pub fn validate(&self) -> RidgecastResult<()> {
        if self.buffer_capacity == 0 {
            return Err(RidgecastError::Configuration(
                "buffer_capacity must be >= 1".into(),
            ));
        }
        if self.client_buffer_bytes == 0 {
            return Err(RidgecastError::Configuration(
                "client_buffer_bytes must be >= 1".into(),
            ));
        }
        if self.client_timeout.is_zero() {
            return Err(RidgecastError::Configuration(
                "client_timeout must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// A running tower: all services started, shutdown on request.
pub struct TowerRuntime {
    ring: Arc<FrameRing>,
    broadcaster: Arc<Broadcaster>,
    events: Arc<EventHub>,
    encoder: Arc<EncoderManager>,
    pcm_handle: Arc<PcmHandle>,
    clock: MasterClock,
    cancel: CancellationToken,
    supervisor_task: JoinHandle<()>,
    ingress_task: JoinHandle<()>,
    server_task: JoinHandle<()>,
    grace_task: JoinHandle<()>,
}

impl TowerRuntime {
    /// Wires and starts the whole tower pipeline.
    ///
    /// Startup order: ingress bind → buffer → pump + clock B → encoder
    /// manager → ffmpeg supervisor → broadcaster → HTTP listeners last.
    /// Any error here is fatal; after this returns, nothing is.
    pub async fn start(config: TowerConfig) -> RidgecastResult<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();

        // Shared state, leaves first
        let ring = Arc::new(FrameRing::new(config.buffer_capacity));
        let events = Arc::new(EventHub::new());
        let broadcaster = Arc::new(Broadcaster::new(BroadcasterConfig {
            pending_cap_bytes: config.client_buffer_bytes,
            client_timeout: config.client_timeout,
        }));

        // Encoder chain: supervisor owns ffmpeg, manager routes into it
        let supervisor = FfmpegSupervisor::new(Arc::clone(&broadcaster), cancel.clone());
        let (pcm_handle, supervisor_task) = supervisor.start();
        let encoder = Arc::new(EncoderManager::new(
            Arc::clone(&pcm_handle) as Arc<dyn PcmSink>,
            Arc::clone(&events),
            FallbackGenerator::new(config.fallback_mode),
            config.encoder_grace,
        ));

        // Announced drains restart the grace window so the underrun
        // warnings stay quiet for the whole goodbye
        let grace_task = {
            let events = Arc::clone(&events);
            let encoder = Arc::clone(&encoder);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut rx = events.subscribe();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Ok(event) => {
                                if matches!(event.payload, ControlPayload::StationShuttingDown) {
                                    encoder.mark_station_draining();
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            })
        };

        // PCM ingest binds before anything starts ticking
        let ingress = match PcmIngress::bind(
            config.pcm_endpoint.clone(),
            Arc::clone(&ring),
            Arc::clone(&encoder),
            cancel.clone(),
        )
        .await
        {
            Ok(ingress) => ingress,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };
        let ingress_task = tokio::spawn(ingress.run());

        // Emission metronome drives the pump
        let clock = MasterClock::new(FRAME_DURATION);
        let pump = Arc::new(AudioPump::new(
            Arc::clone(&ring),
            Arc::clone(&encoder),
            FRAME_DURATION,
        ));
        clock.subscribe(pump.into_subscriber());
        if let Err(e) = clock.start() {
            cancel.cancel();
            return Err(RidgecastError::Internal(format!(
                "Failed to start emission clock: {e}"
            )));
        }

        // Listeners come last: nothing connects before audio can flow
        let state = AppState::new(
            Arc::clone(&ring),
            Arc::clone(&broadcaster),
            Arc::clone(&events),
        );
        let http_addr = config.http_addr;
        let listener = match tokio::net::TcpListener::bind(http_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                cancel.cancel();
                clock.stop();
                return Err(RidgecastError::Configuration(format!(
                    "HTTP bind {http_addr} failed: {e}"
                )));
            }
        };
        let bound_addr = listener.local_addr().map_err(RidgecastError::Bind)?;
        let server_task = tokio::spawn(async move {
            if let Err(e) = serve_on(state, listener).await {
                log::error!("[Server] exited: {e}");
            }
        });

        log::info!(
            "[Tower] up: http={bound_addr}, pcm={}, buffer={} frames",
            config.pcm_endpoint,
            config.buffer_capacity
        );

        Ok(Self {
            ring,
            broadcaster,
            events,
            encoder,
            pcm_handle,
            clock,
            cancel,
            supervisor_task,
            ingress_task,
            server_task,
            grace_task,
        })
    }

    /// The PCM ring (status endpoint and tests).
    pub fn ring(&self) -> &Arc<FrameRing> {
        &self.ring
    }

    /// The listener fan-out.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// The control-plane hub.
    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// The live/fallback router.
    pub fn encoder(&self) -> &Arc<EncoderManager> {
        &self.encoder
    }

    /// Frames dropped at the encoder queue since startup.
    pub fn encoder_dropped_frames(&self) -> u64 {
        self.pcm_handle.dropped_frames()
    }

    /// Graceful teardown in drain order.
    ///
    /// Stop accepting listeners, stop the metronome, stop ffmpeg
    /// (TERM then KILL), then close remaining listeners.
    pub async fn shutdown(self) {
        log::info!("[Tower] shutting down...");

        self.broadcaster.stop_accepting();
        self.cancel.cancel();

        // Clock last among the audio producers so the pump never ticks
        // into a torn-down encoder
        self.clock.stop();

        // The supervisor handles TERM → KILL internally
        let _ = tokio::time::timeout(Duration::from_secs(5), self.supervisor_task).await;
        let _ = tokio::time::timeout(Duration::from_secs(2), self.ingress_task).await;
        let _ = self.grace_task.await;

        self.broadcaster.close_all();
        self.server_task.abort();
        let _ = self.server_task.await;

        log::info!("[Tower] shutdown complete");
    }
}

async fn serve_on(state: AppState, listener: tokio::net::TcpListener) -> std::io::Result<()> {
    let app = crate::api::http::create_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral_config() -> TowerConfig {
        TowerConfig {
            http_addr: ([127, 0, 0, 1], 0).into(),
            pcm_endpoint: IngressEndpoint::Tcp(([127, 0, 0, 1], 0).into()),
            ..TowerConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(TowerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = TowerConfig {
            buffer_capacity: 0,
            ..TowerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn starts_and_shuts_down_cleanly() {
        let runtime = TowerRuntime::start(ephemeral_config()).await.unwrap();
        assert_eq!(runtime.ring().snapshot().count, 0);
        assert_eq!(runtime.broadcaster().client_count(), 0);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn occupied_pcm_port_fails_at_startup() {
        // Occupy a port, then ask the tower to bind its PCM ingest there
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap();

        let config = TowerConfig {
            pcm_endpoint: IngressEndpoint::Tcp(taken),
            ..ephemeral_config()
        };
        let result = TowerRuntime::start(config).await;
        assert!(matches!(result, Err(RidgecastError::Configuration(_))));
    }
}
