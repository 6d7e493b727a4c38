//! Station bootstrap and lifecycle.
//!
//! Composition root for the station daemon: scheduler, playout engine
//! (Clock A), PCM feed, event client, and the optional PID poller, wired
//! in dependency order. Shutdown drains: no new segments, announce the
//! drain, let the in-flight segment finish, run the content layer's
//! persistence hook, then stop the support tasks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RidgecastResult;
use crate::events::ControlPayload;
use crate::protocol_constants::DEFAULT_PREP_LEAD;
use crate::station::event_client::EventClient;
use crate::station::feed::{FeedEndpoint, PcmFeed};
use crate::station::pid::{BufferPid, PidConfig};
use crate::station::playout::PlayoutEngine;
use crate::station::scheduler::{SegmentEvent, SegmentKind, SegmentScheduler};

/// Callback invoked before teardown; the content layer persists its play
/// history here.
pub type PreShutdownHook = Box<dyn FnOnce() + Send>;

/// Everything the station needs to come up.
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Tower PCM ingest endpoint.
    pub feed_endpoint: FeedEndpoint,
    /// Tower HTTP base URL (PID buffer polling).
    pub tower_http_url: String,
    /// Tower control-plane WebSocket URL.
    pub tower_events_url: String,
    /// Adaptive pacing configuration.
    pub pid: PidConfig,
    /// Lead time for the segment prep window.
    pub prep_lead: Duration,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            feed_endpoint: FeedEndpoint::Tcp(([127, 0, 0, 1], 8006).into()),
            tower_http_url: "http://127.0.0.1:8005".into(),
            tower_events_url: "ws://127.0.0.1:8005/tower/events".into(),
            pid: PidConfig::default(),
            prep_lead: DEFAULT_PREP_LEAD,
        }
    }
}

/// A running station.
pub struct StationRuntime {
    scheduler: Arc<SegmentScheduler>,
    event_client: EventClient,
    pid: Arc<BufferPid>,
    drain: CancellationToken,
    cancel: CancellationToken,
    engine_task: JoinHandle<()>,
    bridge_task: JoinHandle<()>,
    event_task: JoinHandle<()>,
    pid_task: Option<JoinHandle<()>>,
    pre_shutdown: Mutex<Option<PreShutdownHook>>,
}

impl StationRuntime {
    /// Wires and starts the station pipeline.
    ///
    /// Startup order: Clock A engine → PCM feed (inside the engine) →
    /// event client (announcing `station_starting_up`) → PID poller.
    pub async fn start(config: StationConfig) -> RidgecastResult<Self> {
        let cancel = CancellationToken::new();
        let drain = CancellationToken::new();

        let scheduler = Arc::new(SegmentScheduler::new(config.prep_lead));
        let pid = Arc::new(BufferPid::new(config.pid.clone()));

        let engine = PlayoutEngine::new(
            Arc::clone(&scheduler),
            PcmFeed::new(config.feed_endpoint.clone()),
            Arc::clone(&pid),
            drain.clone(),
        );
        let engine_task = tokio::spawn(engine.run());

        let (event_client, event_task) =
            EventClient::start(config.tower_events_url.clone(), cancel.clone());
        event_client.emit(ControlPayload::StationStartingUp);

        // Bridge segment starts onto the control plane
        let bridge_task = spawn_bridge(
            Arc::clone(&scheduler),
            event_client.clone(),
            cancel.clone(),
        );

        let pid_task = pid.start_poller(config.tower_http_url.clone(), cancel.clone());

        log::info!(
            "[Station] up: feed={}, tower={}, pid_enabled={}",
            config.feed_endpoint,
            config.tower_http_url,
            pid.is_enabled()
        );

        Ok(Self {
            scheduler,
            event_client,
            pid,
            drain,
            cancel,
            engine_task,
            bridge_task,
            event_task,
            pid_task,
            pre_shutdown: Mutex::new(None),
        })
    }

    /// The intent queue for the content layer.
    pub fn scheduler(&self) -> &Arc<SegmentScheduler> {
        &self.scheduler
    }

    /// The pacing controller (diagnostics).
    pub fn pid(&self) -> &Arc<BufferPid> {
        &self.pid
    }

    /// Registers the persistence hook run during shutdown, before
    /// teardown.
    pub fn set_pre_shutdown_hook(&self, hook: PreShutdownHook) {
        *self.pre_shutdown.lock() = Some(hook);
    }

    /// Drains and stops the station.
    pub async fn shutdown(self) {
        log::info!("[Station] shutting down...");

        // No new segments; announce the drain so the tower's underrun
        // warnings stay quiet
        self.scheduler.stop_accepting();
        self.event_client.emit(ControlPayload::StationShuttingDown);

        // Let the in-flight segment finish
        self.drain.cancel();
        if let Err(e) = self.engine_task.await {
            log::warn!("[Station] engine task ended abnormally: {e}");
        }

        // Content layer persists its state before anything else dies
        if let Some(hook) = self.pre_shutdown.lock().take() {
            hook();
        }

        // Give the goodbye a moment to reach the wire, then stop everything
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.event_task).await;
        let _ = tokio::time::timeout(Duration::from_secs(2), self.bridge_task).await;
        if let Some(pid_task) = self.pid_task {
            let _ = tokio::time::timeout(Duration::from_secs(2), pid_task).await;
        }

        log::info!("[Station] shutdown complete");
    }
}

fn spawn_bridge(
    scheduler: Arc<SegmentScheduler>,
    events: EventClient,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = scheduler.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(SegmentEvent::Started { kind, path }) => {
                        let stem = path
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned());
                        match kind {
                            SegmentKind::Talk | SegmentKind::Id => {
                                events.emit(ControlPayload::DjTalking { topic: stem });
                            }
                            SegmentKind::Song | SegmentKind::Intro | SegmentKind::Outro => {
                                events.emit(ControlPayload::NewSong {
                                    title: stem,
                                    artist: None,
                                });
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::scheduler::AudioEvent;

    fn offline_config() -> StationConfig {
        // Nothing listening anywhere: the station must still run
        StationConfig {
            feed_endpoint: FeedEndpoint::Tcp(([127, 0, 0, 1], 1).into()),
            tower_http_url: "http://127.0.0.1:1".into(),
            tower_events_url: "ws://127.0.0.1:1/tower/events".into(),
            ..StationConfig::default()
        }
    }

    #[tokio::test]
    async fn starts_and_drains_without_a_tower() {
        let runtime = StationRuntime::start(offline_config()).await.unwrap();
        assert!(runtime.scheduler().is_accepting());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn pre_shutdown_hook_runs_during_drain() {
        let runtime = StationRuntime::start(offline_config()).await.unwrap();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_in = Arc::clone(&fired);
        runtime.set_pre_shutdown_hook(Box::new(move || {
            fired_in.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        runtime.shutdown().await;
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn draining_scheduler_refuses_new_intents() {
        let runtime = StationRuntime::start(offline_config()).await.unwrap();
        let scheduler = Arc::clone(runtime.scheduler());
        runtime.shutdown().await;
        assert!(!scheduler.enqueue(AudioEvent::song("/music/late.mp3")));
    }
}
