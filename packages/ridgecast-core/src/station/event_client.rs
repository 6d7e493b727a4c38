//! Control-plane client: station → `ws://tower/tower/events`.
//!
//! Events are fire-and-forget JSON text frames. The connection task
//! reconnects with backoff; anything emitted while the channel is down is
//! dropped, matching the tower's zero-retention contract. Inbound frames
//! (the hub rebroadcasts everything) are drained and ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::events::{ControlEvent, ControlPayload};
use crate::protocol_constants::{
    EVENT_CHANNEL_CAPACITY, RECONNECT_BACKOFF_INITIAL, RECONNECT_BACKOFF_MAX,
};

/// Handle for emitting control events toward the tower.
///
/// Cloning shares the underlying channel; all clones feed one socket.
#[derive(Clone)]
pub struct EventClient {
    tx: mpsc::Sender<ControlEvent>,
    epoch: Instant,
    dropped: Arc<AtomicU64>,
}

impl EventClient {
    /// Starts the connection task; returns the emit handle.
    pub fn start(events_url: String, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<ControlEvent>(EVENT_CHANNEL_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(connection_loop(
            events_url,
            rx,
            cancel,
            Arc::clone(&dropped),
        ));

        (
            Self {
                tx,
                epoch: Instant::now(),
                dropped,
            },
            task,
        )
    }

    /// Emits one event, stamped with the client's monotonic clock.
    ///
    /// Never blocks; a full queue or dead channel drops the event.
    pub fn emit(&self, payload: ControlPayload) {
        let event = ControlEvent::new(self.epoch.elapsed().as_secs_f64(), payload);
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped before reaching the socket.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn connection_loop(
    url: String,
    mut rx: mpsc::Receiver<ControlEvent>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
) {
    let mut backoff = RECONNECT_BACKOFF_INITIAL;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                log::info!("[EventClient] connected to {url}");
                backoff = RECONNECT_BACKOFF_INITIAL;
                let (mut sink, mut stream) = socket.split();

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            return;
                        }
                        event = rx.recv() => {
                            let Some(event) = event else { return };
                            match serde_json::to_string(&event) {
                                Ok(json) => {
                                    if sink.send(Message::Text(json.into())).await.is_err() {
                                        dropped.fetch_add(1, Ordering::Relaxed);
                                        break;
                                    }
                                }
                                Err(e) => log::warn!("[EventClient] serialize failed: {e}"),
                            }
                        }
                        // Drain the hub's rebroadcast so the socket's read
                        // side never backs up
                        inbound = stream.next() => {
                            match inbound {
                                Some(Ok(_)) => {}
                                Some(Err(_)) | None => break,
                            }
                        }
                    }
                }
                log::warn!("[EventClient] connection lost, reconnecting");
            }
            Err(e) => {
                log::debug!("[EventClient] connect to {url} failed: {e}");
            }
        }

        // Zero retention: whatever queued while down is dropped
        while let Ok(_stale) = rx.try_recv() {
            dropped.fetch_add(1, Ordering::Relaxed);
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
    }

    log::debug!("[EventClient] stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn emits_are_dropped_while_disconnected() {
        let cancel = CancellationToken::new();
        let (client, task) =
            EventClient::start("ws://127.0.0.1:1/tower/events".into(), cancel.clone());

        // Overfill the channel while nothing is connected
        for _ in 0..(EVENT_CHANNEL_CAPACITY + 10) {
            client.emit(ControlPayload::DjTalking { topic: None });
        }
        // try_send drops once the queue is full
        assert!(client.dropped_events() >= 10);

        // The loop's drain between attempts discards the rest
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(client.dropped_events() >= EVENT_CHANNEL_CAPACITY as u64);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }

    #[tokio::test]
    async fn timestamps_are_monotonic() {
        let cancel = CancellationToken::new();
        let (client, task) = EventClient::start("ws://127.0.0.1:1/x".into(), cancel.clone());

        let a = client.epoch.elapsed().as_secs_f64();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = client.epoch.elapsed().as_secs_f64();
        assert!(b > a);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }
}
