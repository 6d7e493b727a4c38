//! MP3 fan-out to HTTP listeners.
//!
//! Two-queue design: `broadcast()` runs on the encoder's stdout reader and
//! only ever appends to per-listener pending queues under each listener's
//! own lock, so a slow or dead client can never stall the reader. A
//! dedicated per-listener body stream drains the queue toward the socket
//! at whatever pace the client accepts.
//!
//! A listener is dropped (no partial append) when its pending bytes would
//! exceed the cap, or when it has pending data but made no drain progress
//! for the client timeout.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::Notify;
use uuid::Uuid;

/// Fan-out limits, from the tower configuration.
#[derive(Debug, Clone, Copy)]
pub struct BroadcasterConfig {
    /// Per-listener pending byte cap.
    pub pending_cap_bytes: usize,
    /// Drop a listener with pending data after this long without drain
    /// progress.
    pub client_timeout: Duration,
}

struct ListenerQueue {
    chunks: VecDeque<Bytes>,
    pending_bytes: usize,
    dropped: bool,
    last_drain: Instant,
    bytes_sent: u64,
    chunks_sent: u64,
}

/// One connected HTTP listener.
pub struct Listener {
    id: Uuid,
    addr: IpAddr,
    connected_at: Instant,
    queue: parking_lot::Mutex<ListenerQueue>,
    wakeup: Notify,
}

impl Listener {
    fn new(addr: IpAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            addr,
            connected_at: Instant::now(),
            queue: parking_lot::Mutex::new(ListenerQueue {
                chunks: VecDeque::new(),
                pending_bytes: 0,
                dropped: false,
                last_drain: Instant::now(),
                bytes_sent: 0,
                chunks_sent: 0,
            }),
            wakeup: Notify::new(),
        }
    }

    /// Returns the listener id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Appends a chunk under this listener's lock.
    ///
    /// Returns `false` when the listener must be dropped: cap exceeded
    /// (nothing appended) or drain stalled past the timeout.
    fn enqueue(&self, chunk: &Bytes, config: &BroadcasterConfig) -> bool {
        let mut queue = self.queue.lock();
        if queue.dropped {
            return false;
        }

        let stalled = !queue.chunks.is_empty()
            && queue.last_drain.elapsed() > config.client_timeout;
        if stalled {
            queue.dropped = true;
            log::warn!(
                "[Broadcast] dropping stalled listener {} ({}): no drain for {:?}",
                self.id,
                self.addr,
                queue.last_drain.elapsed()
            );
            return false;
        }

        if queue.pending_bytes + chunk.len() > config.pending_cap_bytes {
            queue.dropped = true;
            log::warn!(
                "[Broadcast] dropping slow listener {} ({}): {} pending + {} chunk > {} cap",
                self.id,
                self.addr,
                queue.pending_bytes,
                chunk.len(),
                config.pending_cap_bytes
            );
            return false;
        }

        queue.pending_bytes += chunk.len();
        queue.chunks.push_back(chunk.clone());
        true
    }

    /// Current pending byte count (diagnostics and tests).
    pub fn pending_bytes(&self) -> usize {
        self.queue.lock().pending_bytes
    }
}

/// RAII guard logging listener delivery stats and removing it from the
/// registry when the HTTP body is dropped.
struct ListenerGuard {
    listener: Arc<Listener>,
    broadcaster: Arc<Broadcaster>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.broadcaster.remove(self.listener.id);
        let queue = self.listener.queue.lock();
        log::info!(
            "[Broadcast] listener {} ({}) disconnected: chunks_sent={}, bytes_sent={}, \
             pending={}, dropped={}, connected_for={:?}",
            self.listener.id,
            self.listener.addr,
            queue.chunks_sent,
            queue.bytes_sent,
            queue.pending_bytes,
            queue.dropped,
            self.listener.connected_at.elapsed()
        );
    }
}

/// Registry of connected listeners plus the fan-out entry point.
pub struct Broadcaster {
    clients: DashMap<Uuid, Arc<Listener>>,
    config: BroadcasterConfig,
    accepting: AtomicBool,
    drop_count: AtomicU64,
    chunks_broadcast: AtomicU64,
}

impl Broadcaster {
    /// Creates an empty, accepting broadcaster.
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            clients: DashMap::new(),
            config,
            accepting: AtomicBool::new(true),
            drop_count: AtomicU64::new(0),
            chunks_broadcast: AtomicU64::new(0),
        }
    }

    /// Registers a new listener; `None` once shutdown has begun.
    pub fn subscribe(&self, addr: IpAddr) -> Option<Arc<Listener>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }
        let listener = Arc::new(Listener::new(addr));
        self.clients.insert(listener.id, Arc::clone(&listener));
        log::info!(
            "[Broadcast] listener {} connected from {} (total: {})",
            listener.id,
            addr,
            self.clients.len()
        );
        Some(listener)
    }

    /// Removes a listener from the registry. Idempotent.
    pub fn remove(&self, id: Uuid) {
        self.clients.remove(&id);
    }

    /// Appends one MP3 chunk to every live listener.
    ///
    /// Never writes to a socket; per-listener work happens under that
    /// listener's own lock only.
    pub fn broadcast(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.chunks_broadcast.fetch_add(1, Ordering::Relaxed);

        let mut dead: Vec<Uuid> = Vec::new();
        for entry in self.clients.iter() {
            let listener = entry.value();
            if listener.enqueue(&chunk, &self.config) {
                listener.wakeup.notify_one();
            } else {
                // Wake it so its body stream observes the drop mark
                listener.wakeup.notify_one();
                dead.push(listener.id);
            }
        }

        for id in dead {
            self.drop_count.fetch_add(1, Ordering::Relaxed);
            self.clients.remove(&id);
        }
    }

    /// Number of connected listeners.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Total listeners dropped for backpressure since startup.
    pub fn drop_count(&self) -> u64 {
        self.drop_count.load(Ordering::Relaxed)
    }

    /// Stops accepting new listeners (shutdown step one).
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Marks every listener dropped and wakes their streams.
    pub fn close_all(&self) {
        self.stop_accepting();
        for entry in self.clients.iter() {
            let listener = entry.value();
            listener.queue.lock().dropped = true;
            listener.wakeup.notify_one();
        }
        self.clients.clear();
        log::info!("[Broadcast] all listeners closed");
    }

    /// Builds the HTTP body stream draining one listener's queue.
    ///
    /// The stream ends with an error once the listener is marked dropped;
    /// the guard removes it from the registry when hyper releases the body.
    pub fn body_stream(
        self: Arc<Self>,
        listener: Arc<Listener>,
    ) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        enum Step {
            Chunk(Bytes),
            Dropped,
            Empty,
        }

        stream! {
            let _guard = ListenerGuard {
                listener: Arc::clone(&listener),
                broadcaster: self,
            };

            loop {
                // Arm before checking so a notify between the check and the
                // await is not lost
                let notified = listener.wakeup.notified();

                // The lock is released before any yield: guards must not
                // live across the stream's suspension points
                let step = {
                    let mut queue = listener.queue.lock();
                    if queue.dropped {
                        Step::Dropped
                    } else {
                        match queue.chunks.pop_front() {
                            Some(chunk) => {
                                queue.pending_bytes -= chunk.len();
                                queue.last_drain = Instant::now();
                                queue.bytes_sent += chunk.len() as u64;
                                queue.chunks_sent += 1;
                                Step::Chunk(chunk)
                            }
                            None => Step::Empty,
                        }
                    }
                };

                match step {
                    Step::Chunk(chunk) => yield Ok(chunk),
                    Step::Dropped => {
                        yield Err(std::io::Error::other("listener dropped"));
                        break;
                    }
                    Step::Empty => notified.await,
                }
            }
        }
    }
}
