//! Control-plane events between the station and the tower.
//!
//! Events are validated at the boundary, delivered to currently-connected
//! peers, and never stored: no replay, no durability. The only state the
//! hub keeps is the station drain flag, which the encoder manager reads to
//! suppress underrun warnings during a legitimate shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{RidgecastError, RidgecastResult};
use crate::protocol_constants::EVENT_CHANNEL_CAPACITY;

/// Event payload, tagged by kind.
///
/// Unknown kinds fail deserialization at the boundary instead of flowing
/// through as untyped maps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlPayload {
    /// Station process came up and will start feeding PCM.
    StationStartingUp,
    /// Station is draining; underruns are expected and benign.
    StationShuttingDown,
    /// A new song segment started playing.
    NewSong {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        artist: Option<String>,
    },
    /// A spoken DJ segment started playing.
    DjTalking {
        #[serde(default)]
        topic: Option<String>,
    },
}

impl ControlPayload {
    /// Returns the wire name of this kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StationStartingUp => "station_starting_up",
            Self::StationShuttingDown => "station_shutting_down",
            Self::NewSong { .. } => "new_song",
            Self::DjTalking { .. } => "dj_talking",
        }
    }
}

/// A validated control event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlEvent {
    /// Sender's monotonic timestamp in seconds.
    pub ts: f64,
    #[serde(flatten)]
    pub payload: ControlPayload,
}

impl ControlEvent {
    /// Creates an event stamped with the given monotonic seconds.
    pub fn new(ts: f64, payload: ControlPayload) -> Self {
        Self { ts, payload }
    }

    /// Validates fields serde cannot express (finite timestamp).
    pub fn validate(&self) -> RidgecastResult<()> {
        if !self.ts.is_finite() {
            return Err(RidgecastError::InvalidEvent(format!(
                "non-finite ts for {}",
                self.payload.kind()
            )));
        }
        Ok(())
    }
}

/// Zero-retention event fan-out plus the station drain flag.
pub struct EventHub {
    tx: broadcast::Sender<ControlEvent>,
    station_shutting_down: AtomicBool,
    invalid_count: AtomicU64,
}

impl EventHub {
    /// Creates a hub with the standard channel capacity.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            station_shutting_down: AtomicBool::new(false),
            invalid_count: AtomicU64::new(0),
        }
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }

    /// Publishes a validated event to connected peers.
    ///
    /// Flips the drain flag on the lifecycle kinds. Returns the number of
    /// peers the event reached; zero is normal (events are droppable).
    pub fn publish(&self, event: ControlEvent) -> usize {
        match event.payload {
            ControlPayload::StationShuttingDown => {
                self.station_shutting_down.store(true, Ordering::SeqCst);
            }
            ControlPayload::StationStartingUp => {
                self.station_shutting_down.store(false, Ordering::SeqCst);
            }
            _ => {}
        }
        log::debug!("[Events] {} ts={}", event.payload.kind(), event.ts);
        self.tx.send(event).unwrap_or(0)
    }

    /// Parses, validates, and publishes a JSON event from the wire.
    ///
    /// Invalid events are counted and rejected; callers close the peer with
    /// a policy violation.
    pub fn ingest_json(&self, text: &str) -> RidgecastResult<ControlEvent> {
        let event: ControlEvent = serde_json::from_str(text).map_err(|e| {
            self.invalid_count.fetch_add(1, Ordering::Relaxed);
            RidgecastError::InvalidEvent(e.to_string())
        })?;
        if let Err(e) = event.validate() {
            self.invalid_count.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.publish(event.clone());
        Ok(event)
    }

    /// True between a `station_shutting_down` and the next
    /// `station_starting_up`.
    pub fn is_station_shutting_down(&self) -> bool {
        self.station_shutting_down.load(Ordering::SeqCst)
    }

    /// Number of events rejected at the boundary since startup.
    pub fn invalid_count(&self) -> u64 {
        self.invalid_count.load(Ordering::Relaxed)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
