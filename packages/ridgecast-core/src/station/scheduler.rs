//! Segment intent queue and lifecycle bookkeeping.
//!
//! Content logic enqueues [`AudioEvent`]s; the playout engine asks the
//! scheduler for the next one and reports decode progress back. The
//! scheduler is the only mutator of segment phase, and it publishes
//! lifecycle events (started, prep, finished, failed) for the content
//! layer: picking the next intent during the prep window, logging play
//! history, and so on.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::protocol_constants::SEGMENT_EVENT_CAPACITY;

/// What kind of audio a segment is.
///
/// `Talk` plays exactly like `Song` in this engine; the distinction only
/// changes which control event the station announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Song,
    Intro,
    Outro,
    Id,
    Talk,
}

impl SegmentKind {
    /// True for spoken (non-music) segments.
    pub fn is_spoken(&self) -> bool {
        matches!(self, Self::Talk | Self::Id)
    }
}

/// One segment intent: a concrete file, how to play it.
///
/// Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioEvent {
    pub path: PathBuf,
    pub kind: SegmentKind,
    /// Gain multiplier in [0, 1]; 1.0 plays the file as decoded.
    /// Out-of-range and non-finite values are clamped at construction.
    #[serde(default = "default_gain", deserialize_with = "deserialize_gain")]
    pub gain: f32,
}

fn default_gain() -> f32 {
    1.0
}

/// Clamps a gain multiplier into [0, 1] at the ingestion boundary, the
/// way the PID side clamps the buffer ratio. Non-finite values fall back
/// to unity.
fn clamp_gain(gain: f32) -> f32 {
    if gain.is_finite() {
        gain.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

fn deserialize_gain<'de, D>(deserializer: D) -> Result<f32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    f32::deserialize(deserializer).map(clamp_gain)
}

impl AudioEvent {
    /// Creates an intent with the gain clamped to [0, 1].
    pub fn new(path: impl Into<PathBuf>, kind: SegmentKind, gain: f32) -> Self {
        Self {
            path: path.into(),
            kind,
            gain: clamp_gain(gain),
        }
    }

    pub fn song(path: impl Into<PathBuf>) -> Self {
        Self::new(path, SegmentKind::Song, 1.0)
    }
}

/// Where a segment is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPhase {
    Pending,
    Decoding,
    Finishing,
    Done,
    Failed,
}

/// Per-segment bookkeeping; owned and mutated only by the scheduler.
#[derive(Debug)]
pub struct SegmentState {
    pub event: AudioEvent,
    pub phase: SegmentPhase,
    pub bytes_emitted: u64,
    pub wallclock_start: Instant,
    pub wallclock_end: Option<Instant>,
    /// Projected end from the duration probe; absent when the probe failed.
    pub projected_end: Option<Instant>,
    prep_sent: bool,
}

/// Lifecycle notifications for the content layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    /// A segment began decoding.
    Started { kind: SegmentKind, path: PathBuf },
    /// The segment is inside its prep window; choose the next intent now.
    Prep { path: PathBuf },
    /// The segment decoded to EOF.
    Finished { path: PathBuf, bytes_emitted: u64 },
    /// The segment was abandoned.
    Failed { path: PathBuf, reason: String },
}

/// Intent queue plus the segment state machine.
pub struct SegmentScheduler {
    queue: Mutex<VecDeque<AudioEvent>>,
    current: Mutex<Option<SegmentState>>,
    events_tx: broadcast::Sender<SegmentEvent>,
    accepting: AtomicBool,
    prep_lead: Duration,
}

impl SegmentScheduler {
    pub fn new(prep_lead: Duration) -> Self {
        let (events_tx, _) = broadcast::channel(SEGMENT_EVENT_CAPACITY);
        Self {
            queue: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            events_tx,
            accepting: AtomicBool::new(true),
            prep_lead,
        }
    }

    /// Subscribes to lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SegmentEvent> {
        self.events_tx.subscribe()
    }

    /// Enqueues an intent; refused once draining has begun.
    pub fn enqueue(&self, event: AudioEvent) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            log::debug!("[Scheduler] draining, refused {}", event.path.display());
            return false;
        }
        log::debug!(
            "[Scheduler] queued {:?} {}",
            event.kind,
            event.path.display()
        );
        self.queue.lock().push_back(event);
        true
    }

    /// Number of queued intents.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Stops accepting new intents (drain step one).
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Whether new intents are still accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Pops the next intent in enqueue order.
    pub fn pop_next(&self) -> Option<AudioEvent> {
        self.queue.lock().pop_front()
    }

    /// PENDING → DECODING: a decoder was spawned for `event`.
    pub fn begin(&self, event: AudioEvent, projected_duration: Option<Duration>) {
        let now = Instant::now();
        let state = SegmentState {
            phase: SegmentPhase::Decoding,
            bytes_emitted: 0,
            wallclock_start: now,
            wallclock_end: None,
            projected_end: projected_duration.map(|d| now + d),
            prep_sent: false,
            event,
        };
        let started = SegmentEvent::Started {
            kind: state.event.kind,
            path: state.event.path.clone(),
        };
        *self.current.lock() = Some(state);
        let _ = self.events_tx.send(started);
    }

    /// Accounts one emitted frame and fires the prep event when the
    /// segment crosses into its prep window.
    pub fn note_frame(&self, bytes: usize) {
        let mut current = self.current.lock();
        let Some(state) = current.as_mut() else {
            return;
        };
        state.bytes_emitted += bytes as u64;

        if !state.prep_sent {
            let due = state
                .projected_end
                .is_some_and(|end| Instant::now() + self.prep_lead >= end);
            if due {
                state.prep_sent = true;
                let _ = self.events_tx.send(SegmentEvent::Prep {
                    path: state.event.path.clone(),
                });
            }
        }
    }

    /// DECODING → FINISHING: the decoder hit EOF; the partial frame has
    /// been flushed.
    pub fn finish_decoding(&self) {
        let mut current = self.current.lock();
        let Some(state) = current.as_mut() else {
            return;
        };
        state.phase = SegmentPhase::Finishing;

        // A segment whose probe failed still gets its prep signal, just
        // late: at EOF instead of ahead of it
        if !state.prep_sent {
            state.prep_sent = true;
            let _ = self.events_tx.send(SegmentEvent::Prep {
                path: state.event.path.clone(),
            });
        }
        let _ = self.events_tx.send(SegmentEvent::Finished {
            path: state.event.path.clone(),
            bytes_emitted: state.bytes_emitted,
        });
    }

    /// FINISHING → DONE: the final frame is on the wire.
    pub fn complete(&self) -> Option<SegmentState> {
        let mut current = self.current.lock();
        let mut state = current.take()?;
        let ended = Instant::now();
        state.phase = SegmentPhase::Done;
        state.wallclock_end = Some(ended);
        log::info!(
            "[Scheduler] segment done: {} ({} bytes in {:?})",
            state.event.path.display(),
            state.bytes_emitted,
            ended - state.wallclock_start
        );
        Some(state)
    }

    /// any → FAILED: decoder spawn failure, instant EOF, or stall.
    pub fn fail(&self, reason: &str) -> Option<SegmentState> {
        let mut current = self.current.lock();
        let mut state = current.take()?;
        state.phase = SegmentPhase::Failed;
        state.wallclock_end = Some(Instant::now());
        log::warn!(
            "[Scheduler] segment failed: {}: {reason}",
            state.event.path.display()
        );
        let _ = self.events_tx.send(SegmentEvent::Failed {
            path: state.event.path.clone(),
            reason: reason.to_string(),
        });
        Some(state)
    }

    /// Whether a segment is currently playing.
    pub fn has_current(&self) -> bool {
        self.current.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> SegmentScheduler {
        SegmentScheduler::new(Duration::from_secs(15))
    }

    #[test]
    fn intents_pop_in_enqueue_order() {
        let s = scheduler();
        s.enqueue(AudioEvent::song("/music/a.mp3"));
        s.enqueue(AudioEvent::song("/music/b.mp3"));
        s.enqueue(AudioEvent::song("/music/c.mp3"));

        assert_eq!(s.pop_next().unwrap().path, PathBuf::from("/music/a.mp3"));
        assert_eq!(s.pop_next().unwrap().path, PathBuf::from("/music/b.mp3"));
        assert_eq!(s.pop_next().unwrap().path, PathBuf::from("/music/c.mp3"));
        assert!(s.pop_next().is_none());
    }

    #[test]
    fn draining_refuses_new_intents() {
        let s = scheduler();
        s.stop_accepting();
        assert!(!s.enqueue(AudioEvent::song("/music/late.mp3")));
        assert_eq!(s.queue_len(), 0);
    }

    #[test]
    fn lifecycle_walks_the_phase_table() {
        let s = scheduler();
        let mut rx = s.subscribe();

        s.begin(AudioEvent::song("/music/a.mp3"), Some(Duration::from_secs(180)));
        assert!(s.has_current());
        assert!(matches!(
            rx.try_recv().unwrap(),
            SegmentEvent::Started {
                kind: SegmentKind::Song,
                ..
            }
        ));

        s.note_frame(4608);
        s.note_frame(4608);
        s.finish_decoding();
        let finished = rx.try_recv().unwrap();
        assert_eq!(
            finished,
            SegmentEvent::Finished {
                path: PathBuf::from("/music/a.mp3"),
                bytes_emitted: 9216,
            }
        );

        let done = s.complete().unwrap();
        assert_eq!(done.phase, SegmentPhase::Done);
        assert!(done.wallclock_end.is_some());
        assert!(!s.has_current());
    }

    #[test]
    fn prep_fires_once_inside_the_window() {
        // Projected end 10s out, prep lead 15s: due immediately
        let s = SegmentScheduler::new(Duration::from_secs(15));
        let mut rx = s.subscribe();

        s.begin(AudioEvent::song("/music/a.mp3"), Some(Duration::from_secs(10)));
        let _ = rx.try_recv(); // Started

        s.note_frame(4608);
        assert!(matches!(rx.try_recv().unwrap(), SegmentEvent::Prep { .. }));

        // Only once
        s.note_frame(4608);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn prep_waits_outside_the_window() {
        // Projected end far out: prep not yet due
        let s = SegmentScheduler::new(Duration::from_secs(15));
        let mut rx = s.subscribe();

        s.begin(AudioEvent::song("/music/a.mp3"), Some(Duration::from_secs(600)));
        let _ = rx.try_recv(); // Started

        s.note_frame(4608);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failed_probe_degrades_prep_to_eof() {
        let s = scheduler();
        let mut rx = s.subscribe();

        s.begin(AudioEvent::song("/music/a.mp3"), None);
        let _ = rx.try_recv(); // Started
        s.note_frame(4608);
        assert!(rx.try_recv().is_err(), "no prep without a projection");

        s.finish_decoding();
        assert!(matches!(rx.try_recv().unwrap(), SegmentEvent::Prep { .. }));
        assert!(matches!(rx.try_recv().unwrap(), SegmentEvent::Finished { .. }));
    }

    #[test]
    fn failure_clears_the_current_segment() {
        let s = scheduler();
        let mut rx = s.subscribe();

        s.begin(AudioEvent::song("/music/broken.mp3"), None);
        let _ = rx.try_recv();

        let failed = s.fail("decoder produced no bytes").unwrap();
        assert_eq!(failed.phase, SegmentPhase::Failed);
        assert!(!s.has_current());
        assert!(matches!(rx.try_recv().unwrap(), SegmentEvent::Failed { .. }));
    }

    #[test]
    fn audio_event_gain_defaults_to_unity() {
        let event: AudioEvent =
            serde_json::from_str(r#"{"path":"/music/a.mp3","kind":"song"}"#).unwrap();
        assert_eq!(event.gain, 1.0);
        assert_eq!(event.kind, SegmentKind::Song);
    }

    #[test]
    fn out_of_range_gain_is_clamped_on_deserialize() {
        let hot: AudioEvent =
            serde_json::from_str(r#"{"path":"/music/a.mp3","kind":"song","gain":2.5}"#).unwrap();
        assert_eq!(hot.gain, 1.0);

        let negative: AudioEvent =
            serde_json::from_str(r#"{"path":"/music/a.mp3","kind":"song","gain":-0.5}"#).unwrap();
        assert_eq!(negative.gain, 0.0);

        let in_range: AudioEvent =
            serde_json::from_str(r#"{"path":"/music/a.mp3","kind":"song","gain":0.7}"#).unwrap();
        assert_eq!(in_range.gain, 0.7);
    }

    #[test]
    fn constructor_clamps_gain_too() {
        assert_eq!(
            AudioEvent::new("/music/a.mp3", SegmentKind::Song, 3.0).gain,
            1.0
        );
        assert_eq!(
            AudioEvent::new("/music/a.mp3", SegmentKind::Song, -1.0).gain,
            0.0
        );
        assert_eq!(
            AudioEvent::new("/music/a.mp3", SegmentKind::Talk, f32::NAN).gain,
            1.0
        );
    }
}
