//! Bounded PCM frame ring shared between ingress and the audio pump.
//!
//! One producer (PCM ingress) pushes, one consumer (the pump, on the clock
//! thread) pops. The ring never blocks the producer: at capacity the oldest
//! frame is evicted and the overflow counter bumps. The consumer blocks
//! cooperatively with a timeout so a tick is never held hostage.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

/// Result of pushing a frame into the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame stored without evicting anything.
    Accepted,
    /// Frame stored, oldest frame evicted to make room.
    Overflowed,
}

/// Read-only view of the ring, served verbatim by `GET /tower/buffer`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct BufferSnapshot {
    pub capacity: usize,
    pub count: usize,
    pub overflow_count: u64,
    pub ratio: f64,
}

struct RingInner {
    frames: VecDeque<Bytes>,
    overflow_count: u64,
}

/// Fixed-capacity frame FIFO with drop-oldest overflow.
///
/// All operations serialize under a single mutex; none of them touch I/O
/// while holding it.
pub struct FrameRing {
    capacity: usize,
    inner: Mutex<RingInner>,
    available: Condvar,
}

impl FrameRing {
    /// Creates a ring holding at most `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; the runtime validates configuration
    /// before construction.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be >= 1");
        Self {
            capacity,
            inner: Mutex::new(RingInner {
                frames: VecDeque::with_capacity(capacity),
                overflow_count: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Returns the configured capacity in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes a frame, evicting the oldest when full.
    pub fn push(&self, frame: Bytes) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            let outcome = if inner.frames.len() >= self.capacity {
                inner.frames.pop_front();
                inner.overflow_count += 1;
                PushOutcome::Overflowed
            } else {
                PushOutcome::Accepted
            };
            inner.frames.push_back(frame);
            outcome
        };
        self.available.notify_one();
        outcome
    }

    /// Pops the oldest frame, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout. Used by the pump with a timeout well
    /// under the tick period.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(frame) = inner.frames.pop_front() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if self
                .available
                .wait_for(&mut inner, deadline - now)
                .timed_out()
            {
                return inner.frames.pop_front();
            }
        }
    }

    /// Pops the oldest frame without waiting.
    pub fn try_pop(&self) -> Option<Bytes> {
        self.inner.lock().frames.pop_front()
    }

    /// Returns a point-in-time view of the ring.
    pub fn snapshot(&self) -> BufferSnapshot {
        let inner = self.inner.lock();
        BufferSnapshot {
            capacity: self.capacity,
            count: inner.frames.len(),
            overflow_count: inner.overflow_count,
            ratio: inner.frames.len() as f64 / self.capacity as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 16])
    }

    #[test]
    fn frames_come_back_in_order_and_intact() {
        let ring = FrameRing::new(8);
        for tag in 0..5u8 {
            assert_eq!(ring.push(frame(tag)), PushOutcome::Accepted);
        }
        for tag in 0..5u8 {
            let popped = ring.pop_timeout(Duration::from_millis(1)).unwrap();
            assert_eq!(popped, frame(tag));
        }
        assert_eq!(ring.snapshot().overflow_count, 0);
    }

    #[test]
    fn push_at_capacity_drops_oldest() {
        let ring = FrameRing::new(3);
        for tag in 0..3u8 {
            ring.push(frame(tag));
        }
        assert_eq!(ring.push(frame(3)), PushOutcome::Overflowed);

        let snapshot = ring.snapshot();
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.overflow_count, 1);

        // Oldest (0) gone; 1, 2, 3 remain in order
        assert_eq!(ring.try_pop().unwrap(), frame(1));
        assert_eq!(ring.try_pop().unwrap(), frame(2));
        assert_eq!(ring.try_pop().unwrap(), frame(3));
    }

    #[test]
    fn overflow_count_is_monotonic() {
        let ring = FrameRing::new(1);
        ring.push(frame(0));
        let mut last = 0;
        for tag in 1..10u8 {
            ring.push(frame(tag));
            let count = ring.snapshot().overflow_count;
            assert!(count > last);
            last = count;
        }
        assert_eq!(last, 9);
    }

    #[test]
    fn pop_times_out_on_empty_ring() {
        let ring = FrameRing::new(4);
        let start = Instant::now();
        assert!(ring.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn pop_wakes_on_concurrent_push() {
        let ring = Arc::new(FrameRing::new(4));
        let pusher = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                ring.push(frame(7));
            })
        };
        let popped = ring.pop_timeout(Duration::from_secs(1));
        pusher.join().unwrap();
        assert_eq!(popped.unwrap(), frame(7));
    }

    #[test]
    fn snapshot_ratio_tracks_count() {
        let ring = FrameRing::new(4);
        assert_eq!(ring.snapshot().ratio, 0.0);
        ring.push(frame(0));
        ring.push(frame(1));
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.ratio, snapshot.count as f64 / snapshot.capacity as f64);
        assert_eq!(snapshot.ratio, 0.5);
    }
}
