//! Live/fallback frame routing in front of the MP3 encoder.
//!
//! The pump hands this manager exactly one frame slot per tick. A live
//! frame is forwarded untouched; an empty slot synthesizes a fallback
//! frame so the encoder never starves. Underruns inside the grace window
//! (startup, fresh station connect, announced drain) stay silent; outside
//! it they log a rate-limited warning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::events::EventHub;
use crate::fallback::FallbackGenerator;

/// Where encoder-bound PCM frames go.
///
/// Implemented by the ffmpeg supervisor's queue handle; tests substitute a
/// collecting fake.
pub trait PcmSink: Send + Sync {
    /// Accepts one frame. Must not block; implementations drop on overflow.
    fn push_frame(&self, frame: Bytes);
}

/// Routes live frames vs fallback frames into the encoder.
pub struct EncoderManager {
    sink: Arc<dyn PcmSink>,
    hub: Arc<EventHub>,
    fallback: Mutex<FallbackGenerator>,
    grace: Duration,
    grace_until: Mutex<Instant>,
    last_underrun_log: Mutex<Option<Instant>>,
    underrun_count: AtomicU64,
    fallback_frames: AtomicU64,
}

impl EncoderManager {
    /// Creates a manager whose grace window starts now.
    pub fn new(
        sink: Arc<dyn PcmSink>,
        hub: Arc<EventHub>,
        fallback: FallbackGenerator,
        grace: Duration,
    ) -> Self {
        Self {
            sink,
            hub,
            fallback: Mutex::new(fallback),
            grace,
            grace_until: Mutex::new(Instant::now() + grace),
            last_underrun_log: Mutex::new(None),
            underrun_count: AtomicU64::new(0),
            fallback_frames: AtomicU64::new(0),
        }
    }

    /// Restarts the grace window after a station connect.
    pub fn mark_station_connected(&self) {
        *self.grace_until.lock() = Instant::now() + self.grace;
        log::info!("[Encoder] station connected, grace window restarted");
    }

    /// Restarts the grace window after an announced drain.
    pub fn mark_station_draining(&self) {
        *self.grace_until.lock() = Instant::now() + self.grace;
        log::debug!("[Encoder] station draining, grace window restarted");
    }

    /// One pump tick: forward the live frame, or cover with fallback.
    pub fn next_frame(&self, live: Option<Bytes>) {
        match live {
            Some(frame) => self.sink.push_frame(frame),
            None => self.fallback_tick(),
        }
    }

    /// Synthesizes and forwards one fallback frame.
    pub fn fallback_tick(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
        self.fallback_frames.fetch_add(1, Ordering::Relaxed);
        self.maybe_warn_underrun();

        let frame = self.fallback.lock().next_frame();
        self.sink.push_frame(frame);
    }

    fn maybe_warn_underrun(&self) {
        if Instant::now() < *self.grace_until.lock() || self.hub.is_station_shutting_down() {
            return;
        }
        // Max one warning per second; the counter carries the total
        let mut last = self.last_underrun_log.lock();
        let now = Instant::now();
        if last.map_or(true, |t| now.duration_since(t) >= Duration::from_secs(1)) {
            log::warn!(
                "[Encoder] underrun: no live PCM, emitting fallback (total={})",
                self.underrun_count.load(Ordering::Relaxed)
            );
            *last = Some(now);
        }
    }

    /// Total ticks covered by fallback since startup.
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Total fallback frames synthesized since startup.
    pub fn fallback_frames(&self) -> u64 {
        self.fallback_frames.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::FallbackMode;
    use crate::protocol_constants::FRAME_BYTES;

    #[derive(Default)]
    struct CollectingSink {
        frames: Mutex<Vec<Bytes>>,
    }

    impl PcmSink for CollectingSink {
        fn push_frame(&self, frame: Bytes) {
            self.frames.lock().push(frame);
        }
    }

    fn manager(sink: Arc<CollectingSink>, grace: Duration) -> EncoderManager {
        EncoderManager::new(
            sink,
            Arc::new(EventHub::new()),
            FallbackGenerator::new(FallbackMode::Silence),
            grace,
        )
    }

    #[test]
    fn live_frames_are_forwarded_untouched() {
        let sink = Arc::new(CollectingSink::default());
        let manager = manager(Arc::clone(&sink), Duration::from_secs(5));

        let frame = Bytes::from(vec![7u8; FRAME_BYTES]);
        manager.next_frame(Some(frame.clone()));

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], frame);
        assert_eq!(manager.fallback_frames(), 0);
    }

    #[test]
    fn empty_slot_synthesizes_fallback() {
        let sink = Arc::new(CollectingSink::default());
        let manager = manager(Arc::clone(&sink), Duration::from_secs(5));

        manager.next_frame(None);
        manager.next_frame(None);

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == FRAME_BYTES));
        assert!(frames.iter().all(|f| f.iter().all(|&b| b == 0)));
        assert_eq!(manager.underrun_count(), 2);
    }

    #[test]
    fn grace_window_restarts_on_connect() {
        let sink = Arc::new(CollectingSink::default());
        let manager = manager(sink, Duration::from_secs(60));

        // Window is active now; a connect pushes it further out
        let before = *manager.grace_until.lock();
        std::thread::sleep(Duration::from_millis(5));
        manager.mark_station_connected();
        assert!(*manager.grace_until.lock() > before);
    }

    #[test]
    fn fallback_always_produces_a_frame() {
        let sink = Arc::new(CollectingSink::default());
        let manager = manager(Arc::clone(&sink), Duration::ZERO);

        for _ in 0..10 {
            manager.fallback_tick();
        }
        assert_eq!(sink.frames.lock().len(), 10);
        assert_eq!(manager.fallback_frames(), 10);
    }
}
