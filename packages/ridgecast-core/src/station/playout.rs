//! Decode pacing loop (Clock A).
//!
//! Turns the scheduler's segment intents into a continuous, real-time
//! paced PCM stream toward the tower. The loop holds one absolute
//! deadline across segments and idle gaps: every frame advances it by
//! `period + pid_adjustment`, it is never reset to now after the first
//! frame, and a late iteration skips its sleep instead of bursting.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audio::apply_gain;
use crate::fallback::{FallbackGenerator, FallbackMode};
use crate::protocol_constants::FRAME_DURATION;
use crate::station::decoder::{probe_duration, SegmentDecoder};
use crate::station::feed::PcmFeed;
use crate::station::pid::BufferPid;
use crate::station::scheduler::{AudioEvent, SegmentScheduler};

/// The station's decode-and-feed loop.
pub struct PlayoutEngine {
    scheduler: Arc<SegmentScheduler>,
    feed: PcmFeed,
    pid: Arc<BufferPid>,
    /// Covers gaps between segments; always silence on the station side.
    idle_fill: FallbackGenerator,
    drain: CancellationToken,
    next_deadline: Instant,
    started: bool,
}

impl PlayoutEngine {
    pub fn new(
        scheduler: Arc<SegmentScheduler>,
        feed: PcmFeed,
        pid: Arc<BufferPid>,
        drain: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            feed,
            pid,
            idle_fill: FallbackGenerator::new(FallbackMode::Silence),
            drain,
            next_deadline: Instant::now() + FRAME_DURATION,
            started: false,
        }
    }

    /// Runs until drain is requested and the current segment has finished.
    ///
    /// Draining stops new segments from starting; the one in flight plays
    /// to its end.
    pub async fn run(mut self) {
        log::info!("[Playout] engine started");

        loop {
            if self.drain.is_cancelled() {
                break;
            }
            match self.scheduler.pop_next() {
                Some(event) => self.play_segment(event).await,
                None => {
                    // Nothing queued: keep the cadence with local silence
                    let frame = self.idle_fill.next_frame();
                    self.feed.send(&frame).await;
                    self.pace().await;
                }
            }
        }

        log::info!(
            "[Playout] engine drained ({} frames sent, {} dropped)",
            self.feed.frames_sent(),
            self.feed.frames_dropped()
        );
    }

    /// Plays one segment start to finish, walking the phase table.
    async fn play_segment(&mut self, event: AudioEvent) {
        let projected = probe_duration(&event.path).await;
        if projected.is_none() {
            log::debug!(
                "[Playout] duration probe failed for {}, prep degrades to EOF",
                event.path.display()
            );
        }

        let gain = event.gain;
        let path = event.path.clone();
        self.scheduler.begin(event, projected);

        let mut decoder = match SegmentDecoder::spawn(&path).await {
            Ok(decoder) => decoder,
            Err(e) => {
                // Spawn failure: skip to the next intent
                self.scheduler.fail(&e.to_string());
                return;
            }
        };

        let mut emitted_any = false;
        loop {
            match decoder.read_frame().await {
                Ok(Some(frame)) => {
                    emitted_any = true;
                    let frame = if (gain - 1.0).abs() < f32::EPSILON {
                        frame
                    } else {
                        let mut scaled = frame.to_vec();
                        apply_gain(&mut scaled, gain);
                        scaled.into()
                    };
                    self.feed.send(&frame).await;
                    self.scheduler.note_frame(frame.len());
                    self.pace().await;
                }
                Ok(None) => {
                    if emitted_any {
                        self.scheduler.finish_decoding();
                        self.scheduler.complete();
                    } else {
                        // EOF before any bytes: a broken or empty file
                        self.scheduler.fail("decoder produced no output");
                    }
                    break;
                }
                Err(e) => {
                    self.scheduler.fail(&e.to_string());
                    break;
                }
            }
        }
        decoder.close().await;
    }

    /// Advances the absolute deadline and sleeps up to it.
    async fn pace(&mut self) {
        let adjustment = self.pid.adjustment();
        let step = if adjustment >= 0.0 {
            FRAME_DURATION + Duration::from_secs_f64(adjustment)
        } else {
            FRAME_DURATION.saturating_sub(Duration::from_secs_f64(-adjustment))
        };

        if !self.started {
            // First frame anchors the schedule
            self.started = true;
            self.next_deadline = Instant::now() + step;
        } else {
            self.next_deadline += step;
        }

        let now = Instant::now();
        if self.next_deadline > now {
            tokio::time::sleep_until(self.next_deadline).await;
        }
        // Behind schedule: skip the sleep this iteration only; the
        // deadline is never reset, so there is no catch-up burst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_constants::FRAME_BYTES;
    use crate::station::feed::FeedEndpoint;
    use crate::station::pid::PidConfig;
    use std::time::Duration as StdDuration;
    use tokio::io::AsyncReadExt;

    fn engine_parts() -> (Arc<SegmentScheduler>, Arc<BufferPid>, CancellationToken) {
        (
            Arc::new(SegmentScheduler::new(StdDuration::from_secs(15))),
            Arc::new(BufferPid::new(PidConfig::default())),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn idle_engine_feeds_silence_at_cadence() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (scheduler, pid, drain) = engine_parts();

        let engine = PlayoutEngine::new(
            scheduler,
            PcmFeed::new(FeedEndpoint::Tcp(addr)),
            pid,
            drain.clone(),
        );
        let engine_task = tokio::spawn(engine.run());

        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; FRAME_BYTES * 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0), "idle fill must be silence");

        drain.cancel();
        let _ = tokio::time::timeout(StdDuration::from_secs(2), engine_task).await;
    }

    #[tokio::test]
    async fn drain_stops_the_engine() {
        let (scheduler, pid, drain) = engine_parts();
        // Feed pointed at a dead port: frames drop, engine still paces
        let engine = PlayoutEngine::new(
            scheduler,
            PcmFeed::new(FeedEndpoint::Tcp(([127, 0, 0, 1], 1).into())),
            pid,
            drain.clone(),
        );
        let engine_task = tokio::spawn(engine.run());

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        drain.cancel();
        tokio::time::timeout(StdDuration::from_secs(2), engine_task)
            .await
            .expect("engine should drain promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn missing_segment_file_is_failed_and_skipped() {
        let (scheduler, pid, drain) = engine_parts();
        let mut events = scheduler.subscribe();
        scheduler.enqueue(AudioEvent::song("/nonexistent/ghost.mp3"));

        let engine = PlayoutEngine::new(
            Arc::clone(&scheduler),
            PcmFeed::new(FeedEndpoint::Tcp(([127, 0, 0, 1], 1).into())),
            pid,
            drain.clone(),
        );
        let engine_task = tokio::spawn(engine.run());

        // Started then Failed, regardless of whether ffmpeg exists here
        let started = tokio::time::timeout(StdDuration::from_secs(5), events.recv())
            .await
            .expect("segment should start")
            .unwrap();
        assert!(matches!(
            started,
            crate::station::scheduler::SegmentEvent::Started { .. }
        ));
        let failed = tokio::time::timeout(StdDuration::from_secs(5), events.recv())
            .await
            .expect("segment should fail")
            .unwrap();
        assert!(matches!(
            failed,
            crate::station::scheduler::SegmentEvent::Failed { .. }
        ));
        assert!(!scheduler.has_current());

        drain.cancel();
        let _ = tokio::time::timeout(StdDuration::from_secs(2), engine_task).await;
    }
}
