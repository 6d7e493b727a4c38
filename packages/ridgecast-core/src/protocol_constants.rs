//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the PCM frame geometry and the MP3 encoder
//! contract; changing them would break the station/tower wire format.

use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Frame Geometry
// ─────────────────────────────────────────────────────────────────────────────

/// Audio sample rate (Hz).
///
/// 48kHz is the standard for digital broadcast audio.
pub const SAMPLE_RATE: u32 = 48_000;

/// Number of audio channels (stereo).
pub const CHANNELS: u16 = 2;

/// Bytes per sample (signed 16-bit little-endian).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Samples per channel in one frame.
///
/// 1152 matches the MP3 frame size (`-frame_size 1152` on the encoder),
/// so one PCM frame maps to exactly one MP3 frame.
pub const FRAME_SAMPLES: usize = 1152;

/// One PCM frame in bytes: 1152 samples × 2 channels × 2 bytes = 4608.
///
/// Frames are opaque, identical-size byte blocks across all buffers and
/// transports. No header, no framing markers.
pub const FRAME_BYTES: usize = FRAME_SAMPLES * CHANNELS as usize * BYTES_PER_SAMPLE;

/// Duration of one frame, derived from the geometry (24ms exactly).
///
/// Both clocks pace off this value; it is never hard-coded elsewhere.
pub const FRAME_DURATION: Duration =
    Duration::from_nanos(FRAME_SAMPLES as u64 * 1_000_000_000 / SAMPLE_RATE as u64);

// ─────────────────────────────────────────────────────────────────────────────
// Tower Limits
// ─────────────────────────────────────────────────────────────────────────────

/// Default ring buffer capacity in frames (~5 seconds of audio).
pub const DEFAULT_BUFFER_CAPACITY: usize = 234;

/// Default per-listener pending byte cap (64 KiB).
///
/// A listener whose pending bytes would exceed this is dropped rather than
/// buffered indefinitely.
pub const DEFAULT_CLIENT_BUFFER_BYTES: usize = 64 * 1024;

/// Default per-listener write stall timeout (ms).
pub const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 5_000;

/// Default underrun grace window after startup, station connect, or a
/// station_shutting_down event (seconds).
pub const DEFAULT_ENCODER_GRACE_SECS: u64 = 5;

/// Encoder-internal PCM queue capacity in frames (~1 second of audio).
///
/// Frames pushed while the queue is full are dropped and counted.
pub const ENCODER_QUEUE_FRAMES: usize = 47;

/// Initial delay before respawning a crashed ffmpeg child.
pub const FFMPEG_RESTART_BACKOFF_INITIAL: Duration = Duration::from_millis(250);

/// Backoff cap for ffmpeg respawns.
pub const FFMPEG_RESTART_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL when stopping ffmpeg.
pub const FFMPEG_TERM_GRACE: Duration = Duration::from_secs(2);

/// Writing a frame to ffmpeg stdin blocking past this means the child is
/// wedged and must be restarted.
pub const FFMPEG_STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// MP3 bitrate handed to the encoder.
pub const MP3_BITRATE: &str = "128k";

// ─────────────────────────────────────────────────────────────────────────────
// Control Plane
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of the control event broadcast channel.
///
/// Events are delivered only to currently connected peers; a full channel
/// lags slow peers rather than blocking the sender.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the segment lifecycle event channel (station side).
pub const SEGMENT_EVENT_CAPACITY: usize = 32;

// ─────────────────────────────────────────────────────────────────────────────
// Station Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// A decoder producing no bytes for this long is considered stuck (2 ticks).
pub const DECODER_STALL_TIMEOUT: Duration =
    Duration::from_nanos(2 * FRAME_DURATION.as_nanos() as u64);

/// Lead time before a segment's projected end at which the prep event fires.
pub const DEFAULT_PREP_LEAD: Duration = Duration::from_secs(15);

/// Initial delay before reconnecting the PCM feed or event client.
pub const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(250);

/// Backoff cap for station-side reconnects.
pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Default PID buffer poll interval.
pub const PID_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Default PID buffer query timeout.
pub const PID_QUERY_TIMEOUT: Duration = Duration::from_millis(100);

/// Integral windup limit for the buffer PID controller.
pub const PID_INTEGRAL_WINDUP_LIMIT: f64 = 10.0;

/// Consecutive buffer query failures before the PID integral resets.
pub const PID_FAILURE_RESET_THRESHOLD: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_is_4608() {
        assert_eq!(FRAME_BYTES, 4608);
    }

    #[test]
    fn frame_duration_derives_from_geometry() {
        // 1152 samples at 48kHz = 24ms exactly
        assert_eq!(FRAME_DURATION, Duration::from_millis(24));
    }

    #[test]
    fn encoder_queue_holds_about_one_second() {
        let queued = FRAME_DURATION * ENCODER_QUEUE_FRAMES as u32;
        assert!(queued >= Duration::from_millis(900) && queued <= Duration::from_millis(1200));
    }
}
