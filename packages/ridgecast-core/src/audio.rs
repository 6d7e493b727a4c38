//! PCM frame utilities.
//!
//! The whole pipeline moves identical-size s16le stereo frames; this module
//! holds the byte math, the shared silence frame cache, and the 16-bit
//! sample utilities (gain) used on the hot path.

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::protocol_constants::{
    BYTES_PER_SAMPLE, CHANNELS, FRAME_BYTES, FRAME_SAMPLES, SAMPLE_RATE,
};

// ─────────────────────────────────────────────────────────────────────────────
// Silence Frame Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Global cache for silence frames to avoid repeated allocations.
///
/// Silence frames are keyed by their byte length. The cache is lazily
/// initialized and never cleared (silence frames are small and finite).
static SILENCE_CACHE: OnceLock<RwLock<HashMap<usize, Bytes>>> = OnceLock::new();

/// Gets a cached silence frame of the given byte length, or creates and caches one.
///
/// Fallback paths can emit ~190KB/s of silence during a station outage;
/// reusing one buffer keeps that allocation-free. The `Bytes::clone()` is
/// O(1) (Arc bump).
pub fn silence_frame(byte_len: usize) -> Bytes {
    let cache = SILENCE_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Some(silence) = cache.read().get(&byte_len) {
        return silence.clone();
    }

    let mut cache_write = cache.write();
    // Double-check after acquiring write lock (another thread may have inserted)
    if let Some(silence) = cache_write.get(&byte_len) {
        return silence.clone();
    }

    let silence = Bytes::from(vec![0u8; byte_len]);
    cache_write.insert(byte_len, silence.clone());
    silence
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame Format
// ─────────────────────────────────────────────────────────────────────────────

/// PCM frame format for the station/tower transport.
///
/// Everything in this crate speaks exactly one format (s16le, 48kHz,
/// stereo, 1152 samples per frame); this type exists so the geometry lives
/// in one place instead of scattered arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_frame: usize,
}

impl FrameFormat {
    /// Returns the size of one frame in bytes.
    #[inline]
    pub const fn frame_bytes(&self) -> usize {
        self.samples_per_frame * self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Returns a silence frame of exactly one frame length.
    pub fn silence(&self) -> Bytes {
        silence_frame(self.frame_bytes())
    }

    /// Returns true if `data` is exactly one frame long.
    #[inline]
    pub fn is_frame_sized(&self, data: &[u8]) -> bool {
        data.len() == self.frame_bytes()
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            samples_per_frame: FRAME_SAMPLES,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// 16-bit Sample Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Applies a gain multiplier to a 16-bit PCM buffer in place.
///
/// The multiplier is clamped to [0, 1] upstream when the segment intent
/// is constructed; results are clamped to the i16 range regardless, so
/// the function stays total over any input. Callers skip the call
/// entirely for unity gain; the check here is a second guard.
pub fn apply_gain(data: &mut [u8], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }

    for pair in data.chunks_exact_mut(BYTES_PER_SAMPLE) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        let scaled = (sample as f32 * gain)
            .round()
            .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        pair.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// Zero-pads a partial frame up to the full frame size.
///
/// Used when a decoder hits EOF mid-frame; the trailing samples become
/// digital silence so the frame stays wire-legal.
pub fn zero_pad_frame(partial: &[u8]) -> Bytes {
    debug_assert!(partial.len() < FRAME_BYTES);
    let mut frame = vec![0u8; FRAME_BYTES];
    frame[..partial.len()].copy_from_slice(partial);
    Bytes::from(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_format_matches_wire_contract() {
        let format = FrameFormat::default();
        assert_eq!(format.frame_bytes(), FRAME_BYTES);
        assert_eq!(format.frame_bytes(), 4608);
    }

    #[test]
    fn silence_frame_is_all_zeros() {
        let silence = FrameFormat::default().silence();
        assert_eq!(silence.len(), FRAME_BYTES);
        assert!(silence.iter().all(|&b| b == 0));
    }

    #[test]
    fn silence_frames_share_storage() {
        let a = silence_frame(FRAME_BYTES);
        let b = silence_frame(FRAME_BYTES);
        // Same cached allocation, not a fresh buffer per call
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn unity_gain_is_identity() {
        let mut data = Vec::new();
        for sample in [-32768i16, -1, 0, 1, 12345, 32767] {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        let original = data.clone();
        apply_gain(&mut data, 1.0);
        assert_eq!(data, original);
    }

    fn samples_of(data: &[u8]) -> Vec<i16> {
        data.chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    #[test]
    fn gain_scales_samples() {
        let mut data = Vec::new();
        data.extend_from_slice(&10000i16.to_le_bytes());
        data.extend_from_slice(&(-10000i16).to_le_bytes());
        apply_gain(&mut data, 0.5);
        assert_eq!(samples_of(&data), vec![5000, -5000]);
    }

    #[test]
    fn zero_gain_silences() {
        let mut data = Vec::new();
        data.extend_from_slice(&30000i16.to_le_bytes());
        data.extend_from_slice(&(-30000i16).to_le_bytes());
        apply_gain(&mut data, 0.0);
        assert_eq!(samples_of(&data), vec![0, 0]);
    }

    #[test]
    fn full_scale_samples_survive_unity_boundary_gain() {
        // The i16 extremes stay in range across the whole legal [0, 1]
        // multiplier span
        let mut data = Vec::new();
        data.extend_from_slice(&i16::MAX.to_le_bytes());
        data.extend_from_slice(&i16::MIN.to_le_bytes());
        apply_gain(&mut data, 0.999_999);
        let samples = samples_of(&data);
        assert!(samples[0] <= i16::MAX && samples[0] > 30000);
        assert!(samples[1] >= i16::MIN && samples[1] < -30000);
    }

    #[test]
    fn zero_pad_fills_to_frame_size() {
        let partial = vec![0xAB; 100];
        let frame = zero_pad_frame(&partial);
        assert_eq!(frame.len(), FRAME_BYTES);
        assert!(frame[..100].iter().all(|&b| b == 0xAB));
        assert!(frame[100..].iter().all(|&b| b == 0));
    }
}
