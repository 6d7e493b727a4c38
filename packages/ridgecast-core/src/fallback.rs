//! On-demand fallback frame synthesis.
//!
//! The generator is the terminal fallback of the pipeline: when no live
//! frame exists, it must produce one without I/O, without failing, and
//! without blocking. Silence frames come from the shared cache; tone
//! frames are synthesized into a reusable buffer.

use bytes::{Bytes, BytesMut};
use serde::Deserialize;

use crate::audio::FrameFormat;
use crate::protocol_constants::FRAME_BYTES;

/// Frequency of the fallback tone (concert A).
const TONE_FREQUENCY_HZ: f64 = 440.0;

/// Tone amplitude as a fraction of i16 full scale.
const TONE_AMPLITUDE: f64 = 0.8;

/// What the tower emits when no live PCM is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// Digital silence (all-zero frames).
    #[default]
    Silence,
    /// A 440Hz sine at 80% amplitude, phase-continuous across frames.
    Tone,
}

impl std::str::FromStr for FallbackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "silence" => Ok(Self::Silence),
            "tone" => Ok(Self::Tone),
            other => Err(format!("unknown fallback mode: {other}")),
        }
    }
}

/// Produces fallback frames on demand.
///
/// Holds only a phase accumulator and a reusable scratch buffer;
/// `next_frame()` is pure apart from the phase advance.
pub struct FallbackGenerator {
    mode: FallbackMode,
    format: FrameFormat,
    /// Tone phase in radians, carried across frames so segment-length
    /// outages don't click at frame boundaries.
    phase: f64,
    scratch: BytesMut,
}

impl FallbackGenerator {
    /// Creates a generator in the given mode.
    pub fn new(mode: FallbackMode) -> Self {
        Self {
            mode,
            format: FrameFormat::default(),
            phase: 0.0,
            scratch: BytesMut::with_capacity(FRAME_BYTES),
        }
    }

    /// Returns the configured mode.
    pub fn mode(&self) -> FallbackMode {
        self.mode
    }

    /// Synthesizes the next fallback frame.
    pub fn next_frame(&mut self) -> Bytes {
        match self.mode {
            FallbackMode::Silence => self.format.silence(),
            FallbackMode::Tone => self.tone_frame(),
        }
    }

    fn tone_frame(&mut self) -> Bytes {
        let phase_step =
            std::f64::consts::TAU * TONE_FREQUENCY_HZ / self.format.sample_rate as f64;
        let amplitude = TONE_AMPLITUDE * i16::MAX as f64;

        self.scratch.clear();
        self.scratch.reserve(FRAME_BYTES);

        for _ in 0..self.format.samples_per_frame {
            let sample = (self.phase.sin() * amplitude) as i16;
            let le = sample.to_le_bytes();
            // Same sample on both channels
            self.scratch.extend_from_slice(&le);
            self.scratch.extend_from_slice(&le);
            self.phase += phase_step;
        }
        // Keep the accumulator bounded without disturbing continuity
        if self.phase >= std::f64::consts::TAU {
            self.phase -= std::f64::consts::TAU * (self.phase / std::f64::consts::TAU).floor();
        }

        self.scratch.split().freeze()
    }
}
