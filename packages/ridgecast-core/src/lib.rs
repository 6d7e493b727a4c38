//! Ridgecast Core - shared library for the Ridgecast radio engine.
//!
//! This crate provides the core functionality for Ridgecast, an internet
//! radio playout and streaming system. Two daemons share it:
//!
//! - The **tower** ingests PCM from the station, paces emission on a
//!   fixed-rate clock, encodes to MP3 through a supervised ffmpeg child,
//!   and fans the stream out to HTTP listeners with per-client
//!   backpressure.
//! - The **station** decodes MP3 segments into a continuous, real-time
//!   paced PCM stream, feeds it to the tower, and announces lifecycle
//!   events over the control plane.
//!
//! # Architecture
//!
//! - [`buffer`]: bounded PCM frame ring between ingress and the pump
//! - [`clock`]: the emission metronome (Clock B)
//! - [`fallback`]: on-demand silence/tone synthesis
//! - [`events`]: control-plane events and the zero-retention hub
//! - [`tower`]: ingest, pump, encoder manager, ffmpeg supervisor, fan-out
//! - [`station`]: scheduler, decoder, playout engine (Clock A), PID loop
//! - [`api`]: the tower's HTTP/WebSocket surface
//! - [`error`]: centralized error types
//!
//! The audio contract: no failure past startup may stop emission. Every
//! layer degrades to fallback frames instead of propagating a fault into
//! the output stream.

#![warn(clippy::all)]

pub mod api;
pub mod audio;
pub mod buffer;
pub mod clock;
pub mod error;
pub mod events;
pub mod fallback;
pub mod protocol_constants;
pub mod station;
pub mod tower;

// Re-export commonly used types at the crate root
pub use audio::FrameFormat;
pub use buffer::{BufferSnapshot, FrameRing, PushOutcome};
pub use clock::MasterClock;
pub use error::{RidgecastError, RidgecastResult};
pub use events::{ControlEvent, ControlPayload, EventHub};
pub use fallback::{FallbackGenerator, FallbackMode};

// Re-export tower types
pub use tower::{
    AudioPump, Broadcaster, BroadcasterConfig, EncoderManager, FfmpegSupervisor, IngressEndpoint,
    PcmIngress, TowerConfig, TowerRuntime,
};

// Re-export station types
pub use station::{
    AudioEvent, BufferPid, EventClient, FeedEndpoint, PcmFeed, PidConfig, PlayoutEngine,
    SegmentEvent, SegmentKind, SegmentScheduler, StationConfig, StationRuntime,
};

// Re-export API types
pub use api::{start_server, AppState};
