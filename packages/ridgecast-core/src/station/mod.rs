//! Station-side pipeline: segment intents → MP3 decode → paced PCM feed
//! to the tower, with the control-plane client and the optional adaptive
//! pacing loop.

pub mod decoder;
pub mod event_client;
pub mod feed;
pub mod pid;
pub mod playout;
pub mod runtime;
pub mod scheduler;

pub use decoder::{probe_duration, SegmentDecoder};
pub use event_client::EventClient;
pub use feed::{FeedEndpoint, PcmFeed};
pub use pid::{BufferPid, PidConfig};
pub use playout::PlayoutEngine;
pub use runtime::{StationConfig, StationRuntime};
pub use scheduler::{AudioEvent, SegmentEvent, SegmentKind, SegmentPhase, SegmentScheduler};
