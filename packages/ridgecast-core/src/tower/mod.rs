//! Tower-side pipeline: PCM ingest → ring buffer → paced emission →
//! MP3 encoding → HTTP fan-out.

pub mod broadcast;
pub mod encoder;
pub mod ffmpeg;
pub mod ingress;
pub mod pump;
pub mod runtime;

pub use broadcast::{Broadcaster, BroadcasterConfig, Listener};
pub use encoder::{EncoderManager, PcmSink};
pub use ffmpeg::{FfmpegSupervisor, PcmHandle};
pub use ingress::{IngressEndpoint, PcmIngress};
pub use pump::AudioPump;
pub use runtime::{TowerConfig, TowerRuntime};
