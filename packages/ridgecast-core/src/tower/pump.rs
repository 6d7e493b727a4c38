//! Ring drain driven by the emission clock.
//!
//! One tick, one frame slot: the pump pops the ring with a short timeout
//! and hands the result to the encoder manager. The pop timeout is half a
//! tick so the pump can never hold a tick past its period; the encoder
//! side is non-blocking by contract.

use std::sync::Arc;
use std::time::Duration;

use crate::buffer::FrameRing;
use crate::clock::TickFn;
use crate::tower::encoder::EncoderManager;

/// Clock B subscriber that drains the PCM ring into the encoder.
pub struct AudioPump {
    ring: Arc<FrameRing>,
    encoder: Arc<EncoderManager>,
    pop_timeout: Duration,
}

impl AudioPump {
    /// Creates a pump popping with half the tick period as its budget.
    pub fn new(ring: Arc<FrameRing>, encoder: Arc<EncoderManager>, tick_period: Duration) -> Self {
        Self {
            ring,
            encoder,
            pop_timeout: tick_period / 2,
        }
    }

    /// One clock tick worth of work.
    pub fn tick(&self) {
        let frame = self.ring.pop_timeout(self.pop_timeout);
        self.encoder.next_frame(frame);
    }

    /// Wraps the pump as a clock subscriber.
    pub fn into_subscriber(self: Arc<Self>) -> TickFn {
        Box::new(move |_| self.tick())
    }
}
