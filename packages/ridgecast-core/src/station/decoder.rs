//! Per-segment MP3 → PCM decoder child.
//!
//! Each segment gets its own ffmpeg child decoding to raw s16le stereo at
//! the wire rate. Reads are frame-exact with a stall timeout: a decoder
//! producing nothing for two tick periods is killed and the segment
//! failed. EOF mid-frame zero-pads the tail so the last frame stays
//! wire-legal.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;

use crate::audio::zero_pad_frame;
use crate::error::{RidgecastError, RidgecastResult};
use crate::protocol_constants::{
    CHANNELS, DECODER_STALL_TIMEOUT, FFMPEG_TERM_GRACE, FRAME_BYTES, SAMPLE_RATE,
};

/// Allowance for process startup before the first byte arrives.
///
/// The strict stall timeout only applies once the decoder has produced
/// output; spawning ffmpeg and opening the input takes longer than two
/// tick periods on its own.
const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(2);

/// A running decoder for one segment file.
pub struct SegmentDecoder {
    child: Child,
    stdout: ChildStdout,
    acc: BytesMut,
    produced_output: bool,
    finished: bool,
}

impl SegmentDecoder {
    /// Spawns ffmpeg decoding `path` to the wire PCM format.
    pub async fn spawn(path: &Path) -> RidgecastResult<Self> {
        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-nostdin", "-loglevel", "error", "-i"])
            .arg(path)
            .args([
                "-f",
                "s16le",
                "-ar",
                &SAMPLE_RATE.to_string(),
                "-ac",
                &CHANNELS.to_string(),
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RidgecastError::Decoder(format!("spawn failed for {}: {e}", path.display()))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RidgecastError::Decoder("no stdout pipe".into()))?;

        log::debug!("[Decoder] started for {}", path.display());
        Ok(Self {
            child,
            stdout,
            acc: BytesMut::with_capacity(FRAME_BYTES * 2),
            produced_output: false,
            finished: false,
        })
    }

    /// Reads exactly one frame.
    ///
    /// Returns `Ok(None)` at clean EOF. A final partial frame comes back
    /// zero-padded; the call after it returns `None`. A stalled decoder
    /// returns an error and must be closed by the caller.
    pub async fn read_frame(&mut self) -> RidgecastResult<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        while self.acc.len() < FRAME_BYTES {
            let stall = if self.produced_output {
                DECODER_STALL_TIMEOUT
            } else {
                FIRST_BYTE_TIMEOUT
            };
            let read = timeout(stall, self.stdout.read_buf(&mut self.acc))
                .await
                .map_err(|_| {
                    RidgecastError::Decoder(format!("no bytes for {stall:?}, decoder stuck"))
                })?
                .map_err(|e| RidgecastError::Decoder(format!("read failed: {e}")))?;
            self.produced_output = true;

            if read == 0 {
                self.finished = true;
                if self.acc.is_empty() {
                    return Ok(None);
                }
                let partial = self.acc.split();
                return Ok(Some(zero_pad_frame(&partial)));
            }
        }

        Ok(Some(self.acc.split_to(FRAME_BYTES).freeze()))
    }

    /// True once the decoder reached EOF.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Terminates the child: SIGTERM, bounded wait, then SIGKILL.
    ///
    /// Safe to call after EOF; a decoder that already exited just reaps.
    pub async fn close(mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if timeout(FFMPEG_TERM_GRACE, self.child.wait()).await.is_ok() {
                return;
            }
            log::warn!("[Decoder] child ignored SIGTERM, killing");
        }
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Probes a file's duration with ffprobe.
///
/// Best-effort: any failure (missing binary, unreadable file, garbage
/// output) degrades to `None` and the prep window degrades with it.
pub async fn probe_duration(path: &Path) -> Option<Duration> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }
    let seconds: f64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_fails_cleanly_for_missing_file() {
        // ffmpeg itself may be absent in the test environment; either way
        // this must surface as a Decoder error or an immediate EOF, never
        // a hang or panic.
        match SegmentDecoder::spawn(Path::new("/nonexistent/not-a-song.mp3")).await {
            Err(e) => assert_eq!(e.code(), "decoder_error"),
            Ok(mut decoder) => {
                let result = decoder.read_frame().await;
                match result {
                    Ok(None) => {}
                    Ok(Some(_)) => panic!("no bytes expected from a missing file"),
                    Err(_) => {}
                }
                decoder.close().await;
            }
        }
    }

    #[tokio::test]
    async fn probe_of_missing_file_is_none() {
        assert!(probe_duration(Path::new("/nonexistent/not-a-song.mp3"))
            .await
            .is_none());
    }
}
