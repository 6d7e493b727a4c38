//! Supervised ffmpeg PCM→MP3 encoder.
//!
//! The supervisor owns the child as a single state machine: spawn, feed
//! stdin from a bounded PCM queue, relay stdout chunks to the broadcaster,
//! and respawn with exponential backoff when the child exits or wedges.
//! The queue lives outside the child's lifetime, so frames buffered during
//! a restart replay on the new stdin; mid-frame data is discarded.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{RidgecastError, RidgecastResult};
use crate::protocol_constants::{
    CHANNELS, ENCODER_QUEUE_FRAMES, FFMPEG_RESTART_BACKOFF_INITIAL, FFMPEG_RESTART_BACKOFF_MAX,
    FFMPEG_STDIN_WRITE_TIMEOUT, FFMPEG_TERM_GRACE, FRAME_SAMPLES, MP3_BITRATE, SAMPLE_RATE,
};
use crate::tower::broadcast::Broadcaster;
use crate::tower::encoder::PcmSink;

/// Chunk size for stdout reads; the supervisor never parses the MP3 stream.
const MP3_READ_CHUNK: usize = 8192;

/// How the supervised child stopped running.
enum ChildOutcome {
    /// Child exited on its own (crash or pipe closure).
    Exited,
    /// stdin write blocked past the timeout; child was killed.
    Wedged,
    /// Cancellation requested; child was terminated gracefully.
    Shutdown,
}

/// Non-blocking PCM entry point handed to the encoder manager.
pub struct PcmHandle {
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
}

impl PcmSink for PcmHandle {
    fn push_frame(&self, frame: Bytes) {
        if self.tx.try_send(frame).is_err() {
            // Queue full (or supervisor gone): drop and count, never block
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl PcmHandle {
    /// Frames dropped because the internal queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Owner of the ffmpeg child lifecycle.
pub struct FfmpegSupervisor {
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
    restarts: Arc<AtomicU64>,
}

impl FfmpegSupervisor {
    /// Creates a supervisor wired to the broadcaster.
    pub fn new(broadcaster: Arc<Broadcaster>, cancel: CancellationToken) -> Self {
        Self {
            broadcaster,
            cancel,
            restarts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of respawns since startup.
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Starts the supervision task and returns the PCM handle feeding it.
    pub fn start(&self) -> (Arc<PcmHandle>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<Bytes>(ENCODER_QUEUE_FRAMES);
        let handle = Arc::new(PcmHandle {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        });

        let broadcaster = Arc::clone(&self.broadcaster);
        let cancel = self.cancel.clone();
        let restarts = Arc::clone(&self.restarts);
        let task = tokio::spawn(async move {
            supervise(rx, broadcaster, cancel, restarts).await;
        });

        (handle, task)
    }
}

/// The exact encoder invocation; one PCM frame in maps to one MP3 frame out.
fn encoder_command() -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args([
        "-hide_banner",
        "-nostdin",
        "-loglevel",
        "warning",
        "-f",
        "s16le",
        "-ar",
        &SAMPLE_RATE.to_string(),
        "-ac",
        &CHANNELS.to_string(),
        "-i",
        "pipe:0",
        "-c:a",
        "libmp3lame",
        "-b:a",
        MP3_BITRATE,
        "-frame_size",
        &FRAME_SAMPLES.to_string(),
        "-f",
        "mp3",
        "-fflags",
        "+nobuffer",
        "-flush_packets",
        "1",
        "-write_xing",
        "0",
        "pipe:1",
    ])
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
    cmd
}

fn spawn_encoder() -> RidgecastResult<Child> {
    encoder_command()
        .spawn()
        .map_err(|e| RidgecastError::Encoder(format!("failed to spawn ffmpeg: {e}")))
}

async fn supervise(
    mut rx: mpsc::Receiver<Bytes>,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
    restarts: Arc<AtomicU64>,
) {
    let mut backoff = FFMPEG_RESTART_BACKOFF_INITIAL;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match spawn_encoder() {
            Ok(child) => {
                log::info!("[Ffmpeg] encoder started (pid {:?})", child.id());
                let started = Instant::now();
                let outcome = run_child(child, &mut rx, &broadcaster, &cancel).await;

                match outcome {
                    ChildOutcome::Shutdown => break,
                    ChildOutcome::Exited => {
                        log::warn!("[Ffmpeg] encoder exited after {:?}", started.elapsed())
                    }
                    ChildOutcome::Wedged => {
                        log::warn!("[Ffmpeg] encoder wedged on stdin, killed")
                    }
                }

                // A child that ran for a while earns a fresh backoff
                if started.elapsed() > FFMPEG_RESTART_BACKOFF_MAX {
                    backoff = FFMPEG_RESTART_BACKOFF_INITIAL;
                }
            }
            Err(e) => log::error!("[Ffmpeg] {e}"),
        }

        restarts.fetch_add(1, Ordering::Relaxed);
        log::info!("[Ffmpeg] respawning in {:?}", backoff);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(FFMPEG_RESTART_BACKOFF_MAX);
    }

    log::info!("[Ffmpeg] supervisor stopped");
}

/// Feeds and drains one child until it exits, wedges, or shutdown.
async fn run_child(
    mut child: Child,
    rx: &mut mpsc::Receiver<Bytes>,
    broadcaster: &Arc<Broadcaster>,
    cancel: &CancellationToken,
) -> ChildOutcome {
    let mut stdin = match child.stdin.take() {
        Some(stdin) => stdin,
        None => return ChildOutcome::Exited,
    };
    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => return ChildOutcome::Exited,
    };
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::warn!("[Ffmpeg] {line}");
            }
        });
    }

    let reader = tokio::spawn(read_mp3(stdout, Arc::clone(broadcaster)));

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                drop(stdin); // close the pipe so ffmpeg can flush and exit
                shutdown_child(&mut child).await;
                break ChildOutcome::Shutdown;
            }
            status = child.wait() => {
                log::debug!("[Ffmpeg] child wait returned {:?}", status);
                break ChildOutcome::Exited;
            }
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    // All PCM producers gone; treat as shutdown
                    drop(stdin);
                    shutdown_child(&mut child).await;
                    break ChildOutcome::Shutdown;
                };
                match timeout(FFMPEG_STDIN_WRITE_TIMEOUT, stdin.write_all(&frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        log::debug!("[Ffmpeg] stdin write failed: {e}");
                        break ChildOutcome::Exited;
                    }
                    Err(_) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        break ChildOutcome::Wedged;
                    }
                }
            }
        }
    };

    reader.abort();
    let _ = reader.await;
    outcome
}

/// Relays opaque MP3 bytes from the child to the broadcaster.
async fn read_mp3(mut stdout: ChildStdout, broadcaster: Arc<Broadcaster>) {
    let mut buf = BytesMut::with_capacity(MP3_READ_CHUNK);
    loop {
        buf.reserve(MP3_READ_CHUNK);
        match stdout.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => broadcaster.broadcast(buf.split().freeze()),
        }
    }
    log::debug!("[Ffmpeg] stdout reader finished");
}

/// SIGTERM, bounded wait, then SIGKILL.
async fn shutdown_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if timeout(FFMPEG_TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
        log::warn!("[Ffmpeg] child ignored SIGTERM, killing");
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
}
