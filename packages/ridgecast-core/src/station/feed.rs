//! PCM transport client toward the tower.
//!
//! Byte-oriented: concatenated frames, no framing. Reconnecting is the
//! station's job; a write failure drops that frame, schedules a backoff,
//! and lets the tower's fallback cover the gap. Sends while disconnected
//! are dropped, never queued; pacing must not stall on the network.

use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::protocol_constants::{RECONNECT_BACKOFF_INITIAL, RECONNECT_BACKOFF_MAX};

/// Where the tower's PCM ingest lives.
#[derive(Debug, Clone)]
pub enum FeedEndpoint {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl std::fmt::Display for FeedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

enum FeedConn {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl FeedConn {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.write_all(data).await,
            #[cfg(unix)]
            Self::Unix(stream) => stream.write_all(data).await,
        }
    }
}

/// Reconnecting frame writer.
pub struct PcmFeed {
    endpoint: FeedEndpoint,
    conn: Option<FeedConn>,
    backoff: Duration,
    next_attempt: Instant,
    /// Connect attempts are bounded so a dead tower cannot stall pacing.
    connect_budget: Duration,
    frames_sent: u64,
    frames_dropped: u64,
}

impl PcmFeed {
    pub fn new(endpoint: FeedEndpoint) -> Self {
        Self {
            endpoint,
            conn: None,
            backoff: RECONNECT_BACKOFF_INITIAL,
            next_attempt: Instant::now(),
            connect_budget: Duration::from_millis(250),
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    /// True while a transport connection is up.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Frames written since startup.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Frames dropped while disconnected or on write failure.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Sends one frame, or drops it if the transport is down.
    pub async fn send(&mut self, frame: &Bytes) {
        if self.conn.is_none() {
            self.try_connect().await;
        }

        let Some(conn) = self.conn.as_mut() else {
            self.frames_dropped += 1;
            return;
        };

        if let Err(e) = conn.write_all(frame).await {
            log::warn!(
                "[Feed] write to {} failed ({e}), reconnecting in {:?}",
                self.endpoint,
                self.backoff
            );
            self.conn = None;
            self.schedule_retry();
            self.frames_dropped += 1;
            return;
        }
        self.frames_sent += 1;
    }

    /// Closes the transport; a later send reconnects.
    pub fn disconnect(&mut self) {
        self.conn = None;
    }

    async fn try_connect(&mut self) {
        if Instant::now() < self.next_attempt {
            return;
        }

        let endpoint = self.endpoint.clone();
        let attempt = async move {
            match endpoint {
                FeedEndpoint::Tcp(addr) => {
                    let stream = TcpStream::connect(addr).await?;
                    let _ = stream.set_nodelay(true);
                    Ok::<_, std::io::Error>(FeedConn::Tcp(stream))
                }
                #[cfg(unix)]
                FeedEndpoint::Unix(path) => {
                    Ok(FeedConn::Unix(UnixStream::connect(path).await?))
                }
            }
        };
        let result = timeout(self.connect_budget, attempt).await;

        match result {
            Ok(Ok(conn)) => {
                log::info!("[Feed] connected to {}", self.endpoint);
                self.conn = Some(conn);
                self.backoff = RECONNECT_BACKOFF_INITIAL;
            }
            Ok(Err(e)) => {
                log::debug!("[Feed] connect to {} failed: {e}", self.endpoint);
                self.schedule_retry();
            }
            Err(_) => {
                log::debug!("[Feed] connect to {} timed out", self.endpoint);
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&mut self) {
        self.next_attempt = Instant::now() + self.backoff;
        self.backoff = (self.backoff * 2).min(RECONNECT_BACKOFF_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_constants::FRAME_BYTES;
    use tokio::io::AsyncReadExt;

    fn frame() -> Bytes {
        Bytes::from(vec![5u8; FRAME_BYTES])
    }

    #[tokio::test]
    async fn frames_reach_a_listening_tower() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let receiver = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; FRAME_BYTES];
            conn.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut feed = PcmFeed::new(FeedEndpoint::Tcp(addr));
        feed.send(&frame()).await;
        assert!(feed.is_connected());
        assert_eq!(feed.frames_sent(), 1);

        assert_eq!(receiver.await.unwrap(), vec![5u8; FRAME_BYTES]);
    }

    #[tokio::test]
    async fn sends_while_down_are_dropped_not_queued() {
        // Nothing listens here
        let mut feed = PcmFeed::new(FeedEndpoint::Tcp(([127, 0, 0, 1], 1).into()));

        feed.send(&frame()).await;
        feed.send(&frame()).await;
        feed.send(&frame()).await;

        assert!(!feed.is_connected());
        assert_eq!(feed.frames_sent(), 0);
        assert_eq!(feed.frames_dropped(), 3);
    }

    #[tokio::test]
    async fn backoff_rate_limits_reconnect_attempts() {
        let mut feed = PcmFeed::new(FeedEndpoint::Tcp(([127, 0, 0, 1], 1).into()));

        feed.send(&frame()).await;
        let first_backoff = feed.backoff;
        // Within the backoff window the next send never attempts a connect
        let start = Instant::now();
        feed.send(&frame()).await;
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(feed.backoff, first_backoff);
    }
}
