//! PCM ingest server: the station's byte stream becomes ring frames.
//!
//! The transport carries concatenated 4608-byte frames with no framing
//! markers, over TCP or a local unix socket. One upstream connection is
//! served at a time; when it goes away the tower runs on fallback until
//! the station reconnects.

use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::buffer::{FrameRing, PushOutcome};
use crate::error::{RidgecastError, RidgecastResult};
use crate::protocol_constants::FRAME_BYTES;
use crate::tower::encoder::EncoderManager;

/// Where the tower listens for station PCM.
#[derive(Debug, Clone)]
pub enum IngressEndpoint {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl std::fmt::Display for IngressEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

enum BoundListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

/// Stream server feeding the PCM ring.
pub struct PcmIngress {
    endpoint: IngressEndpoint,
    listener: BoundListener,
    ring: Arc<FrameRing>,
    encoder: Arc<EncoderManager>,
    cancel: CancellationToken,
}

impl PcmIngress {
    /// Binds the ingest endpoint.
    ///
    /// Bind failures are startup-fatal; everything after that is survived.
    pub async fn bind(
        endpoint: IngressEndpoint,
        ring: Arc<FrameRing>,
        encoder: Arc<EncoderManager>,
        cancel: CancellationToken,
    ) -> RidgecastResult<Self> {
        let listener = match &endpoint {
            IngressEndpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(|e| {
                    RidgecastError::Configuration(format!("PCM bind {addr} failed: {e}"))
                })?;
                BoundListener::Tcp(listener)
            }
            #[cfg(unix)]
            IngressEndpoint::Unix(path) => {
                // A stale socket file from a previous run blocks the bind
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path).map_err(|e| {
                    RidgecastError::Configuration(format!(
                        "PCM bind {} failed: {e}",
                        path.display()
                    ))
                })?;
                BoundListener::Unix(listener, path.clone())
            }
        };
        log::info!("[Ingress] listening on {endpoint}");
        Ok(Self {
            endpoint,
            listener,
            ring,
            encoder,
            cancel,
        })
    }

    /// Returns the local TCP address when bound over TCP (tests bind port 0).
    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            BoundListener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            BoundListener::Unix(..) => None,
        }
    }

    /// Serves until cancelled.
    pub async fn run(self) {
        match self.listener {
            BoundListener::Tcp(listener) => {
                accept_tcp(listener, &self.ring, &self.encoder, &self.cancel).await
            }
            #[cfg(unix)]
            BoundListener::Unix(listener, path) => {
                accept_unix(listener, &self.ring, &self.encoder, &self.cancel).await;
                let _ = std::fs::remove_file(&path);
            }
        }
        log::info!("[Ingress] {} stopped", self.endpoint);
    }

}

async fn accept_tcp(
    listener: TcpListener,
    ring: &Arc<FrameRing>,
    encoder: &Arc<EncoderManager>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::info!("[Ingress] station connected from {peer}");
                    let _ = stream.set_nodelay(true);
                    encoder.mark_station_connected();
                    ingest(stream, ring, cancel).await;
                    log::info!("[Ingress] station disconnected, awaiting reconnect");
                }
                Err(e) => log::warn!("[Ingress] accept failed: {e}"),
            }
        }
    }
}

#[cfg(unix)]
async fn accept_unix(
    listener: UnixListener,
    ring: &Arc<FrameRing>,
    encoder: &Arc<EncoderManager>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    log::info!("[Ingress] station connected");
                    encoder.mark_station_connected();
                    ingest(stream, ring, cancel).await;
                    log::info!("[Ingress] station disconnected, awaiting reconnect");
                }
                Err(e) => log::warn!("[Ingress] accept failed: {e}"),
            }
        }
    }
}

/// Reads one connection until EOF, pushing every complete frame.
///
/// A short read at connection close discards the trailing partial frame;
/// overflow only bumps the ring's counter.
async fn ingest<R: AsyncRead + Unpin>(
    mut reader: R,
    ring: &Arc<FrameRing>,
    cancel: &CancellationToken,
) {
    let mut acc = BytesMut::with_capacity(FRAME_BYTES * 4);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_buf(&mut acc) => match read {
                Ok(0) => break,
                Ok(_) => {
                    while acc.len() >= FRAME_BYTES {
                        let frame = acc.split_to(FRAME_BYTES).freeze();
                        if ring.push(frame) == PushOutcome::Overflowed {
                            log::trace!("[Ingress] ring full, oldest frame evicted");
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[Ingress] read failed: {e}");
                    break;
                }
            }
        }
    }
    if !acc.is_empty() {
        log::debug!(
            "[Ingress] discarding {}-byte partial frame at close",
            acc.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn splits_stream_into_exact_frames() {
        let ring = Arc::new(FrameRing::new(16));
        let cancel = CancellationToken::new();

        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        let writer = tokio::spawn(async move {
            // Two and a half frames in awkward chunk sizes
            let data = vec![1u8; FRAME_BYTES * 2 + FRAME_BYTES / 2];
            for chunk in data.chunks(1000) {
                tx.write_all(chunk).await.unwrap();
            }
            // tx drops here: EOF
        });

        ingest(rx, &ring, &cancel).await;
        writer.await.unwrap();

        let snapshot = ring.snapshot();
        assert_eq!(snapshot.count, 2, "partial trailing frame must be discarded");
        assert_eq!(ring.try_pop().unwrap().len(), FRAME_BYTES);
    }

    #[tokio::test]
    async fn frame_bytes_survive_reassembly() {
        let ring = Arc::new(FrameRing::new(4));
        let cancel = CancellationToken::new();

        let mut payload = Vec::with_capacity(FRAME_BYTES);
        for i in 0..FRAME_BYTES {
            payload.push((i % 251) as u8);
        }

        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            tx.write_all(&payload).await.unwrap();
        });

        ingest(rx, &ring, &cancel).await;
        writer.await.unwrap();

        assert_eq!(ring.try_pop().unwrap().as_ref(), expected.as_slice());
    }

    #[tokio::test]
    async fn overflow_keeps_ingesting() {
        let ring = Arc::new(FrameRing::new(2));
        let cancel = CancellationToken::new();

        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        let writer = tokio::spawn(async move {
            tx.write_all(&vec![0u8; FRAME_BYTES * 5]).await.unwrap();
        });

        ingest(rx, &ring, &cancel).await;
        writer.await.unwrap();

        let snapshot = ring.snapshot();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.overflow_count, 3);
    }

    #[tokio::test]
    async fn bind_on_port_zero_and_push_over_tcp() {
        let ring = Arc::new(FrameRing::new(8));
        let encoder = Arc::new(EncoderManager::new(
            Arc::new(NullSink),
            Arc::new(crate::events::EventHub::new()),
            crate::fallback::FallbackGenerator::new(crate::fallback::FallbackMode::Silence),
            std::time::Duration::from_secs(5),
        ));
        let cancel = CancellationToken::new();

        let ingress = PcmIngress::bind(
            IngressEndpoint::Tcp(([127, 0, 0, 1], 0).into()),
            Arc::clone(&ring),
            encoder,
            cancel.clone(),
        )
        .await
        .unwrap();
        let addr = ingress.local_tcp_addr().unwrap();
        let server = tokio::spawn(ingress.run());

        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        conn.write_all(&vec![9u8; FRAME_BYTES]).await.unwrap();
        conn.shutdown().await.unwrap();

        // Wait for the frame to land, then stop the server
        for _ in 0..50 {
            if ring.snapshot().count == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(ring.snapshot().count, 1);

        cancel.cancel();
        let _ = server.await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_ingest_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("pcm.sock");
        // A stale socket file from a crashed run must not block the bind
        std::fs::write(&sock, b"").unwrap();

        let ring = Arc::new(FrameRing::new(8));
        let encoder = Arc::new(EncoderManager::new(
            Arc::new(NullSink),
            Arc::new(crate::events::EventHub::new()),
            crate::fallback::FallbackGenerator::new(crate::fallback::FallbackMode::Silence),
            std::time::Duration::from_secs(5),
        ));
        let cancel = CancellationToken::new();

        let ingress = PcmIngress::bind(
            IngressEndpoint::Unix(sock.clone()),
            Arc::clone(&ring),
            encoder,
            cancel.clone(),
        )
        .await
        .unwrap();
        let server = tokio::spawn(ingress.run());

        let mut conn = tokio::net::UnixStream::connect(&sock).await.unwrap();
        conn.write_all(&vec![4u8; FRAME_BYTES]).await.unwrap();
        drop(conn);

        for _ in 0..50 {
            if ring.snapshot().count == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(ring.snapshot().count, 1);

        cancel.cancel();
        let _ = server.await;
        // The socket file is cleaned up on stop
        assert!(!sock.exists());
    }

    struct NullSink;
    impl crate::tower::encoder::PcmSink for NullSink {
        fn push_frame(&self, _frame: bytes::Bytes) {}
    }
}
