//! HTTP/WebSocket API layer.
//!
//! Thin handlers over the tower services: the MP3 listener stream, the
//! buffer status snapshot, and the control-plane WebSocket. Router
//! construction and server startup live here.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer::FrameRing;
use crate::events::EventHub;
use crate::tower::broadcast::Broadcaster;

pub mod http;
pub mod ws;

/// Shared application state for the API layer.
///
/// A thin wrapper holding references to services; all business logic lives
/// in the services themselves.
#[derive(Clone)]
pub struct AppState {
    /// PCM ring between ingress and the pump.
    pub ring: Arc<FrameRing>,
    /// MP3 fan-out registry.
    pub broadcaster: Arc<Broadcaster>,
    /// Control-plane event hub.
    pub events: Arc<EventHub>,
}

impl AppState {
    pub fn new(ring: Arc<FrameRing>, broadcaster: Arc<Broadcaster>, events: Arc<EventHub>) -> Self {
        Self {
            ring,
            broadcaster,
            events,
        }
    }
}

/// Binds the listener and serves the tower API until the task is dropped.
///
/// Bind failures are startup-fatal by the exit-code contract.
pub async fn start_server(state: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("[Server] listening on http://{addr}");
    let app = http::create_router(state);

    // ConnectInfo gives handlers the listener's remote address
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
