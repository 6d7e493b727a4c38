//! HTTP handlers: the listener stream and the buffer snapshot.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{connect_info::ConnectInfo, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::api::{ws, AppState};
use crate::error::RidgecastError;

/// Builds the tower router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/stream", get(stream_audio))
        .route("/tower/buffer", get(buffer_status))
        .route("/tower/events", get(ws::events_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /stream`: indefinite MP3 body, one listener per connection.
///
/// The response never carries a Content-Length; the stream ends only when
/// the listener disconnects or is dropped for backpressure.
async fn stream_audio(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> Result<Response, RidgecastError> {
    let listener = state
        .broadcaster
        .subscribe(remote_addr.ip())
        .ok_or_else(|| RidgecastError::Internal("shutting down".into()))?;

    let body = Body::from_stream(Arc::clone(&state.broadcaster).body_stream(listener));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "close")
        .body(body)
        .map_err(|e| RidgecastError::Internal(e.to_string()))
}

/// `GET /tower/buffer`: point-in-time ring snapshot, always 200.
async fn buffer_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ring.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FrameRing;
    use crate::events::EventHub;
    use crate::protocol_constants::FRAME_BYTES;
    use crate::tower::broadcast::{Broadcaster, BroadcasterConfig};
    use bytes::Bytes;
    use std::time::Duration;

    fn test_state() -> AppState {
        AppState::new(
            Arc::new(FrameRing::new(10)),
            Arc::new(Broadcaster::new(BroadcasterConfig {
                pending_cap_bytes: 64 * 1024,
                client_timeout: Duration::from_secs(5),
            })),
            Arc::new(EventHub::new()),
        )
    }

    async fn get_json(state: AppState, path: &str) -> serde_json::Value {
        let addr = spawn_server(state).await;
        let body = reqwest::get(format!("http://{addr}{path}"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        serde_json::from_str(&body).unwrap()
    }

    async fn spawn_server(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn buffer_endpoint_reports_the_snapshot_schema() {
        let state = test_state();
        state.ring.push(Bytes::from(vec![0u8; FRAME_BYTES]));
        state.ring.push(Bytes::from(vec![0u8; FRAME_BYTES]));

        let json = get_json(state, "/tower/buffer").await;
        assert_eq!(json["capacity"], 10);
        assert_eq!(json["count"], 2);
        assert_eq!(json["overflow_count"], 0);
        let ratio = json["ratio"].as_f64().unwrap();
        assert!((ratio - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stream_endpoint_serves_mpeg_with_no_length() {
        let state = test_state();
        let broadcaster = Arc::clone(&state.broadcaster);
        let addr = spawn_server(state).await;

        let response = reqwest::get(format!("http://{addr}/stream")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "audio/mpeg"
        );
        assert!(response.headers().get("content-length").is_none());

        // A broadcast chunk reaches the connected listener
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broadcaster.client_count(), 1);
        broadcaster.broadcast(Bytes::from_static(b"mp3!"));

        let mut response = response;
        let chunk = response.chunk().await.unwrap().unwrap();
        assert_eq!(chunk.as_ref(), b"mp3!");
    }
}
