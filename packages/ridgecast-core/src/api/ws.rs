//! WebSocket handler for the control-plane channel.
//!
//! The station connects to `GET /tower/events`, sends JSON control events,
//! and receives every event the hub rebroadcasts (its own included).
//! Invalid frames close the connection with a policy violation; nothing is
//! retained for late joiners.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;

use crate::api::AppState;

/// RFC 6455 close code for a policy violation.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// WebSocket upgrade handler for `/tower/events`.
pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events(socket, state))
}

async fn handle_events(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    log::info!("[Events] control peer connected");

    loop {
        tokio::select! {
            // Inbound control events from the peer
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = state.events.ingest_json(&text) {
                            log::warn!("[Events] rejecting peer: {e}");
                            let _ = sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: CLOSE_POLICY_VIOLATION,
                                    reason: e.code().into(),
                                })))
                                .await;
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        log::warn!("[Events] rejecting peer: binary frame on event channel");
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_POLICY_VIOLATION,
                                reason: "text frames only".into(),
                            })))
                            .await;
                        break;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
            // Outbound rebroadcast to this peer
            event = events_rx.recv() => {
                match event {
                    Ok(event) => {
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if sender.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("[Events] failed to serialize event: {e}"),
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Zero-retention contract: lagged events are simply gone
                        log::debug!("[Events] peer lagged {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    log::info!("[Events] control peer disconnected");
}
