//! WebSocket stream of transition events.
//!
//! Each connection subscribes to the watcher's broadcast channel and applies
//! its own `min_surprise` filter, so slow or picky clients never affect the
//! watcher or each other.

use super::routes::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Drop events whose surprise magnitude is below this; events with no
    /// surprise always pass
    pub min_surprise: Option<Decimal>,
}

pub async fn stream_earnings(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.min_surprise))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, min_surprise: Option<Decimal>) {
    let mut rx = state.events.subscribe();
    debug!(?min_surprise, "transition stream client connected");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    // lagged subscriber: skip dropped events, keep streaming
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "transition stream client lagging");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if let (Some(min), Some(surprise)) = (min_surprise, event.surprise_pct) {
                    if surprise.abs() < min.abs() {
                        continue;
                    }
                }
                let msg = serde_json::to_string(&event).unwrap_or_else(|e| {
                    warn!("failed to serialize transition event: {}", e);
                    "{}".to_string()
                });
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    debug!("transition stream client disconnected");
}
