//! Live dashboard feed: one WebSocket that replays recent log history,
//! then interleaves log lines with session-stage events (each carrying a
//! fresh trading snapshot).
//!
//! Authentication happens in the shared credential guard; browser
//! clients pass `?token=` because the WebSocket API cannot set headers.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde_json::json;
use tracing::warn;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/stream", get(stream_handler))
}

async fn stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| pump(socket, state))
}

async fn pump(mut socket: WebSocket, state: AppState) {
    // History first, so the client sees what happened before it
    // connected.
    for line in state.log_buffer.snapshot() {
        if send_log(&mut socket, &line).await.is_err() {
            return;
        }
    }

    let mut log_rx = state.log_tx.subscribe();
    let mut session_rx = state.runner.sessions().subscribe();

    loop {
        tokio::select! {
            log = log_rx.recv() => match log {
                Ok(line) => {
                    if send_log(&mut socket, &line).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(dropped = n, "WebSocket log client lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },

            event = session_rx.recv() => match event {
                Ok(event) => {
                    // A stage change also ships a fresh trading snapshot.
                    let snapshot = state.coordinator.snapshot().await;
                    let frame = json!({
                        "type": "session",
                        "session_id": event.session_id,
                        "ticker": event.ticker,
                        "stage": event.stage.to_string(),
                        "state": snapshot,
                    })
                    .to_string();
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(dropped = n, "WebSocket session client lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn send_log(socket: &mut WebSocket, line: &str) -> Result<(), axum::Error> {
    let frame = json!({ "type": "log", "line": line }).to_string();
    socket.send(Message::Text(frame)).await
}
