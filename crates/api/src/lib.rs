pub mod routes;

use std::collections::VecDeque;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use engine::Coordinator;
use pipeline::PipelineRunner;

/// Ring buffer that keeps recent log lines so new clients get history.
/// Sync because it is written from inside the tracing writer.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        let mut buf = self.inner.lock().expect("log buffer poisoned");
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("log buffer poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// `MakeWriter` that tees formatted tracing output to stdout, the log
/// ring buffer and the WebSocket broadcast.
#[derive(Clone)]
pub struct LogFanout {
    tx: broadcast::Sender<String>,
    buffer: LogBuffer,
}

impl LogFanout {
    pub fn new(tx: broadcast::Sender<String>, buffer: LogBuffer) -> Self {
        Self { tx, buffer }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogFanout {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        LogSink {
            fanout: self.clone(),
            pending: Vec::new(),
        }
    }
}

pub struct LogSink {
    fanout: LogFanout,
    pending: Vec<u8>,
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stdout().write_all(buf)?;
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(text) = std::str::from_utf8(&self.pending) {
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                self.fanout.buffer.push(line.to_string());
                let _ = self.fanout.tx.send(line.to_string());
            }
        }
        self.pending.clear();
        std::io::stdout().flush()
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Shared application state injected into every route handler.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub runner: Arc<PipelineRunner>,
    pub db: SqlitePool,
    pub dashboard_token: String,
    /// Broadcast channel for streaming log lines to WebSocket clients.
    pub log_tx: broadcast::Sender<String>,
    /// Recent log history for new clients.
    pub log_buffer: LogBuffer,
}

// ── Dashboard credential guard ───────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

/// One guard for the whole protected surface. REST clients send
/// `Authorization: Bearer <token>`; browser WebSocket clients cannot set
/// headers, so `?token=` is accepted as an equivalent credential.
pub(crate) async fn require_token(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let presented = bearer.or(query.token.as_deref());

    let authorized = presented
        .map(|t| token_matches(t, &state.dashboard_token))
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "rejected unauthenticated dashboard request");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing or invalid dashboard token" })),
        )
            .into_response()
    }
}

/// Compare the presented token without short-circuiting on the first
/// mismatching byte.
fn token_matches(presented: &str, expected: &str) -> bool {
    let a = presented.as_bytes();
    let b = expected.as_bytes();
    if a.len() != b.len() || b.is_empty() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Build and run the Axum API server.
pub async fn serve(state: AppState, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    let app = routes::router(state.clone()).with_state(state).layer(cors);

    info!(%addr, "dashboard API listening");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison_requires_exact_match() {
        assert!(token_matches("secret-token", "secret-token"));
        assert!(!token_matches("secret-tokeN", "secret-token"));
        assert!(!token_matches("secret", "secret-token"));
    }

    #[test]
    fn empty_expected_token_never_authorizes() {
        // A blank DASHBOARD_TOKEN must not open the dashboard.
        assert!(!token_matches("", ""));
        assert!(!token_matches("anything", ""));
    }
}
