//! Trading-state surface: portfolio snapshot, trade ledger, alerts and
//! system lifecycle, plus the open health probe.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use common::AlertAction;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/portfolio", get(get_portfolio))
        .route("/api/trades", get(get_trades))
        .route("/api/alerts", get(get_alerts))
        .route("/api/alerts/:id/action", post(alert_action))
        .route("/api/system/start", post(system_start))
        .route("/api/system/stop", post(system_stop))
        .route("/api/system/pause", post(system_pause))
        .route("/api/system/resume", post(system_resume))
}

/// Health probe — mounted outside the credential guard so deploy checks
/// and ops scripts need no token.
pub fn health_router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz))
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let mode = state.coordinator.mode().await;
    Json(json!({
        "status": "ok",
        "mode": mode.to_string(),
    }))
}

// ─── Portfolio ───────────────────────────────────────────────────────────────

async fn get_portfolio(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.coordinator.snapshot().await;
    Json(json!(snapshot))
}

// ─── Trades ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TradesQuery {
    page: Option<i64>,
    limit: Option<i64>,
    ticker: Option<String>,
}

async fn get_trades(State(state): State<AppState>, Query(q): Query<TradesQuery>) -> Json<Value> {
    let page = q.page.unwrap_or(1).max(1);
    let limit = q.limit.unwrap_or(50).min(200);
    let offset = (page - 1) * limit;

    type Row = (
        String,
        Option<String>,
        String,
        String,
        String,
        f64,
        f64,
        f64,
        f64,
        String,
        String,
    );
    let base = "SELECT id, session_id, ticker, side, order_type, requested_price,
                       executed_price, requested_quantity, executed_quantity, state, executed_at
                FROM trades";

    let rows: Vec<Row> = if let Some(ticker) = &q.ticker {
        sqlx::query_as(&format!(
            "{base} WHERE ticker = ?1 ORDER BY executed_at DESC LIMIT ?2 OFFSET ?3"
        ))
        .bind(ticker)
        .bind(limit)
        .bind(offset)
        .fetch_all(&state.db)
        .await
        .unwrap_or_default()
    } else {
        sqlx::query_as(&format!(
            "{base} ORDER BY executed_at DESC LIMIT ?1 OFFSET ?2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&state.db)
        .await
        .unwrap_or_default()
    };

    let total: i64 = if let Some(ticker) = &q.ticker {
        sqlx::query_scalar("SELECT COUNT(*) FROM trades WHERE ticker = ?1")
            .bind(ticker)
            .fetch_one(&state.db)
            .await
            .unwrap_or(0)
    } else {
        sqlx::query_scalar("SELECT COUNT(*) FROM trades")
            .fetch_one(&state.db)
            .await
            .unwrap_or(0)
    };

    let trades: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "id": r.0, "session_id": r.1, "ticker": r.2, "side": r.3,
                "order_type": r.4, "requested_price": r.5, "executed_price": r.6,
                "requested_quantity": r.7, "executed_quantity": r.8,
                "state": r.9, "executed_at": r.10,
            })
        })
        .collect();

    Json(json!({ "trades": trades, "total": total, "page": page, "limit": limit }))
}

// ─── Alerts ──────────────────────────────────────────────────────────────────

async fn get_alerts(State(state): State<AppState>) -> Json<Value> {
    let alerts = state.coordinator.pending_alerts().await;
    Json(json!({ "alerts": alerts }))
}

#[derive(Deserialize)]
struct AlertActionBody {
    action: String,
    #[serde(default)]
    data: Option<Value>,
}

async fn alert_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AlertActionBody>,
) -> (StatusCode, Json<Value>) {
    let action: AlertAction = match body.action.parse() {
        Ok(action) => action,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))),
    };

    match state
        .coordinator
        .handle_alert_action(&id, action, body.data)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "handled" }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

async fn system_start(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.coordinator.start().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "active" }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn system_stop(State(state): State<AppState>) -> Json<Value> {
    state.coordinator.stop().await;
    Json(json!({ "status": "stopped" }))
}

#[derive(Deserialize, Default)]
struct PauseBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn system_pause(State(state): State<AppState>, body: Option<Json<PauseBody>>) -> Json<Value> {
    let reason = body
        .and_then(|b| b.0.reason)
        .unwrap_or_else(|| "manual pause".to_string());
    state.coordinator.pause(&reason).await;
    Json(json!({ "status": "paused" }))
}

async fn system_resume(State(state): State<AppState>) -> Json<Value> {
    state.coordinator.resume().await;
    Json(json!({ "status": "active" }))
}
