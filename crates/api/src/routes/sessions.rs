//! Analysis-session control: start a pipeline, inspect its state, and
//! resolve the approval interrupt.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use common::Market;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/analysis", post(start_analysis).get(list_sessions))
        .route("/api/analysis/:id", get(session_status))
        .route("/api/analysis/:id/approve", post(approve_session))
        .route("/api/analysis/:id/reject", post(reject_session))
        .route("/api/analysis/:id/cancel", post(cancel_session))
}

#[derive(Deserialize)]
struct StartAnalysisBody {
    ticker: String,
    #[serde(default)]
    market: Option<Market>,
    #[serde(default)]
    query: Option<String>,
}

async fn start_analysis(
    State(state): State<AppState>,
    Json(body): Json<StartAnalysisBody>,
) -> (StatusCode, Json<Value>) {
    let market = body.market.unwrap_or(Market::Krx);
    match state
        .runner
        .start_analysis(&body.ticker, market, body.query)
        .await
    {
        Ok(session_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "session_id": session_id })),
        ),
        Err(e) => {
            warn!(error = %e, "failed to start analysis");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.runner.sessions().list().await;
    let rows: Vec<Value> = sessions
        .iter()
        .map(|s| {
            json!({
                "session_id": s.id,
                "ticker": s.ticker,
                "name": s.name,
                "market": s.market,
                "stage": s.stage.to_string(),
                "awaiting_approval": s.awaiting_approval,
                "reanalyze_count": s.reanalyze_count,
                "error": s.error,
                "updated_at": s.updated_at,
            })
        })
        .collect();
    Json(json!({ "sessions": rows }))
}

async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.runner.status(&id).await {
        Some(session) => (
            StatusCode::OK,
            Json(json!({
                "session_id": session.id,
                "ticker": session.ticker,
                "name": session.name,
                "market": session.market,
                "stage": session.stage.to_string(),
                "awaiting_approval": session.awaiting_approval,
                "approval_status": session.approval_status,
                "reanalyze_count": session.reanalyze_count,
                "analyses": session.analyses(),
                "proposal": session.proposal,
                "reasoning_log": session.reasoning_log,
                "error": session.error,
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        ),
    }
}

#[derive(Deserialize, Default)]
struct ApproveBody {
    #[serde(default)]
    quantity: Option<f64>,
}

async fn approve_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ApproveBody>>,
) -> (StatusCode, Json<Value>) {
    let quantity = body.and_then(|b| b.0.quantity);
    match state.runner.approve(&id, quantity).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "approved" }))),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Deserialize, Default)]
struct RejectBody {
    #[serde(default)]
    feedback: Option<String>,
}

async fn reject_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RejectBody>>,
) -> (StatusCode, Json<Value>) {
    let feedback = body.and_then(|b| b.0.feedback);
    match state.runner.reject(&id, feedback).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "rejected" }))),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.runner.cancel(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "cancelled" }))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}
