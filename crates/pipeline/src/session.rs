use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use common::{
    AnalysisResult, AssetInfo, Candle, Holding, Market, Orderbook, TradeProposal,
};

/// Stages of one analysis session. Transitions are strictly monotonic
/// except the re-analyze edge, which resets back to `DataCollection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DataCollection,
    ParallelAnalysis,
    Risk,
    Synthesis,
    Approval,
    Execution,
    Complete,
}

impl Stage {
    /// Position in the monotonic walk, used by tests and sanity checks.
    pub fn index(&self) -> u8 {
        match self {
            Stage::DataCollection => 0,
            Stage::ParallelAnalysis => 1,
            Stage::Risk => 2,
            Stage::Synthesis => 3,
            Stage::Approval => 4,
            Stage::Execution => 5,
            Stage::Complete => 6,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::DataCollection => "data_collection",
            Stage::ParallelAnalysis => "parallel_analysis",
            Stage::Risk => "risk",
            Stage::Synthesis => "synthesis",
            Stage::Approval => "approval",
            Stage::Execution => "execution",
            Stage::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// Everything the data-collection stage gathered for one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContext {
    pub asset: AssetInfo,
    pub orderbook: Orderbook,
    pub chart: Vec<Candle>,
    pub existing_position: Option<Holding>,
}

/// In-flight state of one pipeline run. Each stage fills in its own
/// optional fields; nothing is ever overwritten except by a re-analyze
/// reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub ticker: String,
    pub name: String,
    pub market: Market,
    pub stage: Stage,
    pub query: Option<String>,

    pub data: Option<MarketContext>,
    pub technical: Option<AnalysisResult>,
    /// Fundamental analysis for stocks, market analysis for crypto.
    pub middle: Option<AnalysisResult>,
    pub sentiment: Option<AnalysisResult>,
    pub risk: Option<AnalysisResult>,

    pub proposal: Option<TradeProposal>,
    pub awaiting_approval: bool,
    pub approval_status: Option<ApprovalStatus>,
    pub quantity_override: Option<f64>,
    pub reanalyze_count: u32,
    pub user_feedback: Option<String>,

    pub reasoning_log: Vec<String>,
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(ticker: impl Into<String>, market: Market, query: Option<String>) -> Self {
        let ticker = ticker.into();
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: ticker.clone(),
            ticker,
            market,
            stage: Stage::DataCollection,
            query,
            data: None,
            technical: None,
            middle: None,
            sentiment: None,
            risk: None,
            proposal: None,
            awaiting_approval: false,
            approval_status: None,
            quantity_override: None,
            reanalyze_count: 0,
            user_feedback: None,
            reasoning_log: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append one human-readable line to the reasoning log.
    pub fn log(&mut self, line: impl Into<String>) {
        self.reasoning_log.push(line.into());
        self.updated_at = Utc::now();
    }

    pub fn log_error(&mut self, line: impl std::fmt::Display) {
        self.reasoning_log.push(format!("[ERROR] {line}"));
        self.updated_at = Utc::now();
    }

    pub fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
        self.updated_at = Utc::now();
    }

    /// All analysis results produced so far, risk last.
    pub fn analyses(&self) -> Vec<AnalysisResult> {
        [&self.technical, &self.middle, &self.sentiment, &self.risk]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Rejection resets the session to data collection, clears every
    /// analysis and bumps the reanalysis counter.
    pub fn reset_for_reanalysis(&mut self, feedback: Option<String>) {
        self.reanalyze_count += 1;
        self.stage = Stage::DataCollection;
        self.data = None;
        self.technical = None;
        self.middle = None;
        self.sentiment = None;
        self.risk = None;
        self.proposal = None;
        self.awaiting_approval = false;
        self.approval_status = None;
        self.quantity_override = None;
        let mut line = format!("re-analysis requested (attempt #{})", self.reanalyze_count);
        if let Some(feedback) = &feedback {
            line.push_str(&format!(" — feedback: {feedback}"));
        }
        self.user_feedback = feedback;
        self.log(line);
    }
}

/// Event emitted whenever a session changes observably.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: String,
    pub ticker: String,
    pub stage: Stage,
}

/// In-memory session table with a change broadcast for the API/WS layer.
pub struct SessionStore {
    inner: RwLock<HashMap<String, Session>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn insert(&self, session: Session) {
        self.emit(&session);
        self.inner
            .write()
            .await
            .insert(session.id.clone(), session);
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.read().await.get(session_id).cloned()
    }

    pub async fn list(&self) -> Vec<Session> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Mutate one session in place and broadcast the change.
    pub async fn update<F, R>(&self, session_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut inner = self.inner.write().await;
        let session = inner.get_mut(session_id)?;
        let result = f(session);
        let event = SessionEvent {
            session_id: session.id.clone(),
            ticker: session.ticker.clone(),
            stage: session.stage,
        };
        drop(inner);
        let _ = self.events.send(event);
        Some(result)
    }

    fn emit(&self, session: &Session) {
        let _ = self.events.send(SessionEvent {
            session_id: session.id.clone(),
            ticker: session.ticker.clone(),
            stage: session.stage,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_indices_are_monotonic() {
        let stages = [
            Stage::DataCollection,
            Stage::ParallelAnalysis,
            Stage::Risk,
            Stage::Synthesis,
            Stage::Approval,
            Stage::Execution,
            Stage::Complete,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].index() < pair[1].index());
        }
    }

    #[test]
    fn reset_clears_analyses_and_bumps_counter() {
        let mut session = Session::new("005930", Market::Krx, None);
        session.stage = Stage::Approval;
        session.awaiting_approval = true;
        session.approval_status = Some(ApprovalStatus::Rejected);
        session.reset_for_reanalysis(Some("wait for earnings".into()));

        assert_eq!(session.stage, Stage::DataCollection);
        assert_eq!(session.reanalyze_count, 1);
        assert!(session.technical.is_none());
        assert!(session.proposal.is_none());
        assert!(!session.awaiting_approval);
        assert!(session.approval_status.is_none());
        assert_eq!(session.user_feedback.as_deref(), Some("wait for earnings"));
        assert!(session
            .reasoning_log
            .last()
            .unwrap()
            .contains("wait for earnings"));
    }

    #[test]
    fn error_lines_carry_the_error_prefix() {
        let mut session = Session::new("005930", Market::Krx, None);
        session.log_error("data collection failed");
        assert!(session.reasoning_log[0].starts_with("[ERROR]"));
    }
}
