use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use common::{Error, Market, Notifier, NotifyEvent, PipelineConfig, Result};
use engine::Coordinator;

use crate::session::{ApprovalStatus, Session, SessionStore, Stage};
use crate::stages::{run_to_approval, PipelineDeps};

/// Owns the session table and the per-session pipeline tasks.
///
/// Concurrency is bounded by the analysis-slot semaphore: a starting
/// session waits up to the configured deadline for a permit and fails if
/// none frees up. Approval, rejection and cancellation re-enter here.
pub struct PipelineRunner {
    stock: PipelineDeps,
    crypto: Option<PipelineDeps>,
    sessions: Arc<SessionStore>,
    coordinator: Arc<Coordinator>,
    notifier: Arc<dyn Notifier>,
    slots: Arc<Semaphore>,
    slot_wait: Duration,
    tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl PipelineRunner {
    pub fn new(
        config: &PipelineConfig,
        stock: PipelineDeps,
        crypto: Option<PipelineDeps>,
        coordinator: Arc<Coordinator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            stock,
            crypto,
            sessions: Arc::new(SessionStore::new()),
            coordinator,
            notifier,
            slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            slot_wait: Duration::from_secs(config.slot_wait_sec),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    fn deps_for(&self, market: Market) -> Result<PipelineDeps> {
        match market {
            Market::Krx => Ok(self.stock.clone()),
            Market::Crypto => self
                .crypto
                .clone()
                .ok_or_else(|| Error::Config("crypto exchange not configured".into())),
        }
    }

    /// Create a session and launch its pipeline task.
    pub async fn start_analysis(
        self: &Arc<Self>,
        ticker: &str,
        market: Market,
        query: Option<String>,
    ) -> Result<String> {
        if ticker.trim().is_empty() {
            return Err(Error::Config("ticker must not be empty".into()));
        }
        let deps = self.deps_for(market)?;

        let session = Session::new(ticker.trim(), market, query);
        let session_id = session.id.clone();
        self.sessions.insert(session).await;
        info!(session_id = %session_id, ticker, %market, "analysis session created");

        self.spawn_run(deps, session_id.clone()).await;
        Ok(session_id)
    }

    async fn spawn_run(self: &Arc<Self>, deps: PipelineDeps, session_id: String) {
        let runner = Arc::clone(self);
        let id_for_task = session_id.clone();
        let handle = tokio::spawn(async move {
            runner.run_with_slot(deps, &id_for_task).await;
        });
        self.tasks.lock().await.insert(session_id, handle);
    }

    async fn run_with_slot(self: &Arc<Self>, deps: PipelineDeps, session_id: &str) {
        let permit = tokio::time::timeout(self.slot_wait, self.slots.clone().acquire_owned()).await;

        let _permit = match permit {
            Ok(Ok(permit)) => permit,
            _ => {
                warn!(session_id, "no analysis slot within deadline");
                self.sessions
                    .update(session_id, |s| {
                        s.log_error("no analysis slot available within the deadline");
                        s.error = Some("analysis capacity exhausted".into());
                        s.set_stage(Stage::Complete);
                    })
                    .await;
                return;
            }
        };

        run_to_approval(
            &deps,
            &self.sessions,
            &self.coordinator,
            &self.notifier,
            session_id,
        )
        .await;

        if let Some(session) = self.sessions.get(session_id).await {
            self.notifier
                .push(NotifyEvent::SessionStage {
                    session_id: session.id.clone(),
                    ticker: session.ticker.clone(),
                    stage: session.stage.to_string(),
                })
                .await;
        }
    }

    /// Approve a suspended proposal: the session resumes into execution
    /// through the coordinator, exactly once.
    pub async fn approve(&self, session_id: &str, quantity: Option<f64>) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| Error::Config(format!("unknown session {session_id}")))?;

        if !session.awaiting_approval {
            return Err(Error::BusinessRule(format!(
                "session {session_id} is not awaiting approval (stage {})",
                session.stage
            )));
        }
        let proposal = session.proposal.clone().ok_or_else(|| {
            Error::BusinessRule(format!("session {session_id} has no proposal"))
        })?;

        self.sessions
            .update(session_id, |s| {
                s.approval_status = Some(ApprovalStatus::Approved);
                s.awaiting_approval = false;
                s.quantity_override = quantity;
                s.set_stage(Stage::Execution);
                s.log(format!(
                    "[approval] approved{}",
                    quantity
                        .map(|q| format!(" with quantity override {q}"))
                        .unwrap_or_default()
                ));
            })
            .await;
        self.persist(session_id).await;

        let plan = self
            .coordinator
            .on_trade_approved(&proposal, quantity)
            .await;

        self.sessions
            .update(session_id, |s| {
                s.log(format!(
                    "[execution] {} units (~{:.0}): {}",
                    plan.quantity, plan.estimated_amount, plan.rationale
                ));
                s.set_stage(Stage::Complete);
            })
            .await;
        self.persist(session_id).await;
        Ok(())
    }

    /// Reject a suspended proposal: the session resets to data collection
    /// and runs again with the feedback attached.
    pub async fn reject(self: &Arc<Self>, session_id: &str, feedback: Option<String>) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| Error::Config(format!("unknown session {session_id}")))?;

        if !session.awaiting_approval {
            return Err(Error::BusinessRule(format!(
                "session {session_id} is not awaiting approval (stage {})",
                session.stage
            )));
        }
        let deps = self.deps_for(session.market)?;

        self.sessions
            .update(session_id, |s| {
                s.approval_status = Some(ApprovalStatus::Rejected);
                s.log("[approval] rejected".to_string());
                s.reset_for_reanalysis(feedback);
            })
            .await;
        self.persist(session_id).await;

        self.spawn_run(deps, session_id.to_string()).await;
        Ok(())
    }

    /// Cancel a session: the pipeline task is aborted and the session is
    /// closed out.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        if let Some(handle) = self.tasks.lock().await.remove(session_id) {
            handle.abort();
        }
        let updated = self
            .sessions
            .update(session_id, |s| {
                s.awaiting_approval = false;
                s.error = Some("cancelled by user".into());
                s.log("[cancelled] session cancelled by user".to_string());
                s.set_stage(Stage::Complete);
            })
            .await;
        if updated.is_none() {
            return Err(Error::Config(format!("unknown session {session_id}")));
        }
        self.persist(session_id).await;
        Ok(())
    }

    pub async fn status(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).await
    }

    async fn persist(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id).await {
            if let Err(e) = self
                .coordinator
                .store()
                .upsert_session(
                    &session.id,
                    &session.ticker,
                    session.market,
                    &session.stage.to_string(),
                    session.reanalyze_count,
                )
                .await
            {
                warn!(session_id, error = %e, "failed to persist session");
            }
        }
    }
}
