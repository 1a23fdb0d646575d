use async_trait::async_trait;

use crate::{Alert, TradeProposal, TradingMode};

/// Events pushed out to operators (Telegram, dashboard WebSocket).
#[derive(Debug, Clone)]
pub enum NotifyEvent {
    /// A session moved to a new stage.
    SessionStage {
        session_id: String,
        ticker: String,
        stage: String,
    },
    /// A proposal is awaiting approval.
    Proposal(TradeProposal),
    /// Risk monitor or order-flow alert.
    Alert(Alert),
    /// System lifecycle transition.
    Lifecycle { mode: TradingMode, reason: String },
}

/// Best-effort fan-out capability. Implementations must not fail the
/// caller: delivery errors are logged and swallowed.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn push(&self, event: NotifyEvent);
}

/// No-op notifier for tests and headless runs.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn push(&self, _event: NotifyEvent) {}
}
