pub mod commands;

use async_trait::async_trait;
use teloxide::types::ChatId;
use teloxide::Bot;

use common::{AlertKind, Notifier, NotifyEvent};

pub use commands::{start_bot, BotDeps, Command};

/// Telegram implementation of the notifier capability: alerts, proposals
/// and lifecycle changes become operator messages. Best effort only.
pub struct TelegramNotifier {
    bot: Bot,
    chat_ids: Vec<ChatId>,
}

impl TelegramNotifier {
    pub fn new(token: &str, user_ids: &[i64]) -> Self {
        Self {
            bot: Bot::new(token),
            chat_ids: user_ids.iter().map(|&id| ChatId(id)).collect(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn push(&self, event: NotifyEvent) {
        let message = match event {
            NotifyEvent::SessionStage {
                ticker, stage, ..
            } => format!("🔎 {ticker}: analysis moved to {stage}"),
            NotifyEvent::Proposal(p) => format!(
                "📋 Trade proposal: {} {} {:.4} @ {:.0}\n\
                 stop {:.0} / target {:.0} (risk {:.0}%)\n\n{}",
                p.action,
                p.ticker,
                p.quantity,
                p.entry_price,
                p.stop_loss.unwrap_or(0.0),
                p.take_profit.unwrap_or(0.0),
                p.risk_score * 100.0,
                truncate(&p.rationale, 300),
            ),
            NotifyEvent::Alert(alert) => {
                let icon = match alert.kind {
                    AlertKind::StopLossTriggered => "⚠️",
                    AlertKind::TakeProfitTriggered => "✅",
                    AlertKind::SuddenMoveUp | AlertKind::SuddenMoveDown => "🚨",
                    AlertKind::TradingPaused => "⏸",
                    AlertKind::TradingResumed => "▶️",
                    AlertKind::OrderFilled => "💰",
                    AlertKind::OrderFailed => "❌",
                    AlertKind::RebalanceSuggested => "⚖️",
                };
                format!("{icon} {}\n{}", alert.title, alert.message)
            }
            NotifyEvent::Lifecycle { mode, reason } => {
                format!("🤖 system is now {mode} ({reason})")
            }
        };

        commands::send_to_all(&self.bot, &self.chat_ids, &message).await;
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
