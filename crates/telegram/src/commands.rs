use std::sync::Arc;

use teloxide::{dispatching::UpdateHandler, prelude::*, utils::command::BotCommands};
use tracing::{info, warn};

use common::TradingMode;
use engine::Coordinator;

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Dependencies injected into every handler via `dptree`.
#[derive(Clone)]
pub struct BotDeps {
    pub coordinator: Arc<Coordinator>,
    pub allowed_user_ids: Arc<Vec<i64>>,
}

/// Telegram bot commands exposed to the operator.
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "HanBot commands:")]
pub enum Command {
    #[command(description = "Start auto-trading")]
    Start,
    #[command(description = "Stop auto-trading")]
    Stop,
    #[command(description = "Pause trading (positions stay monitored)")]
    Pause,
    #[command(description = "Resume trading after a pause")]
    Resume,
    #[command(description = "Show system status and portfolio summary")]
    Status,
}

/// Start the Telegram bot in long-polling mode.
pub async fn start_bot(token: String, deps: BotDeps) {
    let bot = Bot::new(token);
    let deps = Arc::new(deps);

    info!("Telegram bot starting (long-polling)");

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![deps])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

fn schema() -> UpdateHandler<Box<dyn std::error::Error + Send + Sync>> {
    use dptree::case;

    let command_handler = teloxide::filter_command::<Command, _>()
        .branch(case![Command::Start].endpoint(handle_start))
        .branch(case![Command::Stop].endpoint(handle_stop))
        .branch(case![Command::Pause].endpoint(handle_pause))
        .branch(case![Command::Resume].endpoint(handle_resume))
        .branch(case![Command::Status].endpoint(handle_status));

    Update::filter_message()
        .filter_map(|msg: Message| msg.from().map(|u| u.id))
        .filter_async(auth_filter)
        .branch(command_handler)
}

/// Silently drop messages from users not in the allowed list.
async fn auth_filter(user_id: UserId, deps: Arc<BotDeps>) -> bool {
    let uid = user_id.0 as i64;
    let allowed = deps.allowed_user_ids.contains(&uid);
    if !allowed {
        warn!(user_id = uid, "unauthorized Telegram access attempt");
    }
    allowed
}

async fn handle_start(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    if deps.coordinator.mode().await == TradingMode::Active {
        bot.send_message(msg.chat.id, "Already running.").await?;
    } else {
        match deps.coordinator.start().await {
            Ok(()) => {
                bot.send_message(msg.chat.id, "Auto-trading started.").await?;
            }
            Err(e) => {
                bot.send_message(msg.chat.id, format!("Start failed: {e}"))
                    .await?;
            }
        }
    }
    Ok(())
}

async fn handle_stop(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    if deps.coordinator.mode().await == TradingMode::Stopped {
        bot.send_message(msg.chat.id, "Already stopped.").await?;
    } else {
        deps.coordinator.stop().await;
        bot.send_message(msg.chat.id, "Auto-trading stopped.").await?;
    }
    Ok(())
}

async fn handle_pause(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    deps.coordinator.pause("operator pause via Telegram").await;
    bot.send_message(msg.chat.id, "Trading paused. Use /resume to continue.")
        .await?;
    Ok(())
}

async fn handle_resume(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    deps.coordinator.resume().await;
    bot.send_message(msg.chat.id, "Trading resumed.").await?;
    Ok(())
}

async fn handle_status(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    let snapshot = deps.coordinator.snapshot().await;
    let mut text = format!(
        "HanBot Status\n\
         Mode: {}\n\
         Equity: {:.0}\n\
         Cash: {:.0} ({:.0}%)\n\
         Trades today: {}/{}\n\
         Positions: {}",
        snapshot.mode,
        snapshot.account.total_equity,
        snapshot.account.available_cash,
        snapshot.account.cash_ratio() * 100.0,
        snapshot.daily_trades_count,
        snapshot.max_daily_trades,
        snapshot.positions.len(),
    );
    for p in snapshot.positions.iter().take(10) {
        text.push_str(&format!(
            "\n  {} x{:.0} @ {:.0} ({:+.1}%)",
            p.ticker,
            p.quantity,
            p.avg_price,
            p.unrealized_pnl_pct()
        ));
    }
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

/// Send a proactive message to all configured chat IDs.
pub async fn send_to_all(bot: &Bot, chat_ids: &[ChatId], message: &str) {
    for &chat_id in chat_ids {
        if let Err(e) = bot.send_message(chat_id, message).await {
            warn!(chat_id = ?chat_id, error = %e, "failed to send Telegram message");
        }
    }
}
