use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use common::{
    AccountSnapshot, ActivityEntry, Alert, AlertAction, AlertKind, ExchangeClient, Market,
    Notifier, NotifyEvent, OrderRequest, OrderResult, OrderSide, Position, PositionStatus,
    QueueStatus, QueuedTrade, Result, RiskParameters, StopLossMode, TradeProposal, TradingMode,
    WatchStatus, WatchedAsset,
};
use risk::{AllocationPlan, PortfolioAgent, RiskMonitor};

use crate::calendar::{now_kst, HolidayCalendar};
use crate::orders::OrderAgent;
use crate::store::{Store, TradeRecord};

const ACTIVITY_LOG_CAP: usize = 200;
const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_secs(30);

/// Everything the coordinator owns. Mutated only under the coordinator's
/// mutex; the API reads serialized snapshots.
pub struct TradingState {
    pub mode: TradingMode,
    pub account: AccountSnapshot,
    pub positions: Vec<Position>,
    pub trade_queue: Vec<QueuedTrade>,
    pub watch_list: Vec<WatchedAsset>,
    pub pending_alerts: Vec<Alert>,
    pub activity_log: VecDeque<ActivityEntry>,
    pub daily_trades_count: u32,
    pub daily_trades_date: NaiveDate,
    pub started_at: Option<chrono::DateTime<Utc>>,
}

impl TradingState {
    fn new() -> Self {
        Self {
            mode: TradingMode::Stopped,
            account: AccountSnapshot::default(),
            positions: Vec::new(),
            trade_queue: Vec::new(),
            watch_list: Vec::new(),
            pending_alerts: Vec::new(),
            activity_log: VecDeque::new(),
            daily_trades_count: 0,
            daily_trades_date: now_kst().date_naive(),
            started_at: None,
        }
    }
}

/// Read-only view of the trading state for the dashboard and WS push.
#[derive(Debug, Clone, Serialize)]
pub struct TradingSnapshot {
    pub mode: TradingMode,
    pub account: AccountSnapshot,
    pub positions: Vec<Position>,
    pub trade_queue: Vec<QueuedTrade>,
    pub watch_list: Vec<WatchedAsset>,
    pub pending_alerts: Vec<Alert>,
    pub activity_log: Vec<ActivityEntry>,
    pub daily_trades_count: u32,
    pub max_daily_trades: u32,
}

/// Central coordinator: lifecycle owner and message broker between the
/// pipeline, the portfolio agent, the order agent and the risk monitor.
///
/// All mutating entry points serialize on the state mutex; pipeline
/// sessions never touch `TradingState` directly.
pub struct Coordinator {
    params: RiskParameters,
    state: Mutex<TradingState>,
    portfolio: PortfolioAgent,
    orders: Arc<OrderAgent>,
    monitor: Arc<RiskMonitor>,
    client: Arc<dyn ExchangeClient>,
    calendar: Arc<HolidayCalendar>,
    store: Store,
    notifier: Arc<dyn Notifier>,
    alert_rx: Mutex<Option<mpsc::Receiver<Alert>>>,
    exit_rx: Mutex<Option<mpsc::Receiver<OrderRequest>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: RiskParameters,
        portfolio: PortfolioAgent,
        orders: Arc<OrderAgent>,
        monitor: Arc<RiskMonitor>,
        client: Arc<dyn ExchangeClient>,
        calendar: Arc<HolidayCalendar>,
        store: Store,
        notifier: Arc<dyn Notifier>,
        alert_rx: mpsc::Receiver<Alert>,
        exit_rx: mpsc::Receiver<OrderRequest>,
    ) -> Self {
        Self {
            params,
            state: Mutex::new(TradingState::new()),
            portfolio,
            orders,
            monitor,
            client,
            calendar,
            store,
            notifier,
            alert_rx: Mutex::new(Some(alert_rx)),
            exit_rx: Mutex::new(Some(exit_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("starting auto-trading system");

        {
            let mut state = self.state.lock().await;
            self.refresh_account(&mut state).await;
            // Rehydrate positions persisted by earlier runs.
            match self.store.load_positions().await {
                Ok(positions) if state.positions.is_empty() => state.positions = positions,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to load persisted positions"),
            }
            state.mode = TradingMode::Active;
            state.started_at = Some(Utc::now());
            Self::log_activity(&mut state, "system", None, "auto-trading started");
        }

        self.monitor.start().await;
        for position in self.positions().await {
            self.monitor.add_position(&position).await;
        }

        self.spawn_pumps().await;

        self.notifier
            .push(NotifyEvent::Lifecycle {
                mode: TradingMode::Active,
                reason: "started".into(),
            })
            .await;
        Ok(())
    }

    pub async fn stop(&self) {
        info!("stopping auto-trading system");
        self.monitor.stop().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let mut state = self.state.lock().await;
        state.mode = TradingMode::Stopped;
        Self::log_activity(&mut state, "system", None, "auto-trading stopped");
        drop(state);

        self.notifier
            .push(NotifyEvent::Lifecycle {
                mode: TradingMode::Stopped,
                reason: "stopped".into(),
            })
            .await;
    }

    pub async fn pause(&self, reason: &str) {
        self.monitor.pause(reason).await;
        let mut state = self.state.lock().await;
        state.mode = TradingMode::Paused;
        Self::log_activity(&mut state, "system", None, format!("paused: {reason}"));
        drop(state);
        self.notifier
            .push(NotifyEvent::Lifecycle {
                mode: TradingMode::Paused,
                reason: reason.into(),
            })
            .await;
    }

    pub async fn resume(&self) {
        self.monitor.resume().await;
        let mut state = self.state.lock().await;
        state.mode = TradingMode::Active;
        Self::log_activity(&mut state, "system", None, "resumed");
        drop(state);
        self.notifier
            .push(NotifyEvent::Lifecycle {
                mode: TradingMode::Active,
                reason: "resumed".into(),
            })
            .await;
    }

    async fn spawn_pumps(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        if let Some(mut alert_rx) = self.alert_rx.lock().await.take() {
            let coordinator = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(alert) = alert_rx.recv().await {
                    coordinator.on_alert(alert).await;
                }
                warn!("alert channel closed");
            }));
        }

        if let Some(mut exit_rx) = self.exit_rx.lock().await.take() {
            let coordinator = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(order) = exit_rx.recv().await {
                    coordinator.handle_monitor_exit(order).await;
                }
                warn!("exit channel closed");
            }));
        }

        // Drain queued trades shortly after each market open.
        let coordinator = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(QUEUE_DRAIN_INTERVAL);
            loop {
                ticker.tick().await;
                if coordinator.mode().await == TradingMode::Active
                    && coordinator.calendar.is_market_open(Market::Krx).await
                {
                    coordinator.drain_trade_queue().await;
                }
            }
        }));
    }

    // ── Trade execution flow ─────────────────────────────────────────────

    /// Handle an approved proposal: gates, allocation, rebalancing sells,
    /// the primary order, and position bookkeeping.
    pub async fn on_trade_approved(
        &self,
        proposal: &TradeProposal,
        quantity_override: Option<f64>,
    ) -> AllocationPlan {
        info!(
            ticker = %proposal.ticker,
            action = %proposal.action,
            entry = proposal.entry_price,
            risk = proposal.risk_score,
            "trade approved"
        );

        if proposal.action.is_no_trade() {
            return AllocationPlan::empty(
                &proposal.ticker,
                proposal.side(),
                proposal.entry_price,
                format!("action '{}' does not trade", proposal.action),
            );
        }

        let mut state = self.state.lock().await;
        Self::roll_daily_counter(&mut state);

        // Mode gate.
        if state.mode != TradingMode::Active {
            warn!(mode = %state.mode, "trading not active, skipping execution");
            return AllocationPlan::empty(
                &proposal.ticker,
                proposal.side(),
                proposal.entry_price,
                format!("trading is {}", state.mode),
            );
        }

        // Daily-limit gate: blocks new buys; exits remain allowed.
        if proposal.action.is_buy() && state.daily_trades_count >= self.params.max_daily_trades {
            warn!("daily trade limit reached");
            return AllocationPlan::empty(
                &proposal.ticker,
                proposal.side(),
                proposal.entry_price,
                "daily trade limit reached",
            );
        }

        // Market-hours gate: closed markets defer into the trade queue.
        if !self.calendar.is_market_open(proposal.market).await {
            let queued = QueuedTrade {
                id: uuid::Uuid::new_v4().to_string(),
                proposal: proposal.clone(),
                quantity_override,
                status: QueueStatus::Pending,
                reason: "market closed".into(),
                queued_at: Utc::now(),
                executed_at: None,
                error: None,
            };
            if let Err(e) = self.store.upsert_queued_trade(&queued).await {
                warn!(error = %e, "failed to persist queued trade");
            }
            Self::log_activity(
                &mut state,
                "order",
                Some(&proposal.ticker),
                "market closed, trade queued",
            );
            state.trade_queue.push(queued);
            return AllocationPlan::empty(
                &proposal.ticker,
                proposal.side(),
                proposal.entry_price,
                "market closed, queued for next open",
            );
        }

        self.refresh_account(&mut state).await;

        let mut allocation = self.portfolio.calculate_allocation(
            &state.account,
            &proposal.ticker,
            Some(&proposal.name),
            proposal.market,
            proposal.side(),
            proposal.entry_price,
            proposal.risk_grade(),
            Some(proposal.position_size_pct).filter(|p| *p > 0.0),
            proposal.stop_loss,
            proposal.take_profit,
            &state.positions,
        );

        if let Some(qty) = quantity_override {
            if qty > 0.0 {
                allocation.quantity = qty;
                allocation.estimated_amount = qty * proposal.entry_price;
                // An override can push past the stock cap; recompute the
                // rebalancing sells for the overridden amount.
                allocation.rebalance_orders = self.portfolio.rebalance_orders_for_amount(
                    &state.account,
                    &state.positions,
                    allocation.estimated_amount,
                );
                allocation
                    .rationale
                    .push_str(&format!(" (quantity override: {qty})"));
            }
        }

        if allocation.quantity <= 0.0 {
            warn!(rationale = %allocation.rationale, "allocation returned zero quantity");
            Self::log_activity(
                &mut state,
                "portfolio",
                Some(&proposal.ticker),
                allocation.rationale.clone(),
            );
            return allocation;
        }

        Self::log_activity(
            &mut state,
            "portfolio",
            Some(&proposal.ticker),
            format!(
                "allocation: {} units (~{:.0}, {:.1}% of equity)",
                allocation.quantity, allocation.estimated_amount, allocation.position_pct
            ),
        );

        // Rebalancing sells must land before the buy.
        for rebalance in allocation.rebalance_orders.clone() {
            info!(ticker = %rebalance.ticker, qty = rebalance.quantity, "executing rebalance sell");
            let result = self
                .execute_order_locked(&mut state, rebalance.clone(), None)
                .await;
            if result.filled_quantity > 0.0 {
                self.apply_sell_fill(&mut state, &rebalance.ticker, result.filled_quantity)
                    .await;
            }
        }

        let order = OrderRequest {
            ticker: proposal.ticker.clone(),
            name: Some(proposal.name.clone()),
            market: proposal.market,
            side: allocation.side,
            quantity: allocation.quantity,
            price: Some(proposal.entry_price),
            order_type: common::OrderType::Limit,
            session_id: Some(proposal.id.clone()),
            reason: Some(format!("trade approval (risk {:.2})", proposal.risk_score)),
        };

        let result = self
            .execute_order_locked(&mut state, order, Some(proposal.id.clone()))
            .await;

        if result.filled_quantity > 0.0 {
            match allocation.side {
                OrderSide::Buy => {
                    let position = self.apply_buy_fill(&mut state, proposal, &result).await;
                    self.monitor.add_position(&position).await;
                }
                OrderSide::Sell => {
                    self.apply_sell_fill(&mut state, &proposal.ticker, result.filled_quantity)
                        .await;
                }
            }
        }

        allocation
    }

    /// Execute one order while holding the state lock. Updates the daily
    /// counter and the trade ledger.
    async fn execute_order_locked(
        &self,
        state: &mut TradingState,
        order: OrderRequest,
        session_id: Option<String>,
    ) -> OrderResult {
        let requested_price = order.price.unwrap_or(0.0);
        let order_type = match order.order_type {
            common::OrderType::Limit => "limit",
            common::OrderType::Market => "market",
        };

        let result = self.orders.execute_order(order.clone(), true).await;

        if result.filled_quantity > 0.0 {
            Self::roll_daily_counter(state);
            state.daily_trades_count += 1;
        }

        let record = TradeRecord::from_result(&result, session_id, requested_price, order_type);
        if let Err(e) = self.store.record_trade(&record).await {
            warn!(error = %e, "failed to persist trade");
        }

        Self::log_activity(
            state,
            "order",
            Some(&result.ticker),
            format!(
                "{} {} filled {}/{} @ {:.0} ({})",
                result.side,
                result.ticker,
                result.filled_quantity,
                result.requested_quantity,
                result.avg_price,
                result.status
            ),
        );

        result
    }

    /// Merge a buy fill into the position book (at most one position per
    /// ticker; averages are cost-weighted) and persist.
    async fn apply_buy_fill(
        &self,
        state: &mut TradingState,
        proposal: &TradeProposal,
        result: &OrderResult,
    ) -> Position {
        let position = if let Some(existing) = state
            .positions
            .iter_mut()
            .find(|p| p.ticker == proposal.ticker)
        {
            let total_qty = existing.quantity + result.filled_quantity;
            let total_cost = existing.avg_price * existing.quantity
                + result.avg_price * result.filled_quantity;
            existing.quantity = total_qty;
            existing.avg_price = total_cost / total_qty;
            existing.current_price = result.avg_price;
            existing.last_updated = Utc::now();
            if proposal.stop_loss.is_some() {
                existing.stop_loss = proposal.stop_loss;
            }
            if proposal.take_profit.is_some() {
                existing.take_profit = proposal.take_profit;
            }
            existing.clone()
        } else {
            let position = Position {
                ticker: proposal.ticker.clone(),
                name: proposal.name.clone(),
                market: proposal.market,
                quantity: result.filled_quantity,
                avg_price: result.avg_price,
                current_price: result.avg_price,
                stop_loss: proposal.stop_loss,
                take_profit: proposal.take_profit,
                stop_loss_mode: self.params.stop_loss_mode,
                status: PositionStatus::Filled,
                risk_score: proposal.risk_score,
                session_id: Some(proposal.id.clone()),
                opened_at: Utc::now(),
                last_updated: Utc::now(),
            };
            state.positions.push(position.clone());
            position
        };

        if let Err(e) = self.store.upsert_position(&position).await {
            warn!(error = %e, "failed to persist position");
        }
        info!(ticker = %position.ticker, qty = position.quantity, avg = position.avg_price, "position added/updated");
        position
    }

    /// Shrink or remove a position after a sell fill.
    async fn apply_sell_fill(&self, state: &mut TradingState, ticker: &str, sold_quantity: f64) {
        let mut remove = false;
        if let Some(position) = state.positions.iter_mut().find(|p| p.ticker == ticker) {
            position.quantity -= sold_quantity;
            position.last_updated = Utc::now();
            if position.quantity <= f64::EPSILON {
                remove = true;
            } else if let Err(e) = self.store.upsert_position(position).await {
                warn!(error = %e, "failed to persist position");
            }
        }
        if remove {
            state.positions.retain(|p| p.ticker != ticker);
            self.monitor.remove_position(ticker).await;
            if let Err(e) = self.store.delete_position(ticker).await {
                warn!(error = %e, "failed to delete position");
            }
            info!(ticker, "position closed");
        }
    }

    /// Auto-execution requested by the risk monitor (stop-loss or
    /// take-profit in auto mode).
    async fn handle_monitor_exit(&self, order: OrderRequest) {
        let ticker = order.ticker.clone();
        let mut state = self.state.lock().await;
        let result = self.execute_order_locked(&mut state, order, None).await;

        if result.filled_quantity > 0.0 {
            self.apply_sell_fill(&mut state, &ticker, result.filled_quantity)
                .await;
            drop(state);
            self.notifier
                .push(NotifyEvent::Alert(
                    Alert::new(
                        AlertKind::OrderFilled,
                        format!("Exit Executed: {ticker}"),
                        format!(
                            "sold {} units at {:.0}",
                            result.filled_quantity, result.avg_price
                        ),
                    )
                    .for_ticker(ticker),
                ))
                .await;
        } else {
            Self::log_activity(
                &mut state,
                "risk",
                Some(&ticker),
                format!(
                    "auto-exit failed: {}",
                    result.message.as_deref().unwrap_or("unknown")
                ),
            );
            drop(state);
            self.notifier
                .push(NotifyEvent::Alert(
                    Alert::new(
                        AlertKind::OrderFailed,
                        format!("Exit Failed: {ticker}"),
                        result.message.unwrap_or_else(|| "order rejected".into()),
                    )
                    .for_ticker(ticker),
                ))
                .await;
        }
    }

    /// Alert fan-in from the risk monitor.
    async fn on_alert(&self, alert: Alert) {
        {
            let mut state = self.state.lock().await;
            Self::log_activity(
                &mut state,
                "risk",
                alert.ticker.as_deref(),
                format!("{}: {}", alert.kind, alert.message),
            );
            if alert.action_required {
                state.pending_alerts.push(alert.clone());
            }
            if alert.kind == AlertKind::TradingPaused {
                state.mode = TradingMode::Paused;
            } else if alert.kind == AlertKind::TradingResumed {
                state.mode = TradingMode::Active;
            }
        }
        self.notifier.push(NotifyEvent::Alert(alert)).await;
    }

    // ── Alert actions ────────────────────────────────────────────────────

    /// Dispatch a user's response to an actionable alert. The alert is
    /// resolved in every branch.
    pub async fn handle_alert_action(
        &self,
        alert_id: &str,
        action: AlertAction,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        let alert = {
            let mut state = self.state.lock().await;
            let idx = state.pending_alerts.iter().position(|a| a.id == alert_id);
            match idx {
                Some(idx) => state.pending_alerts.remove(idx),
                None => {
                    warn!(alert_id, "alert not found");
                    return Ok(());
                }
            }
        };

        info!(alert_id, action = ?action, ticker = ?alert.ticker, "handling alert action");

        match action {
            AlertAction::Resume => self.resume().await,
            AlertAction::ClosePosition => {
                if let Some(ticker) = &alert.ticker {
                    self.close_position(ticker).await;
                }
            }
            AlertAction::AdjustStopLoss => {
                if let (Some(ticker), Some(data)) = (&alert.ticker, &data) {
                    if let Some(new_stop) = data.get("stop_loss").and_then(|v| v.as_f64()) {
                        self.monitor.update_stop_loss(ticker, new_stop).await;
                        let snapshot = {
                            let mut state = self.state.lock().await;
                            state
                                .positions
                                .iter_mut()
                                .find(|p| &p.ticker == ticker)
                                .map(|pos| {
                                    pos.stop_loss = Some(new_stop);
                                    pos.clone()
                                })
                        };
                        if let Some(snapshot) = snapshot {
                            if let Err(e) = self.store.upsert_position(&snapshot).await {
                                warn!(error = %e, "failed to persist stop-loss change");
                            }
                        }
                    }
                }
            }
            AlertAction::ExecuteStopLoss | AlertAction::ExecuteTakeProfit => {
                if let Some(ticker) = &alert.ticker {
                    if let Some(entry) = self.monitor.watch_entry(ticker).await {
                        let price = if entry.last_price > 0.0 {
                            entry.last_price
                        } else {
                            entry.entry_price
                        };
                        let reason = if action == AlertAction::ExecuteStopLoss {
                            "user-confirmed stop-loss"
                        } else {
                            "user-confirmed take-profit"
                        };
                        let order = OrderRequest::limit(
                            ticker.clone(),
                            entry.market,
                            OrderSide::Sell,
                            entry.quantity,
                            price,
                        )
                        .with_reason(reason);

                        let mut state = self.state.lock().await;
                        let result = self.execute_order_locked(&mut state, order, None).await;
                        if result.filled_quantity > 0.0 {
                            self.apply_sell_fill(&mut state, ticker, result.filled_quantity)
                                .await;
                        }
                    }
                }
            }
            AlertAction::Hold => {}
        }

        self.monitor.resolve_alert(alert_id).await;
        Ok(())
    }

    /// Sell a full position at the current price.
    pub async fn close_position(&self, ticker: &str) {
        let mut state = self.state.lock().await;
        let Some(position) = state.positions.iter().find(|p| p.ticker == ticker).cloned() else {
            warn!(ticker, "position not found");
            return;
        };

        let order = OrderRequest::limit(
            ticker.to_string(),
            position.market,
            OrderSide::Sell,
            position.quantity,
            position.current_price,
        )
        .with_reason("user-initiated close");

        let result = self.execute_order_locked(&mut state, order, None).await;
        if result.filled_quantity > 0.0 {
            self.apply_sell_fill(&mut state, ticker, result.filled_quantity)
                .await;
        }
    }

    // ── Trade queue ──────────────────────────────────────────────────────

    /// Re-enter queued trades in FIFO order once the market opens.
    pub async fn drain_trade_queue(&self) {
        let pending: Vec<QueuedTrade> = {
            let mut state = self.state.lock().await;
            let pending: Vec<QueuedTrade> = state
                .trade_queue
                .iter()
                .filter(|q| q.status == QueueStatus::Pending)
                .cloned()
                .collect();
            for queued in state.trade_queue.iter_mut() {
                if queued.status == QueueStatus::Pending {
                    queued.status = QueueStatus::Processing;
                }
            }
            pending
        };

        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "draining trade queue");

        for queued in pending {
            let plan = self
                .on_trade_approved(&queued.proposal, queued.quantity_override)
                .await;

            let snapshot = {
                let mut state = self.state.lock().await;
                state
                    .trade_queue
                    .iter_mut()
                    .find(|q| q.id == queued.id)
                    .map(|entry| {
                        if plan.quantity > 0.0 {
                            entry.status = QueueStatus::Completed;
                            entry.executed_at = Some(Utc::now());
                        } else if plan.rationale.contains("queued") {
                            // Market closed again mid-drain; retry next open.
                            entry.status = QueueStatus::Pending;
                        } else {
                            entry.status = QueueStatus::Failed;
                            entry.error = Some(plan.rationale.clone());
                        }
                        entry.clone()
                    })
            };
            if let Some(snapshot) = snapshot {
                if let Err(e) = self.store.upsert_queued_trade(&snapshot).await {
                    warn!(error = %e, "failed to persist queue update");
                }
            }
        }
    }

    // ── Watch list ───────────────────────────────────────────────────────

    pub async fn add_to_watch_list(&self, watch: WatchedAsset) {
        if let Err(e) = self.store.upsert_watch(&watch).await {
            warn!(error = %e, "failed to persist watch entry");
        }
        let mut state = self.state.lock().await;
        Self::log_activity(
            &mut state,
            "strategy",
            Some(&watch.ticker),
            format!("added to watch list ({} @ {:.2})", watch.signal, watch.confidence),
        );
        // One active watch entry per ticker.
        state
            .watch_list
            .retain(|w| w.ticker != watch.ticker || w.status != WatchStatus::Active);
        state.watch_list.push(watch);
    }

    pub async fn remove_from_watch_list(&self, watch_id: &str) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state
                .watch_list
                .iter_mut()
                .find(|w| w.id == watch_id)
                .map(|watch| {
                    watch.status = WatchStatus::Removed;
                    watch.clone()
                })
        };
        if let Some(snapshot) = snapshot {
            if let Err(e) = self.store.upsert_watch(&snapshot).await {
                warn!(error = %e, "failed to persist watch removal");
            }
        }
    }

    // ── Account & accessors ──────────────────────────────────────────────

    async fn refresh_account(&self, state: &mut TradingState) {
        match self.client.get_account_balance().await {
            Ok(balance) => {
                state.account = balance.snapshot();
                // Keep mark prices fresh for position sizing.
                for position in state.positions.iter_mut() {
                    if let Some(holding) = balance.holding(&position.ticker) {
                        position.current_price = holding.current_price;
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to refresh account"),
        }
    }

    fn roll_daily_counter(state: &mut TradingState) {
        let today = now_kst().date_naive();
        if state.daily_trades_date != today {
            info!(
                previous = %state.daily_trades_date,
                trades = state.daily_trades_count,
                "daily trade counter reset"
            );
            state.daily_trades_date = today;
            state.daily_trades_count = 0;
        }
    }

    fn log_activity(
        state: &mut TradingState,
        agent: &'static str,
        ticker: Option<&str>,
        message: impl Into<String>,
    ) {
        if state.activity_log.len() >= ACTIVITY_LOG_CAP {
            state.activity_log.pop_front();
        }
        state.activity_log.push_back(ActivityEntry {
            agent,
            ticker: ticker.map(str::to_string),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub async fn mode(&self) -> TradingMode {
        self.state.lock().await.mode
    }

    pub async fn positions(&self) -> Vec<Position> {
        self.state.lock().await.positions.clone()
    }

    pub async fn pending_alerts(&self) -> Vec<Alert> {
        self.state.lock().await.pending_alerts.clone()
    }

    pub async fn daily_trades_count(&self) -> u32 {
        self.state.lock().await.daily_trades_count
    }

    pub fn risk_params(&self) -> &RiskParameters {
        &self.params
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn snapshot(&self) -> TradingSnapshot {
        let state = self.state.lock().await;
        TradingSnapshot {
            mode: state.mode,
            account: state.account,
            positions: state.positions.clone(),
            trade_queue: state.trade_queue.clone(),
            watch_list: state.watch_list.clone(),
            pending_alerts: state.pending_alerts.clone(),
            activity_log: state.activity_log.iter().cloned().collect(),
            daily_trades_count: state.daily_trades_count,
            max_daily_trades: self.params.max_daily_trades,
        }
    }

    /// The default stop-loss mode new positions inherit.
    pub fn stop_loss_mode(&self) -> StopLossMode {
        self.params.stop_loss_mode
    }
}
