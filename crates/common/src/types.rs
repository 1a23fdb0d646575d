use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Market an asset trades on. Drives session hours, tick rules and which
/// upstream client handles the order flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum Market {
    /// Korea Exchange listed stocks (09:00-15:30 KST).
    Krx,
    /// KRW-quoted crypto pairs, open 24/7.
    Crypto,
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Market::Krx => write!(f, "krx"),
            Market::Crypto => write!(f, "crypto"),
        }
    }
}

/// Analysis signal emitted by each agent and by the consensus vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl Signal {
    pub fn is_buyish(&self) -> bool {
        matches!(self, Signal::StrongBuy | Signal::Buy)
    }

    pub fn is_sellish(&self) -> bool {
        matches!(self, Signal::StrongSell | Signal::Sell)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::StrongBuy => write!(f, "strong_buy"),
            Signal::Buy => write!(f, "buy"),
            Signal::Hold => write!(f, "hold"),
            Signal::Sell => write!(f, "sell"),
            Signal::StrongSell => write!(f, "strong_sell"),
        }
    }
}

/// Action the synthesis stage proposes, after mapping the consensus signal
/// against the current position state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
    /// Add to an existing position.
    Add,
    /// Sell roughly half of an existing position.
    Reduce,
    /// No position, weak signal — track on the watch list.
    Watch,
    /// No position, strong negative signal — do not buy.
    Avoid,
}

impl TradeAction {
    /// Buy-side order flow (new buy or add-on).
    pub fn is_buy(&self) -> bool {
        matches!(self, TradeAction::Buy | TradeAction::Add)
    }

    /// Sell-side order flow (full or partial exit).
    pub fn is_sell(&self) -> bool {
        matches!(self, TradeAction::Sell | TradeAction::Reduce)
    }

    /// Actions that never reach the order agent.
    pub fn is_no_trade(&self) -> bool {
        matches!(
            self,
            TradeAction::Hold | TradeAction::Watch | TradeAction::Avoid
        )
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
            TradeAction::Hold => "hold",
            TradeAction::Add => "add",
            TradeAction::Reduce => "reduce",
            TradeAction::Watch => "watch",
            TradeAction::Avoid => "avoid",
        };
        write!(f, "{s}")
    }
}

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Terminal and in-flight order states reported by the order agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Rejected,
    Cancelled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle of a managed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum PositionStatus {
    Pending,
    Partial,
    Filled,
    Closing,
    Closed,
}

/// Whether stop-loss / take-profit triggers sell immediately or ask first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum StopLossMode {
    UserApproval,
    Auto,
}

/// Operating mode of the whole trading system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Stopped,
    Active,
    Paused,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Stopped => write!(f, "stopped"),
            TradingMode::Active => write!(f, "active"),
            TradingMode::Paused => write!(f, "paused"),
        }
    }
}

/// Which agent produced an analysis result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Technical,
    Fundamental,
    /// Crypto counterpart of fundamental analysis (24h flow, orderbook skew).
    Market,
    Sentiment,
    Risk,
}

impl std::fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnalysisKind::Technical => "technical",
            AnalysisKind::Fundamental => "fundamental",
            AnalysisKind::Market => "market",
            AnalysisKind::Sentiment => "sentiment",
            AnalysisKind::Risk => "risk",
        };
        write!(f, "{s}")
    }
}

/// Output of a single analysis agent. Immutable once written into a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub kind: AnalysisKind,
    pub ticker: String,
    pub name: String,
    pub signal: Signal,
    /// Clamped to [0.30, 0.95] by the scoring layer.
    pub confidence: f64,
    pub summary: String,
    pub reasoning: String,
    /// At most five short factor strings extracted from the reasoner text.
    pub key_factors: Vec<String>,
    /// Structured indicator values (rsi, trend, risk_score, ...).
    pub indicators: BTreeMap<String, serde_json::Value>,
}

impl AnalysisResult {
    pub fn indicator_f64(&self, key: &str) -> Option<f64> {
        self.indicators.get(key).and_then(|v| v.as_f64())
    }
}

/// A position owned and tracked by the coordinator. At most one per ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub name: String,
    pub market: Market,
    pub quantity: f64,
    pub avg_price: f64,
    pub current_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub stop_loss_mode: StopLossMode,
    pub status: PositionStatus,
    /// Risk score of the analysis that opened the position, in [0, 1].
    pub risk_score: f64,
    pub session_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    pub fn market_value(&self) -> f64 {
        self.quantity * self.current_price
    }

    /// Unrealized P&L in account currency. Derived, never stored.
    pub fn unrealized_pnl(&self) -> f64 {
        (self.current_price - self.avg_price) * self.quantity
    }

    /// Unrealized P&L as a percentage of cost.
    pub fn unrealized_pnl_pct(&self) -> f64 {
        if self.avg_price <= 0.0 {
            return 0.0;
        }
        (self.current_price - self.avg_price) / self.avg_price * 100.0
    }
}

/// Proposal produced by the synthesis stage, pending human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    pub id: String,
    pub ticker: String,
    pub name: String,
    pub market: Market,
    pub action: TradeAction,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Risk score in [0, 1].
    pub risk_score: f64,
    /// Target share of equity for this position, percent.
    pub position_size_pct: f64,
    pub rationale: String,
    pub bull_case: String,
    pub bear_case: String,
    pub analyses: Vec<AnalysisResult>,
    pub created_at: DateTime<Utc>,
}

impl TradeProposal {
    /// Risk on a 1-10 grade, used by the portfolio sizing rules.
    pub fn risk_grade(&self) -> u8 {
        ((self.risk_score * 10.0).round() as i64).clamp(1, 10) as u8
    }

    pub fn side(&self) -> OrderSide {
        if self.action.is_sell() {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }
}

/// Account balance snapshot. Refreshed on demand, cached only briefly.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_equity: f64,
    pub available_cash: f64,
    pub total_stock_value: f64,
}

impl AccountSnapshot {
    pub fn cash_ratio(&self) -> f64 {
        if self.total_equity <= 0.0 {
            return 1.0;
        }
        self.available_cash / self.total_equity
    }

    pub fn stock_ratio(&self) -> f64 {
        if self.total_equity <= 0.0 {
            return 0.0;
        }
        self.total_stock_value / self.total_equity
    }
}

/// Order handed to the order agent for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub ticker: String,
    pub name: Option<String>,
    pub market: Market,
    pub side: OrderSide,
    pub quantity: f64,
    /// `None` = market order; `Some(price)` = limit order.
    pub price: Option<f64>,
    pub order_type: OrderType,
    pub session_id: Option<String>,
    pub reason: Option<String>,
}

impl OrderRequest {
    pub fn limit(
        ticker: impl Into<String>,
        market: Market,
        side: OrderSide,
        quantity: f64,
        price: f64,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            name: None,
            market,
            side,
            quantity,
            price: Some(price),
            order_type: OrderType::Limit,
            session_id: None,
            reason: None,
        }
    }

    pub fn market_order(
        ticker: impl Into<String>,
        market: Market,
        side: OrderSide,
        quantity: f64,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            name: None,
            market,
            side,
            quantity,
            price: None,
            order_type: OrderType::Market,
            session_id: None,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Aggregated outcome of executing an order (possibly in several splits).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub ticker: String,
    pub side: OrderSide,
    pub requested_quantity: f64,
    pub filled_quantity: f64,
    pub avg_price: f64,
    pub status: OrderStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl OrderResult {
    pub fn is_filled(&self) -> bool {
        self.filled_quantity >= self.requested_quantity && self.requested_quantity > 0.0
    }

    pub fn total_value(&self) -> f64 {
        self.filled_quantity * self.avg_price
    }

    /// Rejection shell used by every failure path of the order agent.
    pub fn rejected(
        req: &OrderRequest,
        order_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            ticker: req.ticker.clone(),
            side: req.side,
            requested_quantity: req.quantity,
            filled_quantity: 0.0,
            avg_price: 0.0,
            status: OrderStatus::Rejected,
            message: Some(message.into()),
            created_at: Utc::now(),
            filled_at: None,
        }
    }
}

/// Alert raised by the risk monitor or order flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub ticker: Option<String>,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    pub action_required: bool,
    pub options: Vec<AlertAction>,
    pub acknowledged: bool,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            kind,
            ticker: None,
            title: title.into(),
            message: message.into(),
            data: serde_json::Value::Null,
            action_required: false,
            options: Vec::new(),
            acknowledged: false,
            resolved: false,
            created_at: Utc::now(),
        }
    }

    pub fn for_ticker(mut self, ticker: impl Into<String>) -> Self {
        self.ticker = Some(ticker.into());
        self
    }

    pub fn with_options(mut self, options: Vec<AlertAction>) -> Self {
        self.action_required = true;
        self.options = options;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    StopLossTriggered,
    TakeProfitTriggered,
    SuddenMoveUp,
    SuddenMoveDown,
    TradingPaused,
    TradingResumed,
    OrderFilled,
    OrderFailed,
    RebalanceSuggested,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertKind::StopLossTriggered => "stop_loss_triggered",
            AlertKind::TakeProfitTriggered => "take_profit_triggered",
            AlertKind::SuddenMoveUp => "sudden_move_up",
            AlertKind::SuddenMoveDown => "sudden_move_down",
            AlertKind::TradingPaused => "trading_paused",
            AlertKind::TradingResumed => "trading_resumed",
            AlertKind::OrderFilled => "order_filled",
            AlertKind::OrderFailed => "order_failed",
            AlertKind::RebalanceSuggested => "rebalance_suggested",
        };
        write!(f, "{s}")
    }
}

/// User response options attached to an actionable alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    Resume,
    ClosePosition,
    AdjustStopLoss,
    ExecuteStopLoss,
    ExecuteTakeProfit,
    Hold,
}

impl std::str::FromStr for AlertAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resume" => Ok(AlertAction::Resume),
            "close_position" => Ok(AlertAction::ClosePosition),
            "adjust_stop_loss" => Ok(AlertAction::AdjustStopLoss),
            "execute_stop_loss" => Ok(AlertAction::ExecuteStopLoss),
            "execute_take_profit" => Ok(AlertAction::ExecuteTakeProfit),
            "hold" => Ok(AlertAction::Hold),
            other => Err(format!("unknown alert action '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// Approved trade deferred because its market was closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTrade {
    pub id: String,
    pub proposal: TradeProposal,
    pub quantity_override: Option<f64>,
    pub status: QueueStatus,
    pub reason: String,
    pub queued_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum WatchStatus {
    Active,
    Triggered,
    Removed,
    Converted,
}

/// An asset the pipeline recommended watching instead of trading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedAsset {
    pub id: String,
    pub session_id: String,
    pub ticker: String,
    pub name: String,
    pub market: Market,
    pub signal: Signal,
    pub confidence: f64,
    pub current_price: f64,
    pub target_entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub summary: String,
    pub status: WatchStatus,
    pub added_at: DateTime<Utc>,
}

/// One line of the coordinator's bounded activity log.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub agent: &'static str,
    pub ticker: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// ─── Market data records ─────────────────────────────────────────────────────

/// Basic quote + valuation snapshot for one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetInfo {
    pub ticker: String,
    pub name: String,
    pub market: Market,
    pub price: f64,
    /// Change versus the previous close (stocks) or 24h (crypto), percent.
    pub change_pct: f64,
    pub volume: f64,
    /// Today's volume relative to the recent average, if known.
    pub volume_ratio: Option<f64>,
    pub per: Option<f64>,
    pub pbr: Option<f64>,
    pub eps: Option<f64>,
    pub market_cap: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderbookLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orderbook {
    pub ticker: String,
    pub bids: Vec<OrderbookLevel>,
    pub asks: Vec<OrderbookLevel>,
}

impl Orderbook {
    /// Total bid quantity over total ask quantity; 1.0 when empty.
    pub fn bid_ask_ratio(&self) -> f64 {
        let bid: f64 = self.bids.iter().map(|l| l.quantity).sum();
        let ask: f64 = self.asks.iter().map(|l| l.quantity).sum();
        if ask <= 0.0 {
            return 1.0;
        }
        bid / ask
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }
}

/// Daily OHLCV bar. Chart responses are ordered newest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Cash available for new orders.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CashBalance {
    pub available_cash: f64,
    pub orderable_cash: f64,
}

/// One held asset inside an account balance response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub ticker: String,
    pub name: String,
    pub quantity: f64,
    pub avg_price: f64,
    pub current_price: f64,
    pub eval_amount: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total_equity: f64,
    pub available_cash: f64,
    pub total_eval_amount: f64,
    pub holdings: Vec<Holding>,
}

impl AccountBalance {
    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            total_equity: self.total_equity,
            available_cash: self.available_cash,
            total_stock_value: self.total_eval_amount,
        }
    }

    pub fn holding(&self, ticker: &str) -> Option<&Holding> {
        self.holdings.iter().find(|h| h.ticker == ticker)
    }
}

/// Unfilled order reported by the upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub ticker: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub price: f64,
}

/// Completed execution reported by the upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilledOrder {
    pub order_id: String,
    pub ticker: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub executed_at: DateTime<Utc>,
}

/// Acknowledgement returned by order placement / modification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// Live price update published by a ticker stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub ticker: String,
    pub price: f64,
    pub change_pct: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(avg: f64, cur: f64, qty: f64) -> Position {
        Position {
            ticker: "005930".into(),
            name: "Samsung Electronics".into(),
            market: Market::Krx,
            quantity: qty,
            avg_price: avg,
            current_price: cur,
            stop_loss: None,
            take_profit: None,
            stop_loss_mode: StopLossMode::UserApproval,
            status: PositionStatus::Filled,
            risk_score: 0.3,
            session_id: None,
            opened_at: Utc::now(),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn unrealized_pnl_is_derived() {
        let p = position(50_000.0, 55_000.0, 10.0);
        assert_eq!(p.unrealized_pnl(), 50_000.0);
        assert!((p.unrealized_pnl_pct() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_pct_zero_cost_is_zero() {
        let p = position(0.0, 55_000.0, 10.0);
        assert_eq!(p.unrealized_pnl_pct(), 0.0);
    }

    #[test]
    fn risk_grade_clamps_to_one_through_ten() {
        let mut proposal = TradeProposal {
            id: "t".into(),
            ticker: "005930".into(),
            name: "Samsung Electronics".into(),
            market: Market::Krx,
            action: TradeAction::Buy,
            quantity: 1.0,
            entry_price: 50_000.0,
            stop_loss: None,
            take_profit: None,
            risk_score: 0.0,
            position_size_pct: 5.0,
            rationale: String::new(),
            bull_case: String::new(),
            bear_case: String::new(),
            analyses: Vec::new(),
            created_at: Utc::now(),
        };
        assert_eq!(proposal.risk_grade(), 1);
        proposal.risk_score = 0.34;
        assert_eq!(proposal.risk_grade(), 3);
        proposal.risk_score = 1.0;
        assert_eq!(proposal.risk_grade(), 10);
    }

    #[test]
    fn orderbook_ratio_defaults_to_one_when_empty() {
        let book = Orderbook {
            ticker: "005930".into(),
            bids: vec![],
            asks: vec![],
        };
        assert_eq!(book.bid_ask_ratio(), 1.0);
    }

    #[test]
    fn alert_action_parses_snake_case() {
        assert_eq!(
            "execute_stop_loss".parse::<AlertAction>().unwrap(),
            AlertAction::ExecuteStopLoss
        );
        assert!("nonsense".parse::<AlertAction>().is_err());
    }
}
