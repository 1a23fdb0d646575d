use async_trait::async_trait;

use crate::{
    AccountBalance, AssetInfo, Candle, CashBalance, FilledOrder, OpenOrder, OrderAck, Orderbook,
    Result,
};

/// Typed facade over an upstream exchange.
///
/// `KiwoomClient` implements this for Korean stocks, `UpbitClient` for KRW
/// crypto pairs and `PaperExchange` for simulation. Everything above this
/// trait (pipeline, coordinator, agents) is transport-agnostic: rate
/// limiting, caching and token handling live behind the implementations.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Quote and valuation snapshot for one asset.
    async fn get_asset(&self, ticker: &str) -> Result<AssetInfo>;

    /// Current order book depth.
    async fn get_orderbook(&self, ticker: &str) -> Result<Orderbook>;

    /// Daily candles, newest first.
    async fn get_daily_chart(&self, ticker: &str, days: u32) -> Result<Vec<Candle>>;

    /// Cash available for new orders.
    async fn get_cash_balance(&self) -> Result<CashBalance>;

    /// Full account valuation including holdings.
    async fn get_account_balance(&self) -> Result<AccountBalance>;

    /// Orders accepted upstream but not yet fully filled.
    async fn get_pending_orders(&self) -> Result<Vec<OpenOrder>>;

    /// Recent executions.
    async fn get_filled_orders(&self) -> Result<Vec<FilledOrder>>;

    /// Place a buy. `price = None` submits a market order.
    /// Implementations must invalidate account-class cache keys on success.
    async fn place_buy(&self, ticker: &str, quantity: f64, price: Option<f64>)
        -> Result<OrderAck>;

    /// Place a sell. Same cache contract as `place_buy`.
    async fn place_sell(&self, ticker: &str, quantity: f64, price: Option<f64>)
        -> Result<OrderAck>;

    /// Amend price/quantity of a resting order.
    async fn modify_order(&self, order_id: &str, quantity: f64, price: f64) -> Result<OrderAck>;

    /// Cancel a resting order.
    async fn cancel_order(&self, order_id: &str) -> Result<()>;
}
