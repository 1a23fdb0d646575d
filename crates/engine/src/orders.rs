use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use common::{
    ExchangeClient, Market, OrderConfig, OrderRequest, OrderResult, OrderSide, OrderStatus,
    OrderType,
};

use crate::ticks::round_to_tick;

const SPLIT_PARTS: u32 = 3;

/// Order execution agent.
///
/// Wraps the exchange client with split execution for large orders, KRX
/// tick rounding for limit prices and pending/completed bookkeeping.
/// Failures never escape as errors: every path yields an `OrderResult`,
/// rejected when execution did not happen.
pub struct OrderAgent {
    stock: Arc<dyn ExchangeClient>,
    crypto: Option<Arc<dyn ExchangeClient>>,
    split_threshold: f64,
    split_pause: Duration,
    pending: Mutex<HashMap<String, OrderRequest>>,
    completed: Mutex<Vec<OrderResult>>,
}

impl OrderAgent {
    pub fn new(
        stock: Arc<dyn ExchangeClient>,
        crypto: Option<Arc<dyn ExchangeClient>>,
        config: &OrderConfig,
    ) -> Self {
        Self {
            stock,
            crypto,
            split_threshold: config.split_threshold,
            split_pause: Duration::from_millis(config.split_pause_ms),
            pending: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    fn client_for(&self, market: Market) -> Option<&Arc<dyn ExchangeClient>> {
        match market {
            Market::Krx => Some(&self.stock),
            Market::Crypto => self.crypto.as_ref(),
        }
    }

    /// Execute an order, optionally splitting it into three sub-orders to
    /// reduce market impact.
    pub async fn execute_order(&self, order: OrderRequest, split: bool) -> OrderResult {
        info!(
            ticker = %order.ticker,
            side = %order.side,
            qty = order.quantity,
            price = ?order.price,
            "executing order"
        );

        if split && order.quantity > self.split_threshold {
            self.execute_split_order(order).await
        } else {
            self.execute_single_order(order).await
        }
    }

    async fn execute_split_order(&self, order: OrderRequest) -> OrderResult {
        // ⌊q/3⌋, ⌊q/3⌋, remainder — KRX quantities stay integral.
        let base = match order.market {
            Market::Krx => (order.quantity / SPLIT_PARTS as f64).floor(),
            Market::Crypto => order.quantity / SPLIT_PARTS as f64,
        };
        let quantities = [base, base, order.quantity - 2.0 * base];

        info!(
            ticker = %order.ticker,
            total = order.quantity,
            parts = SPLIT_PARTS,
            "splitting order"
        );

        let mut results = Vec::new();
        for (i, qty) in quantities.iter().enumerate() {
            if *qty <= 0.0 {
                continue;
            }
            let mut sub = order.clone();
            sub.quantity = *qty;
            sub.reason = Some(format!(
                "{} (split {}/{})",
                order.reason.as_deref().unwrap_or("order"),
                i + 1,
                SPLIT_PARTS
            ));

            results.push(self.execute_single_order(sub).await);

            if i + 1 < SPLIT_PARTS as usize {
                tokio::time::sleep(self.split_pause).await;
            }
        }

        aggregate_results(&order, results)
    }

    async fn execute_single_order(&self, mut order: OrderRequest) -> OrderResult {
        let order_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        let Some(client) = self.client_for(order.market) else {
            warn!(ticker = %order.ticker, "no client configured for {}", order.market);
            return OrderResult::rejected(
                &order,
                order_id,
                format!("no exchange client configured for {}", order.market),
            );
        };
        let client = Arc::clone(client);

        // Limit prices must sit on a valid KRX tick; round so the order
        // stays competitive (up for buys, down for sells).
        if order.market == Market::Krx && order.order_type == OrderType::Limit {
            if let Some(price) = order.price {
                let rounded = round_to_tick(price, order.side);
                if (rounded - price).abs() > f64::EPSILON {
                    info!(
                        ticker = %order.ticker,
                        requested = price,
                        rounded,
                        "limit price adjusted to tick size"
                    );
                }
                order.price = Some(rounded);
            }
        }

        self.pending
            .lock()
            .await
            .insert(order_id.clone(), order.clone());

        let placed = match order.side {
            OrderSide::Buy => {
                client
                    .place_buy(&order.ticker, order.quantity, order.price)
                    .await
            }
            OrderSide::Sell => {
                client
                    .place_sell(&order.ticker, order.quantity, order.price)
                    .await
            }
        };

        self.pending.lock().await.remove(&order_id);

        let result = match placed {
            Ok(ack) => {
                let fill_price = match order.price {
                    Some(p) => p,
                    // Market orders fill near the latest trade; use it as
                    // the recorded average so downstream P&L stays sane.
                    None => client
                        .get_asset(&order.ticker)
                        .await
                        .map(|a| a.price)
                        .unwrap_or(0.0),
                };
                let upstream_id = if ack.order_id.is_empty() {
                    order_id.clone()
                } else {
                    ack.order_id
                };
                OrderResult {
                    order_id: upstream_id,
                    ticker: order.ticker.clone(),
                    side: order.side,
                    requested_quantity: order.quantity,
                    filled_quantity: order.quantity,
                    avg_price: fill_price,
                    status: OrderStatus::Filled,
                    message: order.reason.clone(),
                    created_at: Utc::now(),
                    filled_at: Some(Utc::now()),
                }
            }
            Err(e) => {
                error!(ticker = %order.ticker, error = %e, "order submission failed");
                OrderResult::rejected(&order, order_id, e.to_string())
            }
        };

        info!(
            order_id = %result.order_id,
            filled = result.filled_quantity,
            requested = result.requested_quantity,
            avg_price = result.avg_price,
            status = %result.status,
            "order completed"
        );

        let mut completed = self.completed.lock().await;
        completed.push(result.clone());
        // History is a bounded ring.
        if completed.len() > 500 {
            completed.remove(0);
        }

        result
    }

    /// Cancel a resting broker order upstream, best effort.
    pub async fn cancel_order(&self, order_id: &str) -> bool {
        match self.stock.cancel_order(order_id).await {
            Ok(()) => {
                self.pending.lock().await.remove(order_id);
                true
            }
            Err(e) => {
                warn!(order_id, error = %e, "cancel failed");
                false
            }
        }
    }

    pub async fn pending_orders(&self) -> Vec<OrderRequest> {
        self.pending.lock().await.values().cloned().collect()
    }

    pub async fn order_history(&self, limit: usize) -> Vec<OrderResult> {
        let completed = self.completed.lock().await;
        completed.iter().rev().take(limit).cloned().collect()
    }
}

/// Aggregate split results: total fill, volume-weighted average price and
/// an overall status.
fn aggregate_results(original: &OrderRequest, results: Vec<OrderResult>) -> OrderResult {
    let total_filled: f64 = results.iter().map(|r| r.filled_quantity).sum();
    let total_value: f64 = results
        .iter()
        .map(|r| r.filled_quantity * r.avg_price)
        .sum();
    let avg_price = if total_filled > 0.0 {
        total_value / total_filled
    } else {
        0.0
    };

    let status = if total_filled >= original.quantity {
        OrderStatus::Filled
    } else if total_filled > 0.0 {
        OrderStatus::Partial
    } else {
        OrderStatus::Rejected
    };

    OrderResult {
        order_id: results
            .first()
            .map(|r| r.order_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()[..8].to_string()),
        ticker: original.ticker.clone(),
        side: original.side,
        requested_quantity: original.quantity,
        filled_quantity: total_filled,
        avg_price,
        status,
        message: Some(format!("split order: {} parts", results.len())),
        created_at: Utc::now(),
        filled_at: if total_filled > 0.0 {
            Some(Utc::now())
        } else {
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{
        AccountBalance, AssetInfo, Candle, CashBalance, Error, FilledOrder, OpenOrder, OrderAck,
        Orderbook, Result,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records order sizes; fails when `fail` is set.
    struct RecordingClient {
        fail: bool,
        orders: Mutex<Vec<(String, f64, Option<f64>)>>,
        calls: AtomicUsize,
    }

    impl RecordingClient {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                orders: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for RecordingClient {
        async fn get_asset(&self, ticker: &str) -> Result<AssetInfo> {
            Ok(AssetInfo {
                ticker: ticker.into(),
                name: ticker.into(),
                market: Market::Krx,
                price: 10_000.0,
                change_pct: 0.0,
                volume: 0.0,
                volume_ratio: None,
                per: None,
                pbr: None,
                eps: None,
                market_cap: None,
            })
        }
        async fn get_orderbook(&self, _: &str) -> Result<Orderbook> {
            unimplemented!()
        }
        async fn get_daily_chart(&self, _: &str, _: u32) -> Result<Vec<Candle>> {
            unimplemented!()
        }
        async fn get_cash_balance(&self) -> Result<CashBalance> {
            unimplemented!()
        }
        async fn get_account_balance(&self) -> Result<AccountBalance> {
            unimplemented!()
        }
        async fn get_pending_orders(&self) -> Result<Vec<OpenOrder>> {
            Ok(vec![])
        }
        async fn get_filled_orders(&self) -> Result<Vec<FilledOrder>> {
            Ok(vec![])
        }
        async fn place_buy(&self, ticker: &str, qty: f64, price: Option<f64>) -> Result<OrderAck> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Broker {
                    code: common::broker_code::INSUFFICIENT_BALANCE,
                    message: "insufficient balance".into(),
                });
            }
            self.orders.lock().await.push((ticker.into(), qty, price));
            Ok(OrderAck {
                order_id: format!("ord-{}", self.calls.load(Ordering::SeqCst)),
            })
        }
        async fn place_sell(&self, ticker: &str, qty: f64, price: Option<f64>) -> Result<OrderAck> {
            self.place_buy(ticker, qty, price).await
        }
        async fn modify_order(&self, _: &str, _: f64, _: f64) -> Result<OrderAck> {
            unimplemented!()
        }
        async fn cancel_order(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn agent(client: Arc<RecordingClient>) -> OrderAgent {
        OrderAgent::new(
            client,
            None,
            &OrderConfig {
                split_threshold: 100.0,
                split_pause_ms: 1, // keep tests fast
            },
        )
    }

    #[tokio::test]
    async fn small_order_is_not_split() {
        let client = Arc::new(RecordingClient::new(false));
        let result = agent(client.clone())
            .execute_order(
                OrderRequest::limit("005930", Market::Krx, OrderSide::Buy, 20.0, 50_000.0),
                true,
            )
            .await;
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.filled_quantity, 20.0);
        assert_eq!(client.orders.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn large_order_splits_into_three() {
        let client = Arc::new(RecordingClient::new(false));
        let result = agent(client.clone())
            .execute_order(
                OrderRequest::limit("005930", Market::Krx, OrderSide::Buy, 300.0, 10_000.0),
                true,
            )
            .await;

        let orders = client.orders.lock().await;
        let sizes: Vec<f64> = orders.iter().map(|(_, q, _)| *q).collect();
        assert_eq!(sizes, vec![100.0, 100.0, 100.0]);
        assert_eq!(result.filled_quantity, 300.0);
        assert_eq!(result.status, OrderStatus::Filled);
        assert!((result.avg_price - 10_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn uneven_split_puts_remainder_last() {
        let client = Arc::new(RecordingClient::new(false));
        agent(client.clone())
            .execute_order(
                OrderRequest::limit("005930", Market::Krx, OrderSide::Buy, 250.0, 10_000.0),
                true,
            )
            .await;
        let orders = client.orders.lock().await;
        let sizes: Vec<f64> = orders.iter().map(|(_, q, _)| *q).collect();
        assert_eq!(sizes, vec![83.0, 83.0, 84.0]);
    }

    #[tokio::test]
    async fn failures_return_rejected_never_panic() {
        let client = Arc::new(RecordingClient::new(true));
        let result = agent(client)
            .execute_order(
                OrderRequest::limit("005930", Market::Krx, OrderSide::Buy, 10.0, 50_000.0),
                true,
            )
            .await;
        assert_eq!(result.status, OrderStatus::Rejected);
        assert_eq!(result.filled_quantity, 0.0);
        assert!(result.message.unwrap().contains("insufficient"));
    }

    #[tokio::test]
    async fn limit_price_is_tick_rounded() {
        let client = Arc::new(RecordingClient::new(false));
        agent(client.clone())
            .execute_order(
                OrderRequest::limit("005930", Market::Krx, OrderSide::Buy, 10.0, 50_120.0),
                false,
            )
            .await;
        let orders = client.orders.lock().await;
        assert_eq!(orders[0].2, Some(50_200.0));
    }
}
