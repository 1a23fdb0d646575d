use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{
    broker_code, AccountBalance, AssetInfo, Candle, CashBalance, Error, ExchangeClient,
    FilledOrder, Holding, Market, OpenOrder, OrderAck, Orderbook, OrderbookLevel, OrderSide,
    Result,
};

/// Simulated exchange implementing the full client surface.
///
/// Fills happen immediately at the seeded price (limit price when given)
/// with configurable slippage on market orders. The cash and position
/// ledger stays consistent with every fill, so account queries behave
/// like a real upstream. No network I/O ever happens here.
pub struct PaperExchange {
    market: Market,
    cash: RwLock<f64>,
    holdings: RwLock<Vec<PaperHolding>>,
    assets: RwLock<HashMap<String, AssetInfo>>,
    charts: RwLock<HashMap<String, Vec<Candle>>>,
    orderbooks: RwLock<HashMap<String, Orderbook>>,
    filled: RwLock<Vec<FilledOrder>>,
    /// Slippage in basis points applied to market-order fills.
    slippage_bps: f64,
}

#[derive(Debug, Clone)]
struct PaperHolding {
    ticker: String,
    name: String,
    quantity: f64,
    avg_price: f64,
}

impl PaperExchange {
    pub fn new(market: Market, initial_cash: f64, slippage_bps: f64) -> Self {
        info!(
            %market,
            cash = initial_cash,
            slippage_bps,
            "paper exchange initialized"
        );
        Self {
            market,
            cash: RwLock::new(initial_cash),
            holdings: RwLock::new(Vec::new()),
            assets: RwLock::new(HashMap::new()),
            charts: RwLock::new(HashMap::new()),
            orderbooks: RwLock::new(HashMap::new()),
            filled: RwLock::new(Vec::new()),
            slippage_bps,
        }
    }

    /// Seed or update a quoted asset.
    pub async fn seed_asset(&self, asset: AssetInfo) {
        self.assets.write().await.insert(asset.ticker.clone(), asset);
    }

    /// Convenience: seed a plain asset at a price.
    pub async fn seed_price(&self, ticker: &str, name: &str, price: f64) {
        self.seed_asset(AssetInfo {
            ticker: ticker.to_string(),
            name: name.to_string(),
            market: self.market,
            price,
            change_pct: 0.0,
            volume: 100_000.0,
            volume_ratio: Some(1.0),
            per: None,
            pbr: None,
            eps: None,
            market_cap: None,
        })
        .await;
    }

    pub async fn set_price(&self, ticker: &str, price: f64) {
        if let Some(asset) = self.assets.write().await.get_mut(ticker) {
            asset.price = price;
        }
    }

    pub async fn seed_chart(&self, ticker: &str, chart: Vec<Candle>) {
        self.charts.write().await.insert(ticker.to_string(), chart);
    }

    pub async fn seed_orderbook(&self, book: Orderbook) {
        self.orderbooks
            .write()
            .await
            .insert(book.ticker.clone(), book);
    }

    async fn price_of(&self, ticker: &str) -> Result<f64> {
        self.assets
            .read()
            .await
            .get(ticker)
            .map(|a| a.price)
            .ok_or_else(|| Error::Broker {
                code: broker_code::TICKER_NOT_FOUND,
                message: format!("no seeded price for '{ticker}'"),
            })
    }

    fn fill_price(&self, mid: f64, limit: Option<f64>, side: OrderSide) -> f64 {
        match limit {
            Some(price) => price,
            // Market orders: buys pay up, sells receive less.
            None => match side {
                OrderSide::Buy => mid * (1.0 + self.slippage_bps / 10_000.0),
                OrderSide::Sell => mid * (1.0 - self.slippage_bps / 10_000.0),
            },
        }
    }

    async fn record_fill(&self, ticker: &str, side: OrderSide, quantity: f64, price: f64) -> String {
        let order_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        self.filled.write().await.push(FilledOrder {
            order_id: order_id.clone(),
            ticker: ticker.to_string(),
            side,
            quantity,
            price,
            executed_at: Utc::now(),
        });
        order_id
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_asset(&self, ticker: &str) -> Result<AssetInfo> {
        self.assets
            .read()
            .await
            .get(ticker)
            .cloned()
            .ok_or_else(|| Error::Broker {
                code: broker_code::TICKER_NOT_FOUND,
                message: format!("unknown ticker '{ticker}'"),
            })
    }

    async fn get_orderbook(&self, ticker: &str) -> Result<Orderbook> {
        if let Some(book) = self.orderbooks.read().await.get(ticker) {
            return Ok(book.clone());
        }
        // Synthesize a balanced five-level book around the current price.
        let price = self.price_of(ticker).await?;
        let step = (price * 0.001).max(1.0);
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for i in 1..=5 {
            bids.push(OrderbookLevel {
                price: price - step * i as f64,
                quantity: 100.0,
            });
            asks.push(OrderbookLevel {
                price: price + step * i as f64,
                quantity: 100.0,
            });
        }
        Ok(Orderbook {
            ticker: ticker.to_string(),
            bids,
            asks,
        })
    }

    async fn get_daily_chart(&self, ticker: &str, days: u32) -> Result<Vec<Candle>> {
        if let Some(chart) = self.charts.read().await.get(ticker) {
            return Ok(chart.iter().take(days as usize).cloned().collect());
        }
        // Flat synthetic history for unseeded tickers.
        let price = self.price_of(ticker).await?;
        let today = Utc::now().date_naive();
        Ok((0..days)
            .map(|i| Candle {
                date: today - Duration::days(i as i64),
                open: price,
                high: price * 1.005,
                low: price * 0.995,
                close: price,
                volume: 100_000.0,
            })
            .collect())
    }

    async fn get_cash_balance(&self) -> Result<CashBalance> {
        let cash = *self.cash.read().await;
        Ok(CashBalance {
            available_cash: cash,
            orderable_cash: cash,
        })
    }

    async fn get_account_balance(&self) -> Result<AccountBalance> {
        let cash = *self.cash.read().await;
        let holdings = self.holdings.read().await;
        let assets = self.assets.read().await;

        let mut rows = Vec::new();
        let mut total_eval = 0.0;
        for h in holdings.iter() {
            let current = assets.get(&h.ticker).map(|a| a.price).unwrap_or(h.avg_price);
            let eval = h.quantity * current;
            total_eval += eval;
            rows.push(Holding {
                ticker: h.ticker.clone(),
                name: h.name.clone(),
                quantity: h.quantity,
                avg_price: h.avg_price,
                current_price: current,
                eval_amount: eval,
                pnl: (current - h.avg_price) * h.quantity,
                pnl_pct: if h.avg_price > 0.0 {
                    (current - h.avg_price) / h.avg_price * 100.0
                } else {
                    0.0
                },
            });
        }

        Ok(AccountBalance {
            total_equity: cash + total_eval,
            available_cash: cash,
            total_eval_amount: total_eval,
            holdings: rows,
        })
    }

    async fn get_pending_orders(&self) -> Result<Vec<OpenOrder>> {
        // Fills are immediate; nothing ever rests.
        Ok(Vec::new())
    }

    async fn get_filled_orders(&self) -> Result<Vec<FilledOrder>> {
        Ok(self.filled.read().await.clone())
    }

    async fn place_buy(&self, ticker: &str, quantity: f64, price: Option<f64>) -> Result<OrderAck> {
        if quantity <= 0.0 {
            return Err(Error::Broker {
                code: broker_code::INVALID_ORDER_QTY,
                message: format!("invalid quantity {quantity}"),
            });
        }
        let mid = self.price_of(ticker).await?;
        let fill = self.fill_price(mid, price, OrderSide::Buy);
        let cost = fill * quantity;

        {
            let mut cash = self.cash.write().await;
            if cost > *cash {
                return Err(Error::Broker {
                    code: broker_code::INSUFFICIENT_BALANCE,
                    message: format!("cost {cost:.0} exceeds cash {:.0}", *cash),
                });
            }
            *cash -= cost;
        }

        let name = self
            .assets
            .read()
            .await
            .get(ticker)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| ticker.to_string());

        let mut holdings = self.holdings.write().await;
        if let Some(h) = holdings.iter_mut().find(|h| h.ticker == ticker) {
            let total = h.quantity + quantity;
            h.avg_price = (h.avg_price * h.quantity + fill * quantity) / total;
            h.quantity = total;
        } else {
            holdings.push(PaperHolding {
                ticker: ticker.to_string(),
                name,
                quantity,
                avg_price: fill,
            });
        }
        drop(holdings);

        debug!(ticker, quantity, fill, "paper buy filled");
        let order_id = self.record_fill(ticker, OrderSide::Buy, quantity, fill).await;
        Ok(OrderAck { order_id })
    }

    async fn place_sell(&self, ticker: &str, quantity: f64, price: Option<f64>) -> Result<OrderAck> {
        if quantity <= 0.0 {
            return Err(Error::Broker {
                code: broker_code::INVALID_ORDER_QTY,
                message: format!("invalid quantity {quantity}"),
            });
        }
        let mid = self.price_of(ticker).await?;
        let fill = self.fill_price(mid, price, OrderSide::Sell);

        {
            let mut holdings = self.holdings.write().await;
            let Some(idx) = holdings.iter().position(|h| h.ticker == ticker) else {
                return Err(Error::Broker {
                    code: broker_code::INSUFFICIENT_BALANCE,
                    message: format!("no holding in '{ticker}' to sell"),
                });
            };
            if holdings[idx].quantity < quantity {
                return Err(Error::Broker {
                    code: broker_code::INVALID_ORDER_QTY,
                    message: format!(
                        "sell {quantity} exceeds held {}",
                        holdings[idx].quantity
                    ),
                });
            }
            holdings[idx].quantity -= quantity;
            if holdings[idx].quantity <= f64::EPSILON {
                holdings.remove(idx);
            }
        }

        *self.cash.write().await += fill * quantity;

        debug!(ticker, quantity, fill, "paper sell filled");
        let order_id = self
            .record_fill(ticker, OrderSide::Sell, quantity, fill)
            .await;
        Ok(OrderAck { order_id })
    }

    async fn modify_order(&self, order_id: &str, _quantity: f64, _price: f64) -> Result<OrderAck> {
        // Nothing rests, so a modify simply acknowledges.
        Ok(OrderAck {
            order_id: order_id.to_string(),
        })
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange() -> PaperExchange {
        let ex = PaperExchange::new(Market::Krx, 10_000_000.0, 10.0);
        ex.seed_price("005930", "Samsung Electronics", 50_000.0).await;
        ex
    }

    #[tokio::test]
    async fn market_buy_applies_positive_slippage() {
        let ex = exchange().await;
        ex.place_buy("005930", 10.0, None).await.unwrap();
        let balance = ex.get_account_balance().await.unwrap();
        let expected = 50_000.0 * (1.0 + 10.0 / 10_000.0);
        assert!((balance.holdings[0].avg_price - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn limit_orders_fill_at_the_limit() {
        let ex = exchange().await;
        ex.place_buy("005930", 10.0, Some(50_100.0)).await.unwrap();
        let balance = ex.get_account_balance().await.unwrap();
        assert_eq!(balance.holdings[0].avg_price, 50_100.0);
    }

    #[tokio::test]
    async fn cash_and_positions_stay_consistent() {
        let ex = exchange().await;
        ex.place_buy("005930", 20.0, Some(50_000.0)).await.unwrap();

        let cash = ex.get_cash_balance().await.unwrap();
        assert_eq!(cash.available_cash, 9_000_000.0);

        let balance = ex.get_account_balance().await.unwrap();
        assert_eq!(balance.total_equity, 10_000_000.0);
        assert_eq!(balance.holdings[0].quantity, 20.0);

        ex.place_sell("005930", 20.0, Some(50_000.0)).await.unwrap();
        let cash = ex.get_cash_balance().await.unwrap();
        assert_eq!(cash.available_cash, 10_000_000.0);
        assert!(ex.get_account_balance().await.unwrap().holdings.is_empty());
    }

    #[tokio::test]
    async fn repeated_buys_average_the_cost() {
        let ex = exchange().await;
        ex.place_buy("005930", 10.0, Some(50_000.0)).await.unwrap();
        ex.set_price("005930", 60_000.0).await;
        ex.place_buy("005930", 10.0, Some(60_000.0)).await.unwrap();

        let balance = ex.get_account_balance().await.unwrap();
        assert_eq!(balance.holdings[0].quantity, 20.0);
        assert_eq!(balance.holdings[0].avg_price, 55_000.0);
    }

    #[tokio::test]
    async fn buys_beyond_cash_are_rejected() {
        let ex = exchange().await;
        let err = ex
            .place_buy("005930", 1_000.0, Some(50_000.0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Broker {
                code: broker_code::INSUFFICIENT_BALANCE,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn selling_more_than_held_is_rejected() {
        let ex = exchange().await;
        ex.place_buy("005930", 5.0, Some(50_000.0)).await.unwrap();
        let err = ex.place_sell("005930", 10.0, Some(50_000.0)).await.unwrap_err();
        assert!(matches!(err, Error::Broker { .. }));
    }

    #[tokio::test]
    async fn synthetic_orderbook_is_balanced() {
        let ex = exchange().await;
        let book = ex.get_orderbook("005930").await.unwrap();
        assert_eq!(book.bids.len(), 5);
        assert_eq!(book.asks.len(), 5);
        assert!((book.bid_ask_ratio() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_ticker_is_a_domain_error() {
        let ex = exchange().await;
        let err = ex.get_asset("999999").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Broker {
                code: broker_code::TICKER_NOT_FOUND,
                ..
            }
        ));
    }
}
