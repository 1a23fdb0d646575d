use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256, Sha512};
use tracing::debug;

use common::{
    AccountBalance, AssetInfo, Candle, CashBalance, Error, ExchangeClient, FilledOrder, Holding,
    Market, OpenOrder, OrderAck, Orderbook, OrderbookLevel, OrderSide, Result,
};

use crate::cache::{cache_key, TieredCache};
use crate::limiter::{RateLimiter, RequestKind};

/// REST client for the KRW crypto exchange.
///
/// Private endpoints authenticate with a per-request JWT (HS256 over the
/// access key, a nonce and a SHA512 hash of the query string). The same
/// rate limiter and cache as the stock client sit in front of every call.
pub struct UpbitClient {
    base_url: String,
    access_key: String,
    secret_key: String,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    cache: Arc<TieredCache>,
    rate_timeout: Duration,
}

impl UpbitClient {
    pub fn new(
        base_url: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        limiter: Arc<RateLimiter>,
        cache: Arc<TieredCache>,
        rate_timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            limiter,
            cache,
            rate_timeout,
        }
    }

    fn auth_header(&self, query: Option<&str>) -> String {
        let mut claims = json!({
            "access_key": self.access_key,
            "nonce": uuid::Uuid::new_v4().to_string(),
        });
        if let Some(query) = query {
            let mut hasher = Sha512::new();
            hasher.update(query.as_bytes());
            claims["query_hash"] = json!(hex::encode(hasher.finalize()));
            claims["query_hash_alg"] = json!("SHA512");
        }
        format!("Bearer {}", jwt_hs256(&self.secret_key, &claims))
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<Value> {
        self.limiter
            .acquire(RequestKind::Query, Some(self.rate_timeout))
            .await?;
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        debug!(%url, "upbit public request");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{path}: {e}")))?;
        decode_response(path, response).await
    }

    async fn private_get(&self, path: &str, query: &str) -> Result<Value> {
        self.limiter
            .acquire(RequestKind::Query, Some(self.rate_timeout))
            .await?;
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let auth = self.auth_header(if query.is_empty() { None } else { Some(query) });
        let response = self
            .http
            .get(&url)
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{path}: {e}")))?;
        decode_response(path, response).await
    }

    async fn private_post(&self, path: &str, body: Value) -> Result<Value> {
        self.limiter
            .acquire(RequestKind::Order, Some(self.rate_timeout))
            .await?;
        // Upbit hashes the form-encoded body for POSTs.
        let query = form_encode(&body);
        let auth = self.auth_header(Some(&query));
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", auth)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{path}: {e}")))?;
        let payload = decode_response(path, response).await?;
        self.cache.invalidate_account().await;
        Ok(payload)
    }

    async fn private_delete(&self, path: &str, query: &str) -> Result<Value> {
        self.limiter
            .acquire(RequestKind::Order, Some(self.rate_timeout))
            .await?;
        let auth = self.auth_header(Some(query));
        let response = self
            .http
            .delete(format!("{}{}?{}", self.base_url, path, query))
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("{path}: {e}")))?;
        let payload = decode_response(path, response).await?;
        self.cache.invalidate_account().await;
        Ok(payload)
    }

    async fn ticker(&self, market_code: &str) -> Result<TickerRow> {
        let key = cache_key("stock_info", &[market_code]);
        let payload = if let Some(hit) = self.cache.get(&key).await {
            hit
        } else {
            let fresh = self
                .public_get("/v1/ticker", &format!("markets={market_code}"))
                .await?;
            self.cache.set(&key, fresh.clone(), None).await;
            fresh
        };

        let rows: Vec<TickerRow> = serde_json::from_value(payload)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::Broker {
                code: common::broker_code::TICKER_NOT_FOUND,
                message: format!("no ticker data for {market_code}"),
            })
    }
}

#[async_trait]
impl ExchangeClient for UpbitClient {
    async fn get_asset(&self, ticker: &str) -> Result<AssetInfo> {
        let row = self.ticker(ticker).await?;
        Ok(AssetInfo {
            ticker: ticker.to_string(),
            name: ticker.to_string(),
            market: Market::Crypto,
            price: row.trade_price,
            change_pct: row.signed_change_rate * 100.0,
            volume: row.acc_trade_volume_24h,
            volume_ratio: None,
            per: None,
            pbr: None,
            eps: None,
            market_cap: None,
        })
    }

    async fn get_orderbook(&self, ticker: &str) -> Result<Orderbook> {
        let key = cache_key("orderbook", &[ticker]);
        let payload = if let Some(hit) = self.cache.get(&key).await {
            hit
        } else {
            let fresh = self
                .public_get("/v1/orderbook", &format!("markets={ticker}"))
                .await?;
            self.cache.set(&key, fresh.clone(), None).await;
            fresh
        };

        let rows: Vec<OrderbookRow> = serde_json::from_value(payload)?;
        let row = rows.into_iter().next().ok_or_else(|| Error::Broker {
            code: common::broker_code::TICKER_NOT_FOUND,
            message: format!("no orderbook for {ticker}"),
        })?;

        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for unit in row.orderbook_units {
            bids.push(OrderbookLevel {
                price: unit.bid_price,
                quantity: unit.bid_size,
            });
            asks.push(OrderbookLevel {
                price: unit.ask_price,
                quantity: unit.ask_size,
            });
        }
        Ok(Orderbook {
            ticker: ticker.to_string(),
            bids,
            asks,
        })
    }

    async fn get_daily_chart(&self, ticker: &str, days: u32) -> Result<Vec<Candle>> {
        let key = cache_key("daily_chart", &[ticker, &days.to_string()]);
        let payload = if let Some(hit) = self.cache.get(&key).await {
            hit
        } else {
            let fresh = self
                .public_get(
                    "/v1/candles/days",
                    &format!("market={ticker}&count={days}"),
                )
                .await?;
            self.cache.set(&key, fresh.clone(), None).await;
            fresh
        };

        let rows: Vec<DayCandleRow> = serde_json::from_value(payload)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let date = row.candle_date_time_kst.get(..10).and_then(|s| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
                })?;
                Some(Candle {
                    date,
                    open: row.opening_price,
                    high: row.high_price,
                    low: row.low_price,
                    close: row.trade_price,
                    volume: row.candle_acc_trade_volume,
                })
            })
            .collect())
    }

    async fn get_cash_balance(&self) -> Result<CashBalance> {
        let accounts = self.accounts().await?;
        let krw = accounts
            .iter()
            .find(|a| a.currency == "KRW")
            .map(|a| a.balance_f64())
            .unwrap_or(0.0);
        Ok(CashBalance {
            available_cash: krw,
            orderable_cash: krw,
        })
    }

    async fn get_account_balance(&self) -> Result<AccountBalance> {
        let accounts = self.accounts().await?;

        let mut holdings = Vec::new();
        let mut total_eval = 0.0;
        let mut cash = 0.0;
        for account in &accounts {
            if account.currency == "KRW" {
                cash = account.balance_f64();
                continue;
            }
            let quantity = account.balance_f64() + account.locked_f64();
            if quantity <= 0.0 {
                continue;
            }
            let market_code = format!("KRW-{}", account.currency);
            let current_price = match self.ticker(&market_code).await {
                Ok(row) => row.trade_price,
                Err(_) => account.avg_buy_price_f64(),
            };
            let avg = account.avg_buy_price_f64();
            let eval = quantity * current_price;
            total_eval += eval;
            holdings.push(Holding {
                ticker: market_code,
                name: account.currency.clone(),
                quantity,
                avg_price: avg,
                current_price,
                eval_amount: eval,
                pnl: (current_price - avg) * quantity,
                pnl_pct: if avg > 0.0 {
                    (current_price - avg) / avg * 100.0
                } else {
                    0.0
                },
            });
        }

        Ok(AccountBalance {
            total_equity: cash + total_eval,
            available_cash: cash,
            total_eval_amount: total_eval,
            holdings,
        })
    }

    async fn get_pending_orders(&self) -> Result<Vec<OpenOrder>> {
        let key = cache_key("pending_orders", &["upbit"]);
        let payload = if let Some(hit) = self.cache.get(&key).await {
            hit
        } else {
            let fresh = self.private_get("/v1/orders", "state=wait").await?;
            self.cache.set(&key, fresh.clone(), None).await;
            fresh
        };

        let rows: Vec<OrderRow> = serde_json::from_value(payload)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let side = row.order_side();
                let quantity = row.volume_f64();
                let filled_quantity = row.executed_volume_f64();
                let price = row.price_f64();
                OpenOrder {
                    order_id: row.uuid,
                    ticker: row.market,
                    side,
                    quantity,
                    filled_quantity,
                    price,
                }
            })
            .collect())
    }

    async fn get_filled_orders(&self) -> Result<Vec<FilledOrder>> {
        let key = cache_key("filled_orders", &["upbit"]);
        let payload = if let Some(hit) = self.cache.get(&key).await {
            hit
        } else {
            let fresh = self.private_get("/v1/orders", "state=done").await?;
            self.cache.set(&key, fresh.clone(), None).await;
            fresh
        };

        let rows: Vec<OrderRow> = serde_json::from_value(payload)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let side = row.order_side();
                let quantity = row.executed_volume_f64();
                let price = row.price_f64();
                let executed_at = row
                    .created_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now());
                FilledOrder {
                    order_id: row.uuid,
                    ticker: row.market,
                    side,
                    quantity,
                    price,
                    executed_at,
                }
            })
            .collect())
    }

    async fn place_buy(&self, ticker: &str, quantity: f64, price: Option<f64>) -> Result<OrderAck> {
        let body = match price {
            Some(price) => json!({
                "market": ticker,
                "side": "bid",
                "volume": format!("{quantity}"),
                "price": format!("{price}"),
                "ord_type": "limit",
            }),
            None => {
                // Market buys spend a KRW amount, so price the request off
                // the latest trade.
                let last = self.ticker(ticker).await?.trade_price;
                json!({
                    "market": ticker,
                    "side": "bid",
                    "price": format!("{}", quantity * last),
                    "ord_type": "price",
                })
            }
        };
        let payload = self.private_post("/v1/orders", body).await?;
        Ok(OrderAck {
            order_id: payload
                .get("uuid")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn place_sell(&self, ticker: &str, quantity: f64, price: Option<f64>) -> Result<OrderAck> {
        let body = match price {
            Some(price) => json!({
                "market": ticker,
                "side": "ask",
                "volume": format!("{quantity}"),
                "price": format!("{price}"),
                "ord_type": "limit",
            }),
            None => json!({
                "market": ticker,
                "side": "ask",
                "volume": format!("{quantity}"),
                "ord_type": "market",
            }),
        };
        let payload = self.private_post("/v1/orders", body).await?;
        Ok(OrderAck {
            order_id: payload
                .get("uuid")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn modify_order(&self, _order_id: &str, _quantity: f64, _price: f64) -> Result<OrderAck> {
        // The exchange has no amend endpoint; callers cancel and re-place.
        Err(Error::BusinessRule(
            "crypto exchange does not support order modification".into(),
        ))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.private_delete("/v1/order", &format!("uuid={order_id}"))
            .await?;
        Ok(())
    }
}

impl UpbitClient {
    async fn accounts(&self) -> Result<Vec<AccountRow>> {
        let key = cache_key("account_balance", &["upbit"]);
        let payload = if let Some(hit) = self.cache.get(&key).await {
            hit
        } else {
            let fresh = self.private_get("/v1/accounts", "").await?;
            self.cache.set(&key, fresh.clone(), None).await;
            fresh
        };
        Ok(serde_json::from_value(payload)?)
    }
}

async fn decode_response(path: &str, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(Error::RateLimited(format!("{path}: HTTP 429")));
    }
    let body = response
        .text()
        .await
        .map_err(|e| Error::Network(format!("{path}: {e}")))?;

    if !status.is_success() {
        if status.as_u16() == 401 {
            return Err(Error::Auth {
                code: common::broker_code::INVALID_TOKEN,
                message: format!("{path}: {body}"),
            });
        }
        return Err(Error::Broker {
            code: status.as_u16() as i32,
            message: format!("{path}: {body}"),
        });
    }
    serde_json::from_str(&body).map_err(|e| Error::Network(format!("{path} decode: {e}")))
}

/// Minimal HS256 JWT: base64url(header).base64url(claims).base64url(hmac).
fn jwt_hs256(secret: &str, claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    let signing_input = format!("{header}.{payload}");

    type HmacSha256 = Hmac<Sha256>;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{signing_input}.{signature}")
}

fn form_encode(body: &Value) -> String {
    let Some(map) = body.as_object() else {
        return String::new();
    };
    let mut parts: Vec<String> = map
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{k}={v}")
        })
        .collect();
    parts.sort();
    parts.join("&")
}

// ─── Response types ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TickerRow {
    trade_price: f64,
    #[serde(default)]
    signed_change_rate: f64,
    #[serde(default)]
    acc_trade_volume_24h: f64,
}

#[derive(Deserialize)]
struct OrderbookRow {
    orderbook_units: Vec<OrderbookUnit>,
}

#[derive(Deserialize)]
struct OrderbookUnit {
    ask_price: f64,
    bid_price: f64,
    ask_size: f64,
    bid_size: f64,
}

#[derive(Deserialize)]
struct DayCandleRow {
    candle_date_time_kst: String,
    opening_price: f64,
    high_price: f64,
    low_price: f64,
    trade_price: f64,
    candle_acc_trade_volume: f64,
}

#[derive(Deserialize)]
struct AccountRow {
    currency: String,
    balance: String,
    #[serde(default)]
    locked: String,
    #[serde(default)]
    avg_buy_price: String,
}

impl AccountRow {
    fn balance_f64(&self) -> f64 {
        self.balance.parse().unwrap_or(0.0)
    }
    fn locked_f64(&self) -> f64 {
        self.locked.parse().unwrap_or(0.0)
    }
    fn avg_buy_price_f64(&self) -> f64 {
        self.avg_buy_price.parse().unwrap_or(0.0)
    }
}

#[derive(Deserialize)]
struct OrderRow {
    uuid: String,
    market: String,
    side: String,
    #[serde(default)]
    volume: Option<String>,
    #[serde(default)]
    executed_volume: Option<String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    created_at: String,
}

impl OrderRow {
    fn order_side(&self) -> OrderSide {
        if self.side == "bid" {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        }
    }
    fn volume_f64(&self) -> f64 {
        self.volume
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }
    fn executed_volume_f64(&self) -> f64 {
        self.executed_volume
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }
    fn price_f64(&self) -> f64 {
        self.price
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_has_three_base64url_segments() {
        let claims = json!({ "access_key": "k", "nonce": "n" });
        let token = jwt_hs256("secret", &claims);
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);
        // Claims round-trip through the middle segment.
        let decoded = URL_SAFE_NO_PAD.decode(parts[1]).unwrap();
        let parsed: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(parsed["access_key"], "k");
    }

    #[test]
    fn jwt_signature_is_deterministic_for_same_input() {
        let claims = json!({ "access_key": "k", "nonce": "fixed" });
        assert_eq!(jwt_hs256("s", &claims), jwt_hs256("s", &claims));
        assert_ne!(jwt_hs256("s1", &claims), jwt_hs256("s2", &claims));
    }

    #[test]
    fn form_encoding_is_sorted_and_stable() {
        let body = json!({ "volume": "1.5", "market": "KRW-BTC", "side": "bid" });
        assert_eq!(form_encode(&body), "market=KRW-BTC&side=bid&volume=1.5");
    }
}
