use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use common::{
    AccountBalance, AssetInfo, Candle, CashBalance, Error, ExchangeClient, FilledOrder, Holding,
    Market, OpenOrder, OrderAck, OrderSide, Orderbook, OrderbookLevel, Result,
};

use crate::auth::TokenManager;
use crate::cache::{cache_key, TieredCache};
use crate::limiter::{classify_api_id, RateLimiter};

/// Rate-limited upstream retries: 1 s, 2 s, 4 s, then surface.
const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// REST client for the Korean broker API.
///
/// Every call flows through the rate limiter (bucket chosen by api-id),
/// carries a bearer token from the token manager, and maps the broker's
/// `return_code` into the shared error taxonomy. Queries read through the
/// tiered cache; successful orders invalidate the account-class keys.
pub struct KiwoomClient {
    base_url: String,
    http: reqwest::Client,
    auth: TokenManager,
    limiter: Arc<RateLimiter>,
    cache: Arc<TieredCache>,
    rate_timeout: Duration,
}

impl KiwoomClient {
    pub fn new(
        base_url: impl Into<String>,
        app_key: impl Into<String>,
        secret_key: impl Into<String>,
        limiter: Arc<RateLimiter>,
        cache: Arc<TieredCache>,
        rate_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let auth = TokenManager::new(base_url.clone(), app_key, secret_key, http.clone());
        Self {
            base_url,
            http,
            auth,
            limiter,
            cache,
            rate_timeout,
        }
    }

    pub fn token_manager(&self) -> &TokenManager {
        &self.auth
    }

    /// One upstream call with retry policy: rate limits backed off and
    /// retried up to three times, authentication errors refresh the token
    /// once and retry, everything else surfaces immediately.
    async fn request(&self, api_id: &str, endpoint: &str, body: Value) -> Result<Value> {
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            match self.request_once(api_id, endpoint, &body).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_rate_limit() && attempt < MAX_RETRY_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    warn!(
                        api_id,
                        attempt = attempt + 1,
                        delay_sec = delay.as_secs(),
                        "rate limited, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_auth() && !refreshed => {
                    warn!(api_id, error = %e, "auth error, refreshing token once");
                    self.auth.force_refresh().await;
                    refreshed = true;
                }
                Err(e) => {
                    if e.is_rate_limit() {
                        error!(api_id, attempts = attempt, "rate limit retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn request_once(&self, api_id: &str, endpoint: &str, body: &Value) -> Result<Value> {
        self.limiter
            .acquire(classify_api_id(api_id), Some(self.rate_timeout))
            .await?;

        let token = self.auth.bearer().await?;

        debug!(api_id, endpoint, "broker request");
        let response = self
            .http
            .post(format!("{}{}", self.base_url, endpoint))
            .header("api-id", api_id)
            .header("authorization", format!("Bearer {token}"))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("{api_id}: {e}"))
                } else {
                    Error::Network(format!("{api_id}: {e}"))
                }
            })?;

        if response.status().as_u16() == 429 {
            return Err(Error::RateLimited(format!("{api_id}: HTTP 429")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("{api_id} decode: {e}")))?;

        if let Some(code) = return_code(&payload) {
            if code != 0 {
                let message = payload
                    .get("return_msg")
                    .and_then(|v| v.as_str())
                    .unwrap_or("broker error")
                    .to_string();
                error!(api_id, code, message = %message, "broker error response");
                return Err(Error::from_broker_response(code, message));
            }
        }

        Ok(payload)
    }

    /// Read-through query: serve from cache when fresh, otherwise hit the
    /// upstream and store the raw payload at the key's default TTL.
    async fn cached_query(
        &self,
        key: &str,
        api_id: &str,
        endpoint: &str,
        body: Value,
    ) -> Result<Value> {
        if let Some(hit) = self.cache.get(key).await {
            return Ok(hit);
        }
        let payload = self.request(api_id, endpoint, body).await?;
        self.cache.set(key, payload.clone(), None).await;
        Ok(payload)
    }

    async fn order_request(&self, api_id: &str, body: Value) -> Result<Value> {
        let payload = self.request(api_id, "/api/dostk/ordr", body).await?;
        // Balances and order lists are stale the moment an order lands.
        self.cache.invalidate_account().await;
        Ok(payload)
    }
}

#[async_trait]
impl ExchangeClient for KiwoomClient {
    async fn get_asset(&self, ticker: &str) -> Result<AssetInfo> {
        let key = cache_key("stock_info", &[ticker]);
        let payload = self
            .cached_query(&key, "ka10001", "/api/dostk/stkinfo", json!({ "stk_cd": ticker }))
            .await?;

        Ok(AssetInfo {
            ticker: ticker.to_string(),
            name: str_field(&payload, "stk_nm"),
            market: Market::Krx,
            price: signed_price(&payload, "cur_prc"),
            change_pct: f64_field(&payload, "prdy_ctrt"),
            volume: f64_field(&payload, "trde_qty"),
            volume_ratio: opt_f64_field(&payload, "trde_qty_rt"),
            per: positive_opt(&payload, "per"),
            pbr: positive_opt(&payload, "pbr"),
            eps: opt_f64_field(&payload, "eps"),
            market_cap: opt_f64_field(&payload, "mrkt_tot_amt"),
        })
    }

    async fn get_orderbook(&self, ticker: &str) -> Result<Orderbook> {
        let key = cache_key("orderbook", &[ticker]);
        let payload = self
            .cached_query(&key, "ka10004", "/api/dostk/mrkcond", json!({ "stk_cd": ticker }))
            .await?;

        Ok(Orderbook {
            ticker: ticker.to_string(),
            bids: depth_levels(&payload, "buy_reqs"),
            asks: depth_levels(&payload, "sel_reqs"),
        })
    }

    async fn get_daily_chart(&self, ticker: &str, days: u32) -> Result<Vec<Candle>> {
        let key = cache_key("daily_chart", &[ticker, &days.to_string()]);
        let payload = self
            .cached_query(
                &key,
                "ka10081",
                "/api/dostk/chart",
                json!({
                    "stk_cd": ticker,
                    "base_dt": Utc::now().format("%Y%m%d").to_string(),
                    "upd_stkpc_tp": "1",
                }),
            )
            .await?;

        let rows = payload
            .get("stk_dt_pole_chart_qry")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut candles = Vec::new();
        for row in rows.iter().take(days as usize) {
            let Some(date) = parse_chart_date(&str_field(row, "dt")) else {
                continue;
            };
            candles.push(Candle {
                date,
                open: signed_price(row, "open_pric"),
                high: signed_price(row, "high_pric"),
                low: signed_price(row, "low_pric"),
                close: signed_price(row, "cur_prc"),
                volume: f64_field(row, "trde_qty"),
            });
        }
        Ok(candles)
    }

    async fn get_cash_balance(&self) -> Result<CashBalance> {
        let key = cache_key("cash_balance", &["main"]);
        let payload = self
            .cached_query(&key, "kt00001", "/api/dostk/acnt", json!({ "qry_tp": "2" }))
            .await?;

        Ok(CashBalance {
            available_cash: f64_field(&payload, "d2_entra"),
            orderable_cash: f64_field(&payload, "ord_alow_amt"),
        })
    }

    async fn get_account_balance(&self) -> Result<AccountBalance> {
        let key = cache_key("account_balance", &["main"]);
        let payload = self
            .cached_query(&key, "kt00004", "/api/dostk/acnt", json!({ "qry_tp": "1" }))
            .await?;

        let holdings = payload
            .get("stk_acnt_evlt_prst")
            .and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .map(|row| Holding {
                        ticker: str_field(row, "stk_cd"),
                        name: str_field(row, "stk_nm"),
                        quantity: f64_field(row, "rmnd_qty"),
                        avg_price: f64_field(row, "avg_prc"),
                        current_price: signed_price(row, "cur_prc"),
                        eval_amount: f64_field(row, "evlt_amt"),
                        pnl: f64_field(row, "evltv_prft"),
                        pnl_pct: f64_field(row, "prft_rt"),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(AccountBalance {
            total_equity: f64_field(&payload, "prsm_dpst_aset_amt"),
            available_cash: f64_field(&payload, "d2_entra"),
            total_eval_amount: f64_field(&payload, "tot_evlt_amt"),
            holdings,
        })
    }

    async fn get_pending_orders(&self) -> Result<Vec<OpenOrder>> {
        let key = cache_key("pending_orders", &["main"]);
        let payload = self
            .cached_query(&key, "ka10075", "/api/dostk/acnt", json!({ "all_stk_tp": "0" }))
            .await?;

        let orders = payload
            .get("oso")
            .and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .map(|row| OpenOrder {
                        order_id: str_field(row, "ord_no"),
                        ticker: str_field(row, "stk_cd"),
                        side: side_from_name(&str_field(row, "io_tp_nm")),
                        quantity: f64_field(row, "ord_qty"),
                        filled_quantity: f64_field(row, "cntr_qty"),
                        price: f64_field(row, "ord_prc"),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(orders)
    }

    async fn get_filled_orders(&self) -> Result<Vec<FilledOrder>> {
        let key = cache_key("filled_orders", &["main"]);
        let payload = self
            .cached_query(&key, "ka10076", "/api/dostk/acnt", json!({ "qry_tp": "4" }))
            .await?;

        let orders = payload
            .get("cntr")
            .and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .map(|row| FilledOrder {
                        order_id: str_field(row, "ord_no"),
                        ticker: str_field(row, "stk_cd"),
                        side: side_from_name(&str_field(row, "io_tp_nm")),
                        quantity: f64_field(row, "cntr_qty"),
                        price: f64_field(row, "cntr_prc"),
                        executed_at: parse_fill_time(&str_field(row, "cntr_tm")),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(orders)
    }

    async fn place_buy(&self, ticker: &str, quantity: f64, price: Option<f64>) -> Result<OrderAck> {
        let payload = self
            .order_request(
                "kt10000",
                order_body(ticker, quantity, price),
            )
            .await?;
        Ok(OrderAck {
            order_id: str_field(&payload, "ord_no"),
        })
    }

    async fn place_sell(&self, ticker: &str, quantity: f64, price: Option<f64>) -> Result<OrderAck> {
        let payload = self
            .order_request(
                "kt10001",
                order_body(ticker, quantity, price),
            )
            .await?;
        Ok(OrderAck {
            order_id: str_field(&payload, "ord_no"),
        })
    }

    async fn modify_order(&self, order_id: &str, quantity: f64, price: f64) -> Result<OrderAck> {
        let payload = self
            .order_request(
                "kt10002",
                json!({
                    "dmst_stex_tp": "KRX",
                    "orig_ord_no": order_id,
                    "mdfy_qty": format!("{}", quantity as i64),
                    "mdfy_uv": format!("{}", price as i64),
                }),
            )
            .await?;
        Ok(OrderAck {
            order_id: str_field(&payload, "ord_no"),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.order_request(
            "kt10003",
            json!({
                "dmst_stex_tp": "KRX",
                "orig_ord_no": order_id,
                "cncl_qty": "0",
            }),
        )
        .await?;
        Ok(())
    }
}

fn order_body(ticker: &str, quantity: f64, price: Option<f64>) -> Value {
    json!({
        "dmst_stex_tp": "KRX",
        "stk_cd": ticker,
        "ord_qty": format!("{}", quantity as i64),
        // Empty price with trade type "3" is a market order.
        "ord_uv": price.map(|p| format!("{}", p as i64)).unwrap_or_default(),
        "trde_tp": if price.is_some() { "0" } else { "3" },
    })
}

// ─── Response parsing helpers ────────────────────────────────────────────────

fn return_code(payload: &Value) -> Option<i32> {
    match payload.get("return_code") {
        Some(Value::Number(n)) => n.as_i64().map(|v| v as i32),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn str_field(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Numeric fields arrive as bare numbers or as strings with thousands of
/// historic formatting quirks; parse both.
fn f64_field(payload: &Value, key: &str) -> f64 {
    match payload.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().replace(',', "").parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn opt_f64_field(payload: &Value, key: &str) -> Option<f64> {
    match payload.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if !s.trim().is_empty() => {
            s.trim().replace(',', "").parse().ok()
        }
        _ => None,
    }
}

fn positive_opt(payload: &Value, key: &str) -> Option<f64> {
    opt_f64_field(payload, key).filter(|v| *v > 0.0)
}

/// Prices carry a +/- sign marking direction versus the previous close;
/// the actual price is the absolute value ("+112400" → 112400).
fn signed_price(payload: &Value, key: &str) -> f64 {
    f64_field(payload, key).abs()
}

fn depth_levels(payload: &Value, key: &str) -> Vec<OrderbookLevel> {
    payload
        .get(key)
        .and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .map(|row| OrderbookLevel {
                    price: signed_price(row, "prc"),
                    quantity: f64_field(row, "qty"),
                })
                .filter(|l| l.price > 0.0)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_chart_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

fn parse_fill_time(raw: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S")
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn side_from_name(name: &str) -> OrderSide {
    // The broker labels rows with localized names; buys contain "매수".
    if name.contains("매수") || name.to_ascii_lowercase().contains("buy") {
        OrderSide::Buy
    } else {
        OrderSide::Sell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signed_prices_parse_to_absolute_values() {
        let payload = json!({ "cur_prc": "+112400" });
        assert_eq!(signed_price(&payload, "cur_prc"), 112_400.0);
        let payload = json!({ "cur_prc": "-110900" });
        assert_eq!(signed_price(&payload, "cur_prc"), 110_900.0);
    }

    #[test]
    fn numeric_fields_parse_strings_and_numbers() {
        let payload = json!({ "a": "1,234", "b": 5.5, "c": "  7 " });
        assert_eq!(f64_field(&payload, "a"), 1_234.0);
        assert_eq!(f64_field(&payload, "b"), 5.5);
        assert_eq!(f64_field(&payload, "c"), 7.0);
        assert_eq!(f64_field(&payload, "missing"), 0.0);
    }

    #[test]
    fn zero_valuations_read_as_missing() {
        let payload = json!({ "per": "0.00", "pbr": "1.2" });
        assert_eq!(positive_opt(&payload, "per"), None);
        assert_eq!(positive_opt(&payload, "pbr"), Some(1.2));
    }

    #[test]
    fn return_code_string_or_number() {
        assert_eq!(return_code(&json!({ "return_code": 0 })), Some(0));
        assert_eq!(return_code(&json!({ "return_code": "-400" })), Some(-400));
        assert_eq!(return_code(&json!({})), None);
    }

    #[test]
    fn order_body_market_vs_limit() {
        let market = order_body("005930", 10.0, None);
        assert_eq!(market["trde_tp"], "3");
        assert_eq!(market["ord_uv"], "");
        let limit = order_body("005930", 10.0, Some(50_000.0));
        assert_eq!(limit["trde_tp"], "0");
        assert_eq!(limit["ord_uv"], "50000");
    }

    #[test]
    fn side_parsing_handles_localized_labels() {
        assert_eq!(side_from_name("매수"), OrderSide::Buy);
        assert_eq!(side_from_name("현금매도"), OrderSide::Sell);
        assert_eq!(side_from_name("BUY"), OrderSide::Buy);
    }
}
