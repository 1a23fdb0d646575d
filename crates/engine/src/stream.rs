use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use common::{PriceTick, Result};

/// Crypto ticker WebSocket stream.
///
/// Subscribes to trade tickers for the configured markets, parses updates
/// into `PriceTick` and publishes them on a broadcast channel. Reconnects
/// automatically with exponential backoff.
pub struct UpbitTickerStream {
    ws_url: String,
    markets: Vec<String>,
    tick_tx: broadcast::Sender<PriceTick>,
}

impl UpbitTickerStream {
    pub fn new(
        ws_url: impl Into<String>,
        markets: Vec<String>,
        tick_tx: broadcast::Sender<PriceTick>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            markets,
            tick_tx,
        }
    }

    /// Run the stream loop forever, reconnecting on failure.
    /// Call this inside a `tokio::spawn`.
    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(60);

        loop {
            info!(markets = ?self.markets, "connecting crypto ticker stream");
            match self.connect_once().await {
                Ok(()) => {
                    info!("ticker stream closed cleanly");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?backoff, "ticker stream error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let url = url::Url::parse(&self.ws_url)
            .map_err(|e| common::Error::WebSocket(e.to_string()))?;

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| common::Error::WebSocket(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        // Ticket + type frames subscribe to ticker updates for our markets.
        let subscription = json!([
            { "ticket": uuid::Uuid::new_v4().to_string() },
            { "type": "ticker", "codes": self.markets },
        ]);
        write
            .send(Message::Text(subscription.to_string()))
            .await
            .map_err(|e| common::Error::WebSocket(e.to_string()))?;

        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| common::Error::WebSocket(e.to_string()))?;

            // The exchange sends ticker payloads as binary frames.
            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => break,
                _ => continue,
            };

            match parse_ticker(&text) {
                Ok(Some(tick)) => {
                    // Ignore send errors (no active receivers)
                    let _ = self.tick_tx.send(tick);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to parse ticker frame"),
            }
        }

        Ok(())
    }
}

#[derive(Deserialize)]
struct TickerFrame {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    trade_price: f64,
    #[serde(default)]
    signed_change_rate: f64,
    #[serde(default)]
    timestamp: i64,
}

fn parse_ticker(text: &str) -> Result<Option<PriceTick>> {
    let frame: TickerFrame = serde_json::from_str(text)?;
    if frame.kind != "ticker" || frame.code.is_empty() {
        return Ok(None);
    }
    let timestamp = Utc
        .timestamp_millis_opt(frame.timestamp)
        .single()
        .unwrap_or_else(Utc::now);
    Ok(Some(PriceTick {
        ticker: frame.code,
        price: frame.trade_price,
        change_pct: frame.signed_change_rate * 100.0,
        timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_frames_parse_to_price_ticks() {
        let text = r#"{"type":"ticker","code":"KRW-BTC","trade_price":81000000.0,
                       "signed_change_rate":0.012,"timestamp":1754006400000}"#;
        let tick = parse_ticker(text).unwrap().unwrap();
        assert_eq!(tick.ticker, "KRW-BTC");
        assert_eq!(tick.price, 81_000_000.0);
        assert!((tick.change_pct - 1.2).abs() < 1e-9);
    }

    #[test]
    fn non_ticker_frames_are_skipped() {
        assert!(parse_ticker(r#"{"status":"UP"}"#).unwrap().is_none());
    }
}
