use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use common::{Error, ExchangeClient, Market, PriceTick, Result};
use risk::PriceSource;

/// Price lookup for the risk monitor, backed by the exchange clients with
/// an overlay of live WebSocket ticks (crypto) when available.
pub struct ClientPriceSource {
    stock: Arc<dyn ExchangeClient>,
    crypto: Option<Arc<dyn ExchangeClient>>,
    live: RwLock<HashMap<String, f64>>,
}

impl ClientPriceSource {
    pub fn new(
        stock: Arc<dyn ExchangeClient>,
        crypto: Option<Arc<dyn ExchangeClient>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stock,
            crypto,
            live: RwLock::new(HashMap::new()),
        })
    }

    /// Feed live ticks into the overlay. Returns the pump task handle so
    /// the coordinator can cancel it on shutdown.
    pub fn watch_ticks(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<PriceTick>,
    ) -> tokio::task::JoinHandle<()> {
        let source = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(tick) => {
                        source.live.write().await.insert(tick.ticker, tick.price);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "price tick stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl PriceSource for ClientPriceSource {
    async fn current_price(&self, ticker: &str, market: Market) -> Result<f64> {
        if let Some(price) = self.live.read().await.get(ticker) {
            return Ok(*price);
        }
        let client = match market {
            Market::Krx => &self.stock,
            Market::Crypto => self
                .crypto
                .as_ref()
                .ok_or_else(|| Error::Config("crypto exchange not configured".into()))?,
        };
        Ok(client.get_asset(ticker).await?.price)
    }
}
