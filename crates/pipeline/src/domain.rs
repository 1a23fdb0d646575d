use std::collections::BTreeMap;

use serde_json::json;

use common::{AnalysisKind, Market, Signal};

use crate::scoring;
use crate::session::MarketContext;

/// Per-market strategy: which middle analysis runs, the risk weights and
/// the quantity arithmetic. One pipeline serves both markets through this
/// trait instead of two parallel implementations.
pub trait AssetDomain: Send + Sync {
    fn market(&self) -> Market;

    /// The analysis that runs alongside technical and sentiment:
    /// fundamental for stocks, market-flow for crypto.
    fn middle_kind(&self) -> AnalysisKind;

    /// Deterministic signal, confidence and indicator map for the middle
    /// analysis.
    fn middle_signal(
        &self,
        ctx: &MarketContext,
    ) -> (Signal, f64, BTreeMap<String, serde_json::Value>);

    /// Baseline risk contribution of the asset class.
    fn base_risk(&self) -> f64;

    /// Divisor mapping daily change into the volatility risk term.
    fn volatility_divisor(&self) -> f64;

    /// (stop-loss, take-profit) offsets as fractions of entry price,
    /// widening as the risk score grows.
    fn stop_take_offsets(&self, risk_score: f64) -> (f64, f64);

    /// Round an order quantity to the market's granularity.
    fn quantize(&self, quantity: f64) -> f64;

    /// Quantity for a partial (half) exit of `held` units.
    fn reduce_quantity(&self, held: f64) -> f64;

    /// Target position size in percent of orderable cash, by risk.
    fn position_size_pct(&self, risk_score: f64) -> f64 {
        if risk_score < 0.5 {
            5.0
        } else {
            3.0
        }
    }
}

/// Korean stocks: valuation-driven middle analysis, whole-share lots.
pub struct StockDomain;

impl AssetDomain for StockDomain {
    fn market(&self) -> Market {
        Market::Krx
    }

    fn middle_kind(&self) -> AnalysisKind {
        AnalysisKind::Fundamental
    }

    fn middle_signal(
        &self,
        ctx: &MarketContext,
    ) -> (Signal, f64, BTreeMap<String, serde_json::Value>) {
        let (signal, confidence) =
            scoring::fundamental_signal(ctx.asset.per, ctx.asset.pbr, ctx.asset.eps);
        let mut indicators = BTreeMap::new();
        indicators.insert("per".into(), json!(ctx.asset.per));
        indicators.insert("pbr".into(), json!(ctx.asset.pbr));
        indicators.insert("eps".into(), json!(ctx.asset.eps));
        (signal, confidence, indicators)
    }

    fn base_risk(&self) -> f64 {
        0.3
    }

    fn volatility_divisor(&self) -> f64 {
        15.0
    }

    fn stop_take_offsets(&self, risk_score: f64) -> (f64, f64) {
        if risk_score < 0.5 {
            (0.05, 0.10)
        } else {
            (0.08, 0.08)
        }
    }

    fn quantize(&self, quantity: f64) -> f64 {
        if quantity.is_finite() && quantity > 0.0 {
            quantity.floor()
        } else {
            0.0
        }
    }

    fn reduce_quantity(&self, held: f64) -> f64 {
        ((held / 2.0).floor()).max(1.0)
    }
}

/// KRW crypto pairs: flow-driven middle analysis, fractional units,
/// higher base risk.
pub struct CryptoDomain;

impl AssetDomain for CryptoDomain {
    fn market(&self) -> Market {
        Market::Crypto
    }

    fn middle_kind(&self) -> AnalysisKind {
        AnalysisKind::Market
    }

    fn middle_signal(
        &self,
        ctx: &MarketContext,
    ) -> (Signal, f64, BTreeMap<String, serde_json::Value>) {
        let bid_ask = ctx.orderbook.bid_ask_ratio();
        let (signal, confidence) = scoring::market_signal(ctx.asset.change_pct, bid_ask);
        let mut indicators = BTreeMap::new();
        indicators.insert("change_24h_pct".into(), json!(ctx.asset.change_pct));
        indicators.insert("bid_ask_ratio".into(), json!(bid_ask));
        indicators.insert("volume_24h".into(), json!(ctx.asset.volume));
        (signal, confidence, indicators)
    }

    fn base_risk(&self) -> f64 {
        0.4
    }

    fn volatility_divisor(&self) -> f64 {
        20.0
    }

    fn stop_take_offsets(&self, risk_score: f64) -> (f64, f64) {
        if risk_score < 0.5 {
            (0.08, 0.15)
        } else {
            (0.12, 0.10)
        }
    }

    fn quantize(&self, quantity: f64) -> f64 {
        if quantity.is_finite() && quantity > 0.0 {
            (quantity * 1e8).floor() / 1e8
        } else {
            0.0
        }
    }

    fn reduce_quantity(&self, held: f64) -> f64 {
        self.quantize(held / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_offsets_widen_with_risk() {
        let domain = StockDomain;
        assert_eq!(domain.stop_take_offsets(0.3), (0.05, 0.10));
        assert_eq!(domain.stop_take_offsets(0.7), (0.08, 0.08));
    }

    #[test]
    fn crypto_offsets_are_wider_than_stocks() {
        let domain = CryptoDomain;
        assert_eq!(domain.stop_take_offsets(0.3), (0.08, 0.15));
        assert_eq!(domain.stop_take_offsets(0.7), (0.12, 0.10));
    }

    #[test]
    fn stock_reduce_never_drops_below_one_share() {
        let domain = StockDomain;
        assert_eq!(domain.reduce_quantity(1.0), 1.0);
        assert_eq!(domain.reduce_quantity(7.0), 3.0);
    }

    #[test]
    fn crypto_quantities_keep_eight_decimals() {
        let domain = CryptoDomain;
        assert_eq!(domain.quantize(0.123456789), 0.12345678);
        assert_eq!(domain.reduce_quantity(0.5), 0.25);
    }
}
