use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::{
    AccountSnapshot, Market, OrderRequest, OrderSide, Position, RiskParameters,
};

/// Planned allocation for one approved trade. Rebalance sells, when
/// present, must execute before the primary order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub ticker: String,
    pub name: Option<String>,
    pub side: OrderSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub estimated_amount: f64,
    /// Share of total equity this trade would occupy, percent.
    pub position_pct: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub risk_grade: u8,
    pub rebalance_orders: Vec<OrderRequest>,
    pub rationale: String,
}

impl AllocationPlan {
    /// Zero-quantity plan with a diagnostic rationale.
    pub fn empty(
        ticker: impl Into<String>,
        side: OrderSide,
        entry_price: f64,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            name: None,
            side,
            quantity: 0.0,
            entry_price,
            estimated_amount: 0.0,
            position_pct: 0.0,
            stop_loss: None,
            take_profit: None,
            risk_grade: 5,
            rebalance_orders: Vec::new(),
            rationale: rationale.into(),
        }
    }
}

/// Position-sizing and rebalancing arithmetic.
///
/// Pure over a snapshot of account, positions and the request — it never
/// talks to an exchange and never issues orders itself.
pub struct PortfolioAgent {
    params: RiskParameters,
}

impl PortfolioAgent {
    pub fn new(params: RiskParameters) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RiskParameters {
        &self.params
    }

    #[allow(clippy::too_many_arguments)]
    pub fn calculate_allocation(
        &self,
        account: &AccountSnapshot,
        ticker: &str,
        name: Option<&str>,
        market: Market,
        side: OrderSide,
        entry_price: f64,
        risk_grade: u8,
        target_position_pct: Option<f64>,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        positions: &[Position],
    ) -> AllocationPlan {
        info!(
            ticker,
            side = %side,
            entry_price,
            risk_grade,
            "calculating allocation"
        );

        let existing = positions.iter().find(|p| p.ticker == ticker);

        match side {
            OrderSide::Sell => self.sell_allocation(existing, ticker, name, market, entry_price),
            OrderSide::Buy => self.buy_allocation(
                account,
                ticker,
                name,
                market,
                entry_price,
                risk_grade,
                target_position_pct,
                stop_loss,
                take_profit,
                existing,
                positions,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn buy_allocation(
        &self,
        account: &AccountSnapshot,
        ticker: &str,
        name: Option<&str>,
        market: Market,
        entry_price: f64,
        risk_grade: u8,
        target_position_pct: Option<f64>,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        existing: Option<&Position>,
        positions: &[Position],
    ) -> AllocationPlan {
        if entry_price <= 0.0 {
            return AllocationPlan::empty(ticker, OrderSide::Buy, entry_price, "invalid entry price");
        }

        // 1. Capital left after the cash reserve and the total-stock cap.
        let available_for_trade = self.available_capital(account, positions);
        if available_for_trade <= 0.0 {
            warn!(ticker, "no capital available");
            return AllocationPlan::empty(
                ticker,
                OrderSide::Buy,
                entry_price,
                "insufficient capital: minimum cash reserve or stock cap reached",
            );
        }

        // 2. Risk-adjusted single-position ceiling.
        let mut max_position_value = self.max_position_value(account.total_equity, risk_grade);

        // 3. Existing holdings consume the ceiling.
        if let Some(pos) = existing {
            let current_value = pos.market_value();
            if current_value >= max_position_value {
                let pct = if account.total_equity > 0.0 {
                    current_value / account.total_equity * 100.0
                } else {
                    0.0
                };
                warn!(ticker, current_pct = pct, "already at max position");
                return AllocationPlan::empty(
                    ticker,
                    OrderSide::Buy,
                    entry_price,
                    format!(
                        "already holding {:.0} units ({pct:.1}% of equity), max position reached",
                        pos.quantity
                    ),
                );
            }
            max_position_value -= current_value;
        }

        // 4. + 5. Constrain and convert to units. The proposal's target
        // size is a further cap, never an entitlement.
        let mut position_value = available_for_trade.min(max_position_value);
        if let Some(target_pct) = target_position_pct.filter(|p| *p > 0.0) {
            position_value = position_value.min(account.total_equity * target_pct / 100.0);
        }
        let quantity = quantize(market, position_value / entry_price);

        if quantity <= 0.0 {
            return AllocationPlan::empty(
                ticker,
                OrderSide::Buy,
                entry_price,
                "position size too small after risk adjustment",
            );
        }

        let estimated_amount = quantity * entry_price;
        let position_pct = if account.total_equity > 0.0 {
            estimated_amount / account.total_equity * 100.0
        } else {
            0.0
        };

        let rebalance_orders =
            self.rebalance_orders_for_amount(account, positions, estimated_amount);

        let rationale = build_rationale(risk_grade, position_pct, existing.is_some());

        info!(
            ticker,
            quantity,
            estimated_amount,
            position_pct,
            "allocation computed"
        );

        AllocationPlan {
            ticker: ticker.to_string(),
            name: name.map(str::to_string),
            side: OrderSide::Buy,
            quantity,
            entry_price,
            estimated_amount,
            position_pct,
            stop_loss,
            take_profit,
            risk_grade,
            rebalance_orders,
            rationale,
        }
    }

    fn sell_allocation(
        &self,
        existing: Option<&Position>,
        ticker: &str,
        name: Option<&str>,
        market: Market,
        price: f64,
    ) -> AllocationPlan {
        let Some(pos) = existing else {
            return AllocationPlan::empty(ticker, OrderSide::Sell, price, "no position to sell");
        };

        let quantity = quantize(market, pos.quantity);
        AllocationPlan {
            ticker: ticker.to_string(),
            name: name.map(str::to_string),
            side: OrderSide::Sell,
            quantity,
            entry_price: price,
            estimated_amount: quantity * price,
            position_pct: 0.0,
            stop_loss: None,
            take_profit: None,
            risk_grade: 5,
            rebalance_orders: Vec::new(),
            rationale: "full position liquidation".into(),
        }
    }

    /// Capital available for a new buy: cash above the reserve, capped by
    /// the remaining headroom under the total-stock limit. Never negative.
    fn available_capital(&self, account: &AccountSnapshot, positions: &[Position]) -> f64 {
        let min_cash = account.total_equity * self.params.min_cash_ratio;
        let available = account.available_cash - min_cash;

        let current_stock_value: f64 = positions.iter().map(Position::market_value).sum();
        let max_stock_value = account.total_equity * self.params.max_total_stock_pct;
        let stock_headroom = max_stock_value - current_stock_value;

        available.min(stock_headroom).max(0.0)
    }

    /// Risk grades 1-3 take the full single-position cap, 4-6 take 70%,
    /// 7-10 take half.
    fn max_position_value(&self, total_equity: f64, risk_grade: u8) -> f64 {
        let base = total_equity * self.params.max_single_position_pct;
        let risk_factor = match risk_grade {
            0..=3 => 1.0,
            4..=6 => 0.7,
            _ => 0.5,
        };
        base * risk_factor
    }

    /// Sells needed before `new_trade_amount` of buying can land without
    /// breaching the total-stock cap. Worst performers are trimmed first.
    pub fn rebalance_orders_for_amount(
        &self,
        account: &AccountSnapshot,
        positions: &[Position],
        new_trade_amount: f64,
    ) -> Vec<OrderRequest> {
        let current_stock_value: f64 = positions.iter().map(Position::market_value).sum();
        let projected = current_stock_value + new_trade_amount;
        let max_stock_value = account.total_equity * self.params.max_total_stock_pct;

        if projected <= max_stock_value {
            return Vec::new();
        }
        let mut excess = projected - max_stock_value;

        let mut ranked: Vec<&Position> = positions.iter().collect();
        ranked.sort_by(|a, b| {
            a.unrealized_pnl_pct()
                .partial_cmp(&b.unrealized_pnl_pct())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut orders = Vec::new();
        for pos in ranked {
            if excess <= 0.0 {
                break;
            }
            if pos.current_price <= 0.0 {
                continue;
            }
            let pos_value = pos.market_value();
            let sell_value = pos_value.min(excess);
            let sell_qty = quantize(pos.market, sell_value / pos.current_price);
            if sell_qty > 0.0 {
                orders.push(
                    OrderRequest::limit(
                        pos.ticker.clone(),
                        pos.market,
                        OrderSide::Sell,
                        sell_qty,
                        pos.current_price,
                    )
                    .with_reason("rebalancing to accommodate new position"),
                );
                excess -= sell_qty * pos.current_price;
            }
        }
        orders
    }

    /// Trim any position whose weight exceeds the single-position cap by
    /// more than the 10% tolerance band.
    pub fn suggest_rebalancing(
        &self,
        account: &AccountSnapshot,
        positions: &[Position],
    ) -> Vec<OrderRequest> {
        if account.total_equity <= 0.0 {
            return Vec::new();
        }

        let max_pct = self.params.max_single_position_pct * 100.0;
        let mut orders = Vec::new();

        for pos in positions {
            let pos_pct = pos.market_value() / account.total_equity * 100.0;
            if pos_pct > max_pct * 1.1 {
                let excess_value = (pos_pct - max_pct) / 100.0 * account.total_equity;
                let sell_qty = quantize(pos.market, excess_value / pos.current_price);
                if sell_qty > 0.0 {
                    orders.push(
                        OrderRequest::limit(
                            pos.ticker.clone(),
                            pos.market,
                            OrderSide::Sell,
                            sell_qty,
                            pos.current_price,
                        )
                        .with_reason(format!(
                            "position exceeds max allocation ({pos_pct:.1}% > {max_pct:.1}%)"
                        )),
                    );
                }
            }
        }
        orders
    }
}

/// Stocks trade in whole shares; crypto keeps fractional units.
fn quantize(market: Market, quantity: f64) -> f64 {
    if !quantity.is_finite() || quantity <= 0.0 {
        return 0.0;
    }
    match market {
        Market::Krx => quantity.floor(),
        Market::Crypto => (quantity * 1e8).floor() / 1e8,
    }
}

fn build_rationale(risk_grade: u8, position_pct: f64, is_addition: bool) -> String {
    let mut parts = Vec::new();
    match risk_grade {
        0..=3 => parts.push(format!("low risk (grade {risk_grade}/10)")),
        4..=6 => parts.push(format!("medium risk (grade {risk_grade}/10)")),
        _ => parts.push(format!("high risk (grade {risk_grade}/10), reduced position")),
    }
    parts.push(format!("position size {position_pct:.1}% of equity"));
    if is_addition {
        parts.push("adding to existing position".into());
    }
    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{PositionStatus, StopLossMode};

    fn account(equity: f64, cash: f64, stock: f64) -> AccountSnapshot {
        AccountSnapshot {
            total_equity: equity,
            available_cash: cash,
            total_stock_value: stock,
        }
    }

    fn position(ticker: &str, qty: f64, avg: f64, cur: f64) -> Position {
        Position {
            ticker: ticker.into(),
            name: ticker.into(),
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

    fn agent() -> PortfolioAgent {
        PortfolioAgent::new(RiskParameters::default())
    }

    #[test]
    fn low_risk_buy_uses_full_single_position_cap() {
        // equity 10M, cash 10M, no positions. cap = 15% * 1.0 = 1.5M.
        // available = min(10M - 2M, 8M - 0) = 8M. position = 1.5M.
        let plan = agent().calculate_allocation(
            &account(10_000_000.0, 10_000_000.0, 0.0),
            "005930",
            Some("Samsung Electronics"),
            Market::Krx,
            OrderSide::Buy,
            50_000.0,
            3,
            None,
            None,
            None,
            &[],
        );
        assert_eq!(plan.quantity, 30.0);
        assert!(plan.rebalance_orders.is_empty());
    }

    #[test]
    fn high_risk_halves_the_cap() {
        let plan = agent().calculate_allocation(
            &account(10_000_000.0, 10_000_000.0, 0.0),
            "005930",
            None,
            Market::Krx,
            OrderSide::Buy,
            50_000.0,
            8,
            None,
            None,
            None,
            &[],
        );
        // 1.5M * 0.5 = 750k -> 15 shares
        assert_eq!(plan.quantity, 15.0);
    }

    #[test]
    fn zero_quantity_when_cash_reserve_binds() {
        // cash 1.5M < equity * min_cash_ratio (2M) -> nothing available
        let plan = agent().calculate_allocation(
            &account(10_000_000.0, 1_500_000.0, 8_500_000.0),
            "005930",
            None,
            Market::Krx,
            OrderSide::Buy,
            50_000.0,
            3,
            None,
            None,
            None,
            &[],
        );
        assert_eq!(plan.quantity, 0.0);
        assert!(plan.rationale.contains("insufficient capital"));
    }

    #[test]
    fn zero_quantity_when_existing_position_at_cap() {
        let existing = position("005930", 30.0, 50_000.0, 50_000.0); // 1.5M = cap
        let plan = agent().calculate_allocation(
            &account(10_000_000.0, 5_000_000.0, 1_500_000.0),
            "005930",
            None,
            Market::Krx,
            OrderSide::Buy,
            50_000.0,
            3,
            None,
            None,
            None,
            &[existing],
        );
        assert_eq!(plan.quantity, 0.0);
        assert!(plan.rationale.contains("max position"));
    }

    #[test]
    fn existing_position_reduces_headroom() {
        let existing = position("005930", 10.0, 50_000.0, 50_000.0); // 500k held
        let plan = agent().calculate_allocation(
            &account(10_000_000.0, 5_000_000.0, 500_000.0),
            "005930",
            None,
            Market::Krx,
            OrderSide::Buy,
            50_000.0,
            3,
            None,
            None,
            None,
            &[existing],
        );
        // cap 1.5M - 500k held = 1M -> 20 shares
        assert_eq!(plan.quantity, 20.0);
    }

    #[test]
    fn sell_plan_liquidates_full_position() {
        let existing = position("005930", 42.0, 50_000.0, 55_000.0);
        let plan = agent().calculate_allocation(
            &account(10_000_000.0, 5_000_000.0, 2_310_000.0),
            "005930",
            None,
            Market::Krx,
            OrderSide::Sell,
            55_000.0,
            3,
            None,
            None,
            None,
            &[existing],
        );
        assert_eq!(plan.quantity, 42.0);
        assert_eq!(plan.side, OrderSide::Sell);
    }

    #[test]
    fn sell_without_position_is_zero() {
        let plan = agent().calculate_allocation(
            &account(10_000_000.0, 5_000_000.0, 0.0),
            "005930",
            None,
            Market::Krx,
            OrderSide::Sell,
            55_000.0,
            3,
            None,
            None,
            None,
            &[],
        );
        assert_eq!(plan.quantity, 0.0);
        assert!(plan.rationale.contains("no position"));
    }

    #[test]
    fn rebalance_trims_worst_performer_first() {
        let params = RiskParameters::default();
        let agent = PortfolioAgent::new(params);
        // Stock value 7.5M of 10M equity, cap 8M. A 1M buy overflows by 500k.
        let loser = position("AAAAAA", 100.0, 30_000.0, 25_000.0); // -16.7%, 2.5M
        let winner = position("BBBBBB", 100.0, 40_000.0, 50_000.0); // +25%, 5.0M
        let orders = agent.rebalance_orders_for_amount(
            &account(10_000_000.0, 2_000_000.0, 7_500_000.0),
            &[winner, loser],
            1_000_000.0,
        );
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].ticker, "AAAAAA");
        assert_eq!(orders[0].quantity, 20.0); // 500k / 25k
    }

    #[test]
    fn suggest_rebalancing_respects_tolerance_band() {
        let agent = agent();
        // cap 15%; 16% is inside the 1.1 band, 20% is outside
        let inside = position("AAAAAA", 32.0, 50_000.0, 50_000.0); // 1.6M of 10M
        let outside = position("BBBBBB", 40.0, 50_000.0, 50_000.0); // 2.0M of 10M
        let orders = agent.suggest_rebalancing(
            &account(10_000_000.0, 3_000_000.0, 3_600_000.0),
            &[inside, outside],
        );
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].ticker, "BBBBBB");
        // excess 5% of 10M = 500k -> 10 shares
        assert_eq!(orders[0].quantity, 10.0);
    }

    #[test]
    fn target_position_pct_caps_below_the_risk_cap() {
        // Fresh 10M account, risk grade 3, target 10% -> 1M -> 20 shares
        // at 50k even though the single-position cap would allow 1.5M.
        let plan = agent().calculate_allocation(
            &account(10_000_000.0, 10_000_000.0, 0.0),
            "005930",
            None,
            Market::Krx,
            OrderSide::Buy,
            50_000.0,
            3,
            Some(10.0),
            None,
            None,
            &[],
        );
        assert_eq!(plan.quantity, 20.0);
    }

    #[test]
    fn crypto_quantities_stay_fractional() {
        let plan = PortfolioAgent::new(RiskParameters::default()).calculate_allocation(
            &account(10_000_000.0, 10_000_000.0, 0.0),
            "KRW-BTC",
            None,
            Market::Crypto,
            OrderSide::Buy,
            80_000_000.0,
            3,
            None,
            None,
            None,
            &[],
        );
        assert!(plan.quantity > 0.0);
        assert!(plan.quantity < 1.0);
    }
}
