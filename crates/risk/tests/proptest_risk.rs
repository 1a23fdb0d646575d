use common::{AccountSnapshot, Market, OrderSide, RiskParameters};
use proptest::prelude::*;
use risk::PortfolioAgent;

proptest! {
    /// Allocation arithmetic must never panic and never produce negative
    /// or non-finite quantities, whatever the account looks like.
    #[test]
    fn allocation_never_panics_on_extreme_inputs(
        equity in 0.0f64..1e12,
        cash in 0.0f64..1e12,
        stock_value in 0.0f64..1e12,
        entry_price in 0.0001f64..1e9,
        risk_grade in 0u8..=10,
    ) {
        let agent = PortfolioAgent::new(RiskParameters::default());
        let account = AccountSnapshot {
            total_equity: equity,
            available_cash: cash,
            total_stock_value: stock_value,
        };
        let plan = agent.calculate_allocation(
            &account,
            "005930",
            None,
            Market::Krx,
            OrderSide::Buy,
            entry_price,
            risk_grade,
            None,
            None,
            None,
            &[],
        );
        prop_assert!(plan.quantity >= 0.0);
        prop_assert!(plan.quantity.is_finite());
        prop_assert!(plan.estimated_amount >= 0.0);
        prop_assert!(!plan.rationale.is_empty());
    }

    /// A buy plan must respect both the cash reserve and the total-stock
    /// cap (no positions held, so the plan amount is the whole exposure).
    #[test]
    fn buy_amount_respects_caps(
        equity in 1_000.0f64..1e10,
        cash_ratio in 0.0f64..1.0,
        entry_price in 1.0f64..1e7,
    ) {
        let params = RiskParameters::default();
        let agent = PortfolioAgent::new(params.clone());
        let cash = equity * cash_ratio;
        let account = AccountSnapshot {
            total_equity: equity,
            available_cash: cash,
            total_stock_value: equity - cash,
        };
        let plan = agent.calculate_allocation(
            &account,
            "005930",
            None,
            Market::Krx,
            OrderSide::Buy,
            entry_price,
            3,
            None,
            None,
            None,
            &[],
        );
        // Never spend below the reserve ...
        prop_assert!(plan.estimated_amount <= (cash - equity * params.min_cash_ratio).max(0.0) + 1e-6);
        // ... and never above the risk-adjusted single-position cap.
        prop_assert!(plan.estimated_amount <= equity * params.max_single_position_pct + 1e-6);
    }
}
