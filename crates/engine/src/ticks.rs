use common::OrderSide;

/// KRX tick size by price band. Bands change rarely but do change; keep
/// them in this single table and route every limit price through
/// `round_to_tick`.
const KRX_TICK_BANDS: &[(f64, f64)] = &[
    (2_000.0, 1.0),
    (5_000.0, 5.0),
    (20_000.0, 10.0),
    (50_000.0, 50.0),
    (200_000.0, 100.0),
    (500_000.0, 500.0),
];

const KRX_TOP_TICK: f64 = 1_000.0;

/// Tick size for a KRX price.
pub fn krx_tick_size(price: f64) -> f64 {
    for (upper, tick) in KRX_TICK_BANDS {
        if price < *upper {
            return *tick;
        }
    }
    KRX_TOP_TICK
}

/// Round a limit price onto a valid KRX tick. Buys round up and sells
/// round down, so the rounded order stays competitive but valid.
pub fn round_to_tick(price: f64, side: OrderSide) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    let tick = krx_tick_size(price);
    let steps = price / tick;
    let rounded = match side {
        OrderSide::Buy => steps.ceil() * tick,
        OrderSide::Sell => steps.floor() * tick,
    };
    // Rounding up can push the price into the next band; its tick is a
    // multiple of the current one, so the price stays valid.
    rounded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_boundaries() {
        assert_eq!(krx_tick_size(1_999.0), 1.0);
        assert_eq!(krx_tick_size(2_000.0), 5.0);
        assert_eq!(krx_tick_size(19_999.0), 10.0);
        assert_eq!(krx_tick_size(50_000.0), 100.0);
        assert_eq!(krx_tick_size(499_999.0), 500.0);
        assert_eq!(krx_tick_size(500_000.0), 1_000.0);
    }

    #[test]
    fn buys_round_up_sells_round_down() {
        assert_eq!(round_to_tick(50_120.0, OrderSide::Buy), 50_200.0);
        assert_eq!(round_to_tick(50_120.0, OrderSide::Sell), 50_100.0);
        assert_eq!(round_to_tick(1_234.0, OrderSide::Buy), 1_234.0);
    }

    #[test]
    fn rounding_is_idempotent() {
        for price in [1_234.5, 7_777.0, 50_120.0, 123_456.0, 999_999.0] {
            for side in [OrderSide::Buy, OrderSide::Sell] {
                let once = round_to_tick(price, side);
                let twice = round_to_tick(once, side);
                assert_eq!(once, twice, "price {price} side {side}");
            }
        }
    }

    #[test]
    fn non_positive_price_rounds_to_zero() {
        assert_eq!(round_to_tick(0.0, OrderSide::Buy), 0.0);
        assert_eq!(round_to_tick(-10.0, OrderSide::Sell), 0.0);
    }
}
