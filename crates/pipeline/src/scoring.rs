use common::{AnalysisKind, AnalysisResult, Candle, Signal, TradeAction};

/// Bounds for every confidence value produced by the pipeline.
pub const CONFIDENCE_FLOOR: f64 = 0.30;
pub const CONFIDENCE_CEIL: f64 = 0.95;

pub fn clamp_confidence(confidence: f64) -> f64 {
    confidence.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEIL)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cross {
    Golden,
    Dead,
    None,
}

/// Indicators derived from the daily chart (candles newest first).
#[derive(Debug, Clone)]
pub struct TechIndicators {
    pub rsi: Option<f64>,
    pub trend: Trend,
    pub cross: Cross,
    pub volume_ratio: Option<f64>,
}

/// A named pattern detected in the indicators, with its directional bias.
#[derive(Debug, Clone)]
pub struct DetectedSignal {
    pub name: &'static str,
    pub signal: Signal,
}

/// Compute indicators from daily candles ordered newest first.
pub fn compute_indicators(chart: &[Candle]) -> TechIndicators {
    let closes: Vec<f64> = chart.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = chart.iter().map(|c| c.volume).collect();

    let rsi = rsi_14(&closes);
    let trend = trend_from_closes(&closes);
    let cross = cross_from_closes(&closes);
    let volume_ratio = volume_ratio(&volumes);

    TechIndicators {
        rsi,
        trend,
        cross,
        volume_ratio,
    }
}

/// 14-period RSI. Candles are newest first, so the difference at step i
/// is `closes[i-1] - closes[i]`.
fn rsi_14(closes: &[f64]) -> Option<f64> {
    if closes.len() < 15 {
        return None;
    }
    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..15 {
        let diff = closes[i - 1] - closes[i];
        if diff > 0.0 {
            gains += diff;
        } else {
            losses += -diff;
        }
    }
    let avg_gain = gains / 14.0;
    let avg_loss = losses / 14.0;
    if avg_gain <= 0.0 && avg_loss <= 0.0 {
        // No movement at all: RSI is undefined, not extreme.
        return None;
    }
    if avg_loss <= 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Recent 10-day average versus the prior 10-day average, with a 2% band.
fn trend_from_closes(closes: &[f64]) -> Trend {
    if closes.len() < 20 {
        return Trend::Neutral;
    }
    let recent: f64 = closes[..10].iter().sum::<f64>() / 10.0;
    let older: f64 = closes[10..20].iter().sum::<f64>() / 10.0;
    if recent > older * 1.02 {
        Trend::Bullish
    } else if recent < older * 0.98 {
        Trend::Bearish
    } else {
        Trend::Neutral
    }
}

/// 5/20 moving-average cross between yesterday and today.
fn cross_from_closes(closes: &[f64]) -> Cross {
    if closes.len() < 21 {
        return Cross::None;
    }
    let sma = |range: std::ops::Range<usize>| -> f64 {
        let len = range.len() as f64;
        closes[range].iter().sum::<f64>() / len
    };
    let short_now = sma(0..5);
    let long_now = sma(0..20);
    let short_prev = sma(1..6);
    let long_prev = sma(1..21);

    if short_prev <= long_prev && short_now > long_now {
        Cross::Golden
    } else if short_prev >= long_prev && short_now < long_now {
        Cross::Dead
    } else {
        Cross::None
    }
}

/// Latest volume against the trailing 20-day average.
fn volume_ratio(volumes: &[f64]) -> Option<f64> {
    if volumes.len() < 21 {
        return None;
    }
    let avg: f64 = volumes[1..21].iter().sum::<f64>() / 20.0;
    if avg <= 0.0 {
        return None;
    }
    Some(volumes[0] / avg)
}

/// Name the patterns present in the indicators. These feed the enhanced
/// signal adjustment and the key-factor list.
pub fn detect_signals(indicators: &TechIndicators, bid_ask_ratio: f64) -> Vec<DetectedSignal> {
    let mut signals = Vec::new();

    if let Some(rsi) = indicators.rsi {
        if rsi < 30.0 {
            signals.push(DetectedSignal {
                name: "rsi_oversold",
                signal: Signal::Buy,
            });
        } else if rsi > 70.0 {
            signals.push(DetectedSignal {
                name: "rsi_overbought",
                signal: Signal::Sell,
            });
        }
    }

    match indicators.cross {
        Cross::Golden => signals.push(DetectedSignal {
            name: "golden_cross",
            signal: Signal::StrongBuy,
        }),
        Cross::Dead => signals.push(DetectedSignal {
            name: "dead_cross",
            signal: Signal::StrongSell,
        }),
        Cross::None => {}
    }

    match indicators.trend {
        Trend::Bullish => signals.push(DetectedSignal {
            name: "uptrend",
            signal: Signal::Buy,
        }),
        Trend::Bearish => signals.push(DetectedSignal {
            name: "downtrend",
            signal: Signal::Sell,
        }),
        Trend::Neutral => {}
    }

    if let Some(ratio) = indicators.volume_ratio {
        if ratio > 2.0 {
            // Volume confirms the prevailing trend; on its own it is noise.
            match indicators.trend {
                Trend::Bullish => signals.push(DetectedSignal {
                    name: "volume_surge",
                    signal: Signal::Buy,
                }),
                Trend::Bearish => signals.push(DetectedSignal {
                    name: "volume_surge",
                    signal: Signal::Sell,
                }),
                Trend::Neutral => {}
            }
        }
    }

    if bid_ask_ratio > 1.3 {
        signals.push(DetectedSignal {
            name: "bid_dominance",
            signal: Signal::Buy,
        });
    } else if bid_ask_ratio < 0.7 {
        signals.push(DetectedSignal {
            name: "ask_dominance",
            signal: Signal::Sell,
        });
    }

    signals
}

/// Base technical score over RSI, trend, cross, order-book skew and
/// volume. The canonical table:
/// RSI < 30 +2, < 40 +1, > 70 −2, > 60 −1; trend ±1; cross ±2;
/// bid/ask > 1.3 +1, < 0.7 −1; volume ratio > 2 +1.
pub fn technical_signal(indicators: &TechIndicators, bid_ask_ratio: f64) -> Signal {
    let mut score: i32 = 0;

    if let Some(rsi) = indicators.rsi {
        if rsi < 30.0 {
            score += 2;
        } else if rsi < 40.0 {
            score += 1;
        } else if rsi > 70.0 {
            score -= 2;
        } else if rsi > 60.0 {
            score -= 1;
        }
    }

    match indicators.trend {
        Trend::Bullish => score += 1,
        Trend::Bearish => score -= 1,
        Trend::Neutral => {}
    }

    match indicators.cross {
        Cross::Golden => score += 2,
        Cross::Dead => score -= 2,
        Cross::None => {}
    }

    if bid_ask_ratio > 1.3 {
        score += 1;
    } else if bid_ask_ratio < 0.7 {
        score -= 1;
    }

    if indicators.volume_ratio.map(|r| r > 2.0).unwrap_or(false) {
        score += 1;
    }

    match score {
        s if s >= 4 => Signal::StrongBuy,
        s if s >= 2 => Signal::Buy,
        s if s <= -4 => Signal::StrongSell,
        s if s <= -2 => Signal::Sell,
        _ => Signal::Hold,
    }
}

/// Adjust the base signal by the detected-signal tally. Detected signals
/// may reinforce the base direction or pull a disagreement down to hold,
/// but never flip it outright.
pub fn technical_signal_enhanced(
    indicators: &TechIndicators,
    bid_ask_ratio: f64,
    detected: &[DetectedSignal],
) -> Signal {
    let base = technical_signal(indicators, bid_ask_ratio);

    let mut bullish = 0i32;
    let mut bearish = 0i32;
    for s in detected {
        match s.signal {
            Signal::StrongBuy => bullish += 2,
            Signal::Buy => bullish += 1,
            Signal::StrongSell => bearish += 2,
            Signal::Sell => bearish += 1,
            Signal::Hold => {}
        }
    }
    let net = bullish - bearish;

    match base {
        Signal::Buy | Signal::StrongBuy => {
            if net >= 3 {
                Signal::StrongBuy
            } else if net >= 1 {
                Signal::Buy
            } else if net <= -3 {
                Signal::Hold
            } else {
                base
            }
        }
        Signal::Sell | Signal::StrongSell => {
            if net <= -3 {
                Signal::StrongSell
            } else if net <= -1 {
                Signal::Sell
            } else if net >= 3 {
                Signal::Hold
            } else {
                base
            }
        }
        Signal::Hold => {
            if net >= 4 {
                Signal::Buy
            } else if net <= -4 {
                Signal::Sell
            } else {
                Signal::Hold
            }
        }
    }
}

/// Confidence from signal count, agreement, data availability and the
/// number of strong patterns. Clamped to [0.30, 0.95].
pub fn technical_confidence(detected: &[DetectedSignal], indicators: &TechIndicators) -> f64 {
    let base = 0.5;

    let signal_bonus = (detected.len() as f64 * 0.05).min(0.2);

    let bullish = detected
        .iter()
        .filter(|s| s.signal.is_buyish())
        .count() as f64;
    let bearish = detected
        .iter()
        .filter(|s| s.signal.is_sellish())
        .count() as f64;
    let total = bullish + bearish;
    let agreement_bonus = if total > 0.0 {
        bullish.max(bearish) / total * 0.15
    } else {
        0.0
    };

    let mut data_bonus = 0.0;
    if indicators.rsi.is_some() {
        data_bonus += 0.03;
    }
    if indicators.trend != Trend::Neutral {
        data_bonus += 0.02;
    }
    if indicators.cross != Cross::None {
        data_bonus += 0.05;
    }

    let strong_bonus = (detected
        .iter()
        .filter(|s| matches!(s.signal, Signal::StrongBuy | Signal::StrongSell))
        .count() as f64
        * 0.03)
        .min(0.1);

    clamp_confidence(base + signal_bonus + agreement_bonus + data_bonus + strong_bonus)
}

/// Valuation scoring for stocks. Returns (signal, confidence).
///
/// PER: < 8 +2.5, < 10 +2, < 15 +1, > 50 −2, > 30 −1.
/// PBR: < 0.5 +2, < 0.7 +1.5, < 1 +0.5, > 5 −2, > 3 −1.
/// EPS: positive +0.5, negative −1.
pub fn fundamental_signal(
    per: Option<f64>,
    pbr: Option<f64>,
    eps: Option<f64>,
) -> (Signal, f64) {
    let mut score = 0.0f64;
    let mut data_points = 0u32;

    if let Some(per) = per.filter(|v| *v > 0.0) {
        data_points += 1;
        score += if per < 8.0 {
            2.5
        } else if per < 10.0 {
            2.0
        } else if per < 15.0 {
            1.0
        } else if per > 50.0 {
            -2.0
        } else if per > 30.0 {
            -1.0
        } else {
            0.0
        };
    }

    if let Some(pbr) = pbr.filter(|v| *v > 0.0) {
        data_points += 1;
        score += if pbr < 0.5 {
            2.0
        } else if pbr < 0.7 {
            1.5
        } else if pbr < 1.0 {
            0.5
        } else if pbr > 5.0 {
            -2.0
        } else if pbr > 3.0 {
            -1.0
        } else {
            0.0
        };
    }

    if let Some(eps) = eps {
        data_points += 1;
        if eps > 0.0 {
            score += 0.5;
        } else if eps < 0.0 {
            score -= 1.0;
        }
    }

    let confidence = (0.5
        + (data_points as f64 * 0.10).min(0.30)
        + (score.abs() * 0.05).min(0.15))
    .min(0.90);

    let signal = if score >= 4.0 {
        Signal::StrongBuy
    } else if score >= 2.0 {
        Signal::Buy
    } else if score <= -3.0 {
        Signal::StrongSell
    } else if score <= -1.5 {
        Signal::Sell
    } else {
        Signal::Hold
    };

    (signal, confidence)
}

/// Flow-based signal for crypto (24h change plus order-book skew).
pub fn market_signal(change_24h_pct: f64, bid_ask_ratio: f64) -> (Signal, f64) {
    let mut score = 0i32;
    if change_24h_pct > 5.0 {
        score += 1;
    } else if change_24h_pct < -5.0 {
        score -= 1;
    }
    if bid_ask_ratio > 1.2 {
        score += 1;
    } else if bid_ask_ratio < 0.8 {
        score -= 1;
    }

    let signal = if score >= 2 {
        Signal::Buy
    } else if score <= -2 {
        Signal::Sell
    } else {
        Signal::Hold
    };
    (signal, clamp_confidence(0.5 + score.unsigned_abs() as f64 * 0.1))
}

/// Momentum-style sentiment proxy: price change, volume surge direction
/// and order-book skew.
pub fn sentiment_signal(
    change_pct: f64,
    volume_ratio: Option<f64>,
    bid_ask_ratio: f64,
) -> (Signal, f64) {
    let mut score = 0i32;
    if change_pct > 3.0 {
        score += 1;
    } else if change_pct < -3.0 {
        score -= 1;
    }
    if volume_ratio.map(|r| r > 2.0).unwrap_or(false) {
        if change_pct > 0.0 {
            score += 1;
        } else if change_pct < 0.0 {
            score -= 1;
        }
    }
    if bid_ask_ratio > 1.3 {
        score += 1;
    } else if bid_ask_ratio < 0.7 {
        score -= 1;
    }

    let signal = if score >= 2 {
        Signal::Buy
    } else if score <= -2 {
        Signal::Sell
    } else {
        Signal::Hold
    };
    (signal, clamp_confidence(0.5 + score.unsigned_abs() as f64 * 0.05))
}

/// Risk score: domain base + volatility (|change| / divisor, capped 0.3)
/// + 0.1 per extra distinct signal among the non-risk analyses. In [0, 1].
pub fn risk_score(
    base_risk: f64,
    volatility_divisor: f64,
    change_pct: f64,
    analyses: &[AnalysisResult],
) -> f64 {
    let volatility = (change_pct.abs() / volatility_divisor).min(0.3);

    let signals: Vec<Signal> = analyses
        .iter()
        .filter(|a| a.kind != AnalysisKind::Risk)
        .map(|a| a.signal)
        .collect();
    let mut distinct: Vec<Signal> = Vec::new();
    for s in signals {
        if !distinct.contains(&s) {
            distinct.push(s);
        }
    }
    let disagreement = if distinct.is_empty() {
        0.0
    } else {
        (distinct.len() as f64 - 1.0) * 0.1
    };

    let score = base_risk + volatility + disagreement;
    ((score * 100.0).round() / 100.0).clamp(0.0, 1.0)
}

/// Confidence-weighted consensus over the non-risk analyses.
///
/// Strong signals weigh double. Equal buy and sell scores (including the
/// all-hold case) resolve to hold. The winner upgrades to its strong
/// variant when it at least doubles the loser with a meaningful margin.
pub fn consensus(analyses: &[AnalysisResult]) -> (Signal, f64) {
    let voters: Vec<&AnalysisResult> = analyses
        .iter()
        .filter(|a| a.kind != AnalysisKind::Risk)
        .collect();

    if voters.is_empty() {
        return (Signal::Hold, CONFIDENCE_FLOOR);
    }

    let mut buy_score = 0.0;
    let mut sell_score = 0.0;
    for a in &voters {
        match a.signal {
            Signal::StrongBuy => buy_score += 2.0 * a.confidence,
            Signal::Buy => buy_score += a.confidence,
            Signal::StrongSell => sell_score += 2.0 * a.confidence,
            Signal::Sell => sell_score += a.confidence,
            Signal::Hold => {}
        }
    }

    let avg_confidence =
        clamp_confidence(voters.iter().map(|a| a.confidence).sum::<f64>() / voters.len() as f64);

    let signal = if buy_score > sell_score {
        if buy_score >= 2.0 * sell_score && buy_score >= 1.0 {
            Signal::StrongBuy
        } else {
            Signal::Buy
        }
    } else if sell_score > buy_score {
        if sell_score >= 2.0 * buy_score && sell_score >= 1.0 {
            Signal::StrongSell
        } else {
            Signal::Sell
        }
    } else {
        Signal::Hold
    };

    (signal, avg_confidence)
}

/// Map consensus signal and position state to a trade action. Total over
/// every (signal, held?, P&L%) combination.
pub fn action_with_position(
    signal: Signal,
    has_position: bool,
    position_pnl_pct: f64,
) -> TradeAction {
    if has_position {
        match signal {
            Signal::StrongBuy | Signal::Buy => {
                if position_pnl_pct > 20.0 {
                    TradeAction::Hold
                } else {
                    TradeAction::Add
                }
            }
            Signal::StrongSell => TradeAction::Sell,
            Signal::Sell => TradeAction::Reduce,
            Signal::Hold => TradeAction::Hold,
        }
    } else {
        match signal {
            Signal::StrongBuy | Signal::Buy => TradeAction::Buy,
            Signal::StrongSell => TradeAction::Avoid,
            Signal::Sell | Signal::Hold => TradeAction::Watch,
        }
    }
}

// ─── Reasoner text extraction (advisory only) ────────────────────────────────

/// Pull up to five bullet-point factors out of the reasoner narrative.
pub fn extract_key_factors(text: &str) -> Vec<String> {
    let mut factors = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let is_bullet = line.starts_with('-')
            || line.starts_with('•')
            || line.starts_with('*')
            || line.starts_with('·')
            || line
                .chars()
                .next()
                .map(|c| c.is_ascii_digit() && line[1..].starts_with('.'))
                .unwrap_or(false);
        if !is_bullet {
            continue;
        }
        let clean: String = line
            .trim_start_matches(['-', '•', '*', '·', '.', ' '])
            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ' ')
            .trim()
            .chars()
            .take(200)
            .collect();
        if clean.chars().count() > 10 {
            factors.push(clean);
        }
        if factors.len() == 5 {
            break;
        }
    }
    factors
}

fn extract_case(text: &str, keywords: &[&str]) -> String {
    let lower = text.to_lowercase();
    for keyword in keywords {
        if let Some(start) = lower.find(keyword) {
            return text
                .get(start..)
                .unwrap_or("")
                .chars()
                .take(500)
                .collect();
        }
    }
    String::new()
}

pub fn extract_bull_case(text: &str) -> String {
    extract_case(text, &["bull", "upside", "strength", "positive"])
}

pub fn extract_bear_case(text: &str) -> String {
    extract_case(text, &["bear", "downside", "risk", "weakness", "negative"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn result(kind: AnalysisKind, signal: Signal, confidence: f64) -> AnalysisResult {
        AnalysisResult {
            kind,
            ticker: "005930".into(),
            name: "Samsung Electronics".into(),
            signal,
            confidence,
            summary: String::new(),
            reasoning: String::new(),
            key_factors: Vec::new(),
            indicators: BTreeMap::new(),
        }
    }

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
                    - chrono::Duration::days(i as i64),
                open: *close,
                high: *close * 1.01,
                low: *close * 0.99,
                close: *close,
                volume: 1_000.0,
            })
            .collect()
    }

    fn indicators(rsi: Option<f64>, trend: Trend, cross: Cross, vr: Option<f64>) -> TechIndicators {
        TechIndicators {
            rsi,
            trend,
            cross,
            volume_ratio: vr,
        }
    }

    #[test]
    fn oversold_with_golden_cross_is_strong_buy() {
        // RSI<30 (+2), golden cross (+2) => score 4
        let ind = indicators(Some(25.0), Trend::Neutral, Cross::Golden, None);
        assert_eq!(technical_signal(&ind, 1.0), Signal::StrongBuy);
    }

    #[test]
    fn overbought_downtrend_is_sell() {
        // RSI>70 (-2), bearish (-1) => -3
        let ind = indicators(Some(75.0), Trend::Bearish, Cross::None, None);
        assert_eq!(technical_signal(&ind, 1.0), Signal::Sell);
    }

    #[test]
    fn neutral_indicators_hold() {
        let ind = indicators(Some(50.0), Trend::Neutral, Cross::None, None);
        assert_eq!(technical_signal(&ind, 1.0), Signal::Hold);
    }

    #[test]
    fn detected_signals_cannot_flip_a_disagreeing_base() {
        // Base is buy-side; a heavy bearish tally downgrades to hold,
        // never to sell.
        let ind = indicators(Some(25.0), Trend::Neutral, Cross::Golden, None);
        let bearish: Vec<DetectedSignal> = (0..3)
            .map(|_| DetectedSignal {
                name: "dead_cross",
                signal: Signal::StrongSell,
            })
            .collect();
        assert_eq!(
            technical_signal_enhanced(&ind, 1.0, &bearish),
            Signal::Hold
        );
    }

    #[test]
    fn rsi_needs_fifteen_moving_closes() {
        let ind = compute_indicators(&candles(&[100.0, 101.0, 100.0, 101.0, 100.0]));
        assert!(ind.rsi.is_none(), "too few closes");

        let alternating: Vec<f64> = (0..15)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let ind = compute_indicators(&candles(&alternating));
        assert!(ind.rsi.is_some());

        // A perfectly flat series has no defined RSI.
        let ind = compute_indicators(&candles(&[100.0; 15]));
        assert!(ind.rsi.is_none());
    }

    #[test]
    fn falling_closes_read_as_low_rsi_downtrend() {
        // Newest first: steadily rising toward the past = falling prices.
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64 * 2.0).collect();
        let ind = compute_indicators(&candles(&closes));
        assert!(ind.rsi.unwrap() < 30.0);
        assert_eq!(ind.trend, Trend::Bearish);
    }

    #[test]
    fn confidence_is_always_clamped() {
        let ind = indicators(Some(25.0), Trend::Bullish, Cross::Golden, Some(3.0));
        let detected = detect_signals(&ind, 1.5);
        let c = technical_confidence(&detected, &ind);
        assert!((CONFIDENCE_FLOOR..=CONFIDENCE_CEIL).contains(&c));
    }

    #[test]
    fn deep_value_fundamentals_are_strong_buy() {
        let (signal, confidence) = fundamental_signal(Some(6.0), Some(0.4), Some(5_000.0));
        assert_eq!(signal, Signal::StrongBuy);
        assert!(confidence <= 0.90);
    }

    #[test]
    fn expensive_loss_maker_is_sell_side() {
        let (signal, _) = fundamental_signal(Some(60.0), Some(6.0), Some(-1_000.0));
        assert_eq!(signal, Signal::StrongSell);
    }

    #[test]
    fn missing_fundamentals_hold_with_low_confidence() {
        let (signal, confidence) = fundamental_signal(None, None, None);
        assert_eq!(signal, Signal::Hold);
        assert!((confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn risk_score_formula() {
        let analyses = vec![
            result(AnalysisKind::Technical, Signal::Buy, 0.7),
            result(AnalysisKind::Fundamental, Signal::Hold, 0.6),
            result(AnalysisKind::Sentiment, Signal::Buy, 0.6),
        ];
        // base 0.3 + min(6/15, 0.3)=0.3... 6/15=0.4 -> capped 0.3; distinct
        // {buy,hold} -> +0.1 => 0.7
        let score = risk_score(0.3, 15.0, 6.0, &analyses);
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn risk_score_clamps_to_unit_interval() {
        let analyses = vec![
            result(AnalysisKind::Technical, Signal::StrongBuy, 0.7),
            result(AnalysisKind::Fundamental, Signal::Buy, 0.6),
            result(AnalysisKind::Sentiment, Signal::Sell, 0.6),
            result(AnalysisKind::Market, Signal::Hold, 0.6),
        ];
        let score = risk_score(0.4, 20.0, 100.0, &analyses);
        assert!(score <= 1.0);
    }

    #[test]
    fn consensus_tie_resolves_to_hold() {
        let analyses = vec![
            result(AnalysisKind::Technical, Signal::Buy, 0.6),
            result(AnalysisKind::Fundamental, Signal::Sell, 0.6),
        ];
        let (signal, _) = consensus(&analyses);
        assert_eq!(signal, Signal::Hold);
    }

    #[test]
    fn consensus_weighted_majority_wins() {
        let analyses = vec![
            result(AnalysisKind::Technical, Signal::StrongBuy, 0.8),
            result(AnalysisKind::Fundamental, Signal::Hold, 0.5),
            result(AnalysisKind::Sentiment, Signal::Sell, 0.4),
        ];
        let (signal, confidence) = consensus(&analyses);
        // buy 1.6 vs sell 0.4 -> strong buy (>=2x and >=1.0)
        assert_eq!(signal, Signal::StrongBuy);
        assert!((CONFIDENCE_FLOOR..=CONFIDENCE_CEIL).contains(&confidence));
    }

    #[test]
    fn consensus_all_hold_is_hold() {
        let analyses = vec![
            result(AnalysisKind::Technical, Signal::Hold, 0.6),
            result(AnalysisKind::Sentiment, Signal::Hold, 0.6),
        ];
        assert_eq!(consensus(&analyses).0, Signal::Hold);
    }

    #[test]
    fn action_table_is_total() {
        use Signal::*;
        // No position
        assert_eq!(action_with_position(StrongBuy, false, 0.0), TradeAction::Buy);
        assert_eq!(action_with_position(Buy, false, 0.0), TradeAction::Buy);
        assert_eq!(action_with_position(StrongSell, false, 0.0), TradeAction::Avoid);
        assert_eq!(action_with_position(Sell, false, 0.0), TradeAction::Watch);
        assert_eq!(action_with_position(Hold, false, 0.0), TradeAction::Watch);
        // Held
        assert_eq!(action_with_position(Buy, true, -16.7), TradeAction::Add);
        assert_eq!(action_with_position(Buy, true, 10.0), TradeAction::Add);
        assert_eq!(action_with_position(StrongBuy, true, 25.0), TradeAction::Hold);
        assert_eq!(action_with_position(StrongSell, true, 0.0), TradeAction::Sell);
        assert_eq!(action_with_position(Sell, true, 0.0), TradeAction::Reduce);
        assert_eq!(action_with_position(Hold, true, 0.0), TradeAction::Hold);
    }

    #[test]
    fn key_factors_pull_bullets_only() {
        let text = "Summary paragraph.\n- RSI deeply oversold below thirty\n* Golden cross forming on the daily chart\nshort\n1. Valuation well below book value";
        let factors = extract_key_factors(text);
        assert_eq!(factors.len(), 3);
        assert!(factors[0].contains("RSI"));
    }

    #[test]
    fn bull_and_bear_cases_locate_keywords() {
        let text = "Overview. Bull case: strong earnings momentum. Bear case: export weakness.";
        assert!(extract_bull_case(text).starts_with("Bull"));
        assert!(extract_bear_case(text).to_lowercase().contains("bear"));
    }
}
