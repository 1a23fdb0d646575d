use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use common::{
    AnalysisKind, AnalysisResult, ChatMessage, ExchangeClient, Notifier, NotifyEvent, Reasoner,
    Result, Signal, TradeAction, TradeProposal, WatchStatus, WatchedAsset,
};
use engine::Coordinator;

use crate::domain::AssetDomain;
use crate::prompts;
use crate::scoring::{self, Cross, Trend};
use crate::session::{MarketContext, Session, SessionStore, Stage};

/// Collaborators one pipeline run needs.
#[derive(Clone)]
pub struct PipelineDeps {
    pub client: Arc<dyn ExchangeClient>,
    pub reasoner: Arc<dyn Reasoner>,
    pub domain: Arc<dyn AssetDomain>,
}

const CHART_DAYS: u32 = 30;

/// Drive one session from data collection up to the approval interrupt.
/// The session suspends with `awaiting_approval = true`; execution resumes
/// through the runner's `approve` entry point.
pub async fn run_to_approval(
    deps: &PipelineDeps,
    sessions: &SessionStore,
    coordinator: &Arc<Coordinator>,
    notifier: &Arc<dyn Notifier>,
    session_id: &str,
) {
    // ── Stage 1: data collection ─────────────────────────────────────────
    persist_stage(coordinator, sessions, session_id).await;

    let ctx = match collect_market_data(deps, sessions, session_id).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(session_id, error = %e, "data collection failed");
            sessions
                .update(session_id, |s| {
                    s.log_error(format!("data collection failed: {e}"));
                    s.error = Some(e.to_string());
                    s.set_stage(Stage::Complete);
                })
                .await;
            persist_stage(coordinator, sessions, session_id).await;
            return;
        }
    };

    // ── Stage 2: parallel analysis ───────────────────────────────────────
    sessions
        .update(session_id, |s| s.set_stage(Stage::ParallelAnalysis))
        .await;
    persist_stage(coordinator, sessions, session_id).await;

    let (ticker, name) = match sessions.get(session_id).await {
        Some(s) => (s.ticker.clone(), s.name.clone()),
        None => return,
    };

    let (technical, middle, sentiment) = tokio::join!(
        technical_analysis(deps, &ctx, &ticker, &name),
        middle_analysis(deps, &ctx, &ticker, &name),
        sentiment_analysis(deps, &ctx, &ticker, &name),
    );

    sessions
        .update(session_id, |s| {
            let mut parts = Vec::new();
            match technical {
                Ok(result) => {
                    parts.push(format!(
                        "technical {} ({:.0}%)",
                        result.signal,
                        result.confidence * 100.0
                    ));
                    s.technical = Some(result);
                }
                Err(e) => s.log_error(format!("technical analysis failed: {e}")),
            }
            match middle {
                Ok(result) => {
                    parts.push(format!(
                        "{} {} ({:.0}%)",
                        result.kind,
                        result.signal,
                        result.confidence * 100.0
                    ));
                    s.middle = Some(result);
                }
                Err(e) => s.log_error(format!("{} analysis failed: {e}", deps.domain.middle_kind())),
            }
            match sentiment {
                Ok(result) => {
                    parts.push(format!(
                        "sentiment {} ({:.0}%)",
                        result.signal,
                        result.confidence * 100.0
                    ));
                    s.sentiment = Some(result);
                }
                Err(e) => s.log_error(format!("sentiment analysis failed: {e}")),
            }
            if !parts.is_empty() {
                s.log(format!("[analysis] {}", parts.join(", ")));
            }
        })
        .await;

    // ── Stage 3: risk assessment ─────────────────────────────────────────
    sessions.update(session_id, |s| s.set_stage(Stage::Risk)).await;
    persist_stage(coordinator, sessions, session_id).await;

    let analyses = sessions
        .get(session_id)
        .await
        .map(|s| s.analyses())
        .unwrap_or_default();
    let risk = risk_assessment(deps, &ctx, &ticker, &name, &analyses).await;
    let risk_score = risk
        .indicator_f64("risk_score")
        .unwrap_or(deps.domain.base_risk());

    sessions
        .update(session_id, |s| {
            s.log(format!(
                "[risk] score {:.0}%, suggested stop {:.0} / target {:.0}",
                risk_score * 100.0,
                risk.indicator_f64("suggested_stop_loss").unwrap_or(0.0),
                risk.indicator_f64("suggested_take_profit").unwrap_or(0.0),
            ));
            s.risk = Some(risk);
        })
        .await;

    // ── Stage 4: synthesis ───────────────────────────────────────────────
    sessions
        .update(session_id, |s| s.set_stage(Stage::Synthesis))
        .await;
    persist_stage(coordinator, sessions, session_id).await;

    let proposal = synthesize(deps, sessions, session_id, &ctx).await;

    match proposal {
        Some(proposal) => {
            if proposal.action == TradeAction::Watch {
                add_watch_entry(coordinator, session_id, &proposal, &ctx).await;
            }

            sessions
                .update(session_id, |s| {
                    s.log(format!(
                        "[decision] {} {} {} @ {:.0}",
                        proposal.action, proposal.ticker, proposal.quantity, proposal.entry_price
                    ));
                    s.proposal = Some(proposal.clone());
                    s.awaiting_approval = true;
                    s.set_stage(Stage::Approval);
                })
                .await;
            persist_stage(coordinator, sessions, session_id).await;

            notifier.push(NotifyEvent::Proposal(proposal)).await;
            info!(session_id, "session awaiting approval");
        }
        None => {
            sessions
                .update(session_id, |s| {
                    s.log_error("synthesis produced no proposal");
                    s.error = Some("synthesis produced no proposal".into());
                    s.set_stage(Stage::Complete);
                })
                .await;
            persist_stage(coordinator, sessions, session_id).await;
        }
    }
}

async fn collect_market_data(
    deps: &PipelineDeps,
    sessions: &SessionStore,
    session_id: &str,
) -> Result<MarketContext> {
    let Some(session) = sessions.get(session_id).await else {
        return Err(common::Error::Config(format!(
            "session {session_id} missing from store"
        )));
    };
    let ticker = session.ticker;

    let asset = deps.client.get_asset(&ticker).await?;
    let chart = deps.client.get_daily_chart(&ticker, CHART_DAYS).await?;
    let orderbook = deps.client.get_orderbook(&ticker).await?;

    // Position probe; the broker account is only meaningful for stocks.
    let existing_position = if deps.domain.market() == common::Market::Krx {
        match deps.client.get_account_balance().await {
            Ok(balance) => balance.holding(&ticker).cloned(),
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "portfolio probe failed, continuing");
                None
            }
        }
    } else {
        None
    };

    let ctx = MarketContext {
        asset,
        orderbook,
        chart,
        existing_position,
    };

    sessions
        .update(session_id, |s| {
            s.name = if ctx.asset.name.is_empty() {
                s.ticker.clone()
            } else {
                ctx.asset.name.clone()
            };
            let mut line = format!(
                "[data] {} ({}): price {:.0}, change {:+.2}%, {} chart days",
                s.name,
                s.ticker,
                ctx.asset.price,
                ctx.asset.change_pct,
                ctx.chart.len()
            );
            if let Some(holding) = &ctx.existing_position {
                line.push_str(&format!(
                    " — holding {:.0} units, avg {:.0}, P&L {:+.2}%",
                    holding.quantity, holding.avg_price, holding.pnl_pct
                ));
            }
            s.log(line);
            s.data = Some(ctx.clone());
        })
        .await;

    Ok(ctx)
}

async fn technical_analysis(
    deps: &PipelineDeps,
    ctx: &MarketContext,
    ticker: &str,
    name: &str,
) -> Result<AnalysisResult> {
    let indicators = scoring::compute_indicators(&ctx.chart);
    let bid_ask = ctx.orderbook.bid_ask_ratio();
    let detected = scoring::detect_signals(&indicators, bid_ask);
    let signal = scoring::technical_signal_enhanced(&indicators, bid_ask, &detected);
    let confidence = scoring::technical_confidence(&detected, &indicators);

    let narrative = deps
        .reasoner
        .generate(&[
            ChatMessage::system(prompts::TECHNICAL_ANALYST),
            ChatMessage::user(format_technical_context(ctx, &indicators, bid_ask)),
        ])
        .await?;

    let mut key_factors = scoring::extract_key_factors(&narrative);
    if key_factors.is_empty() {
        key_factors = detected.iter().map(|d| d.name.to_string()).collect();
    }

    let mut map = BTreeMap::new();
    map.insert("rsi".into(), json!(indicators.rsi));
    map.insert("trend".into(), json!(trend_name(indicators.trend)));
    map.insert("cross".into(), json!(cross_name(indicators.cross)));
    map.insert("volume_ratio".into(), json!(indicators.volume_ratio));
    map.insert("bid_ask_ratio".into(), json!(bid_ask));
    map.insert(
        "detected".into(),
        json!(detected.iter().map(|d| d.name).collect::<Vec<_>>()),
    );

    Ok(AnalysisResult {
        kind: AnalysisKind::Technical,
        ticker: ticker.to_string(),
        name: name.to_string(),
        signal,
        confidence,
        summary: truncate(&narrative, 500),
        reasoning: narrative,
        key_factors,
        indicators: map,
    })
}

async fn middle_analysis(
    deps: &PipelineDeps,
    ctx: &MarketContext,
    ticker: &str,
    name: &str,
) -> Result<AnalysisResult> {
    let kind = deps.domain.middle_kind();
    let (signal, confidence, indicators) = deps.domain.middle_signal(ctx);

    let (prompt, context) = match kind {
        AnalysisKind::Fundamental => (
            prompts::FUNDAMENTAL_ANALYST,
            format_fundamental_context(ctx),
        ),
        _ => (prompts::MARKET_ANALYST, format_market_context(ctx)),
    };

    let narrative = deps
        .reasoner
        .generate(&[ChatMessage::system(prompt), ChatMessage::user(context)])
        .await?;

    Ok(AnalysisResult {
        kind,
        ticker: ticker.to_string(),
        name: name.to_string(),
        signal,
        confidence: scoring::clamp_confidence(confidence),
        summary: truncate(&narrative, 500),
        key_factors: scoring::extract_key_factors(&narrative),
        reasoning: narrative,
        indicators,
    })
}

async fn sentiment_analysis(
    deps: &PipelineDeps,
    ctx: &MarketContext,
    ticker: &str,
    name: &str,
) -> Result<AnalysisResult> {
    let bid_ask = ctx.orderbook.bid_ask_ratio();
    let (signal, confidence) =
        scoring::sentiment_signal(ctx.asset.change_pct, ctx.asset.volume_ratio, bid_ask);

    let narrative = deps
        .reasoner
        .generate(&[
            ChatMessage::system(prompts::SENTIMENT_ANALYST),
            ChatMessage::user(format_market_context(ctx)),
        ])
        .await?;

    let mut map = BTreeMap::new();
    map.insert("change_pct".into(), json!(ctx.asset.change_pct));
    map.insert("volume_ratio".into(), json!(ctx.asset.volume_ratio));
    map.insert("bid_ask_ratio".into(), json!(bid_ask));

    Ok(AnalysisResult {
        kind: AnalysisKind::Sentiment,
        ticker: ticker.to_string(),
        name: name.to_string(),
        signal,
        confidence,
        summary: truncate(&narrative, 500),
        key_factors: scoring::extract_key_factors(&narrative),
        reasoning: narrative,
        indicators: map,
    })
}

/// Sequential risk stage. The score and the stop/take-profit offsets are
/// deterministic; the reasoner only narrates, and its failure does not
/// fail the stage.
async fn risk_assessment(
    deps: &PipelineDeps,
    ctx: &MarketContext,
    ticker: &str,
    name: &str,
    analyses: &[AnalysisResult],
) -> AnalysisResult {
    let risk_score = scoring::risk_score(
        deps.domain.base_risk(),
        deps.domain.volatility_divisor(),
        ctx.asset.change_pct,
        analyses,
    );
    let (stop_pct, take_pct) = deps.domain.stop_take_offsets(risk_score);
    let price = ctx.asset.price;

    let narrative = match deps
        .reasoner
        .generate(&[
            ChatMessage::system(prompts::RISK_ASSESSOR),
            ChatMessage::user(format_analyses_context(ticker, name, price, analyses)),
        ])
        .await
    {
        Ok(text) => text,
        Err(e) => {
            warn!(ticker, error = %e, "risk narrative unavailable");
            String::new()
        }
    };

    let mut map = BTreeMap::new();
    map.insert("risk_score".into(), json!(risk_score));
    map.insert(
        "max_position_pct".into(),
        json!(deps.domain.position_size_pct(risk_score)),
    );
    map.insert(
        "suggested_stop_loss".into(),
        json!((price * (1.0 - stop_pct)).round()),
    );
    map.insert(
        "suggested_take_profit".into(),
        json!((price * (1.0 + take_pct)).round()),
    );

    AnalysisResult {
        kind: AnalysisKind::Risk,
        ticker: ticker.to_string(),
        name: name.to_string(),
        signal: Signal::Hold,
        confidence: 0.80,
        summary: truncate(&narrative, 500),
        key_factors: scoring::extract_key_factors(&narrative),
        reasoning: narrative,
        indicators: map,
    }
}

/// Synthesis: consensus vote, action resolution against the held
/// position, quantity arithmetic, and the final proposal.
async fn synthesize(
    deps: &PipelineDeps,
    sessions: &SessionStore,
    session_id: &str,
    ctx: &MarketContext,
) -> Option<TradeProposal> {
    let session = sessions.get(session_id).await?;
    let analyses = session.analyses();

    let (consensus_signal, avg_confidence) = scoring::consensus(&analyses);
    let has_position = ctx.existing_position.is_some();
    let pnl_pct = ctx
        .existing_position
        .as_ref()
        .map(|h| h.pnl_pct)
        .unwrap_or(0.0);
    let action = scoring::action_with_position(consensus_signal, has_position, pnl_pct);

    info!(
        ticker = %session.ticker,
        consensus = %consensus_signal,
        has_position,
        pnl_pct,
        action = %action,
        "action determined"
    );

    let risk = session.risk.as_ref();
    let risk_score = risk
        .and_then(|r| r.indicator_f64("risk_score"))
        .unwrap_or(deps.domain.base_risk());
    let (stop_pct, take_pct) = deps.domain.stop_take_offsets(risk_score);
    let entry_price = ctx.asset.price;
    let stop_loss = risk
        .and_then(|r| r.indicator_f64("suggested_stop_loss"))
        .unwrap_or((entry_price * (1.0 - stop_pct)).round());
    let take_profit = risk
        .and_then(|r| r.indicator_f64("suggested_take_profit"))
        .unwrap_or((entry_price * (1.0 + take_pct)).round());
    let position_size_pct = risk
        .and_then(|r| r.indicator_f64("max_position_pct"))
        .unwrap_or_else(|| deps.domain.position_size_pct(risk_score));

    // Quantity per the action class. For buys it previews the spend from
    // orderable cash; the portfolio agent recomputes under the full risk
    // constraints at execution time.
    let quantity = if action.is_buy() && entry_price > 0.0 {
        match deps.client.get_cash_balance().await {
            Ok(cash) => {
                let investment = cash.orderable_cash * position_size_pct / 100.0;
                deps.domain.quantize(investment / entry_price)
            }
            Err(e) => {
                warn!(error = %e, "cash balance unavailable, quantity preview is 0");
                0.0
            }
        }
    } else if action.is_sell() {
        let held = ctx
            .existing_position
            .as_ref()
            .map(|h| h.quantity)
            .unwrap_or(0.0);
        if action == TradeAction::Reduce {
            deps.domain.reduce_quantity(held)
        } else {
            held
        }
    } else {
        0.0
    };

    let narrative = match deps
        .reasoner
        .generate(&[
            ChatMessage::system(prompts::STRATEGIC_DECISION),
            ChatMessage::user(format_decision_context(
                &session,
                ctx,
                consensus_signal,
                avg_confidence,
                &analyses,
            )),
        ])
        .await
    {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "decision narrative unavailable");
            format!("consensus {consensus_signal} with confidence {avg_confidence:.2}")
        }
    };

    Some(TradeProposal {
        id: uuid::Uuid::new_v4().to_string(),
        ticker: session.ticker.clone(),
        name: session.name.clone(),
        market: session.market,
        action,
        quantity,
        entry_price,
        stop_loss: Some(stop_loss),
        take_profit: Some(take_profit),
        risk_score,
        position_size_pct,
        bull_case: scoring::extract_bull_case(&narrative),
        bear_case: scoring::extract_bear_case(&narrative),
        rationale: narrative,
        analyses,
        created_at: Utc::now(),
    })
}

async fn add_watch_entry(
    coordinator: &Arc<Coordinator>,
    session_id: &str,
    proposal: &TradeProposal,
    ctx: &MarketContext,
) {
    let watch = WatchedAsset {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        ticker: proposal.ticker.clone(),
        name: proposal.name.clone(),
        market: proposal.market,
        signal: scoring::consensus(&proposal.analyses).0,
        confidence: scoring::consensus(&proposal.analyses).1,
        current_price: ctx.asset.price,
        // Suggest entering a few percent below the current price.
        target_entry_price: Some((ctx.asset.price * 0.97).round()),
        stop_loss: proposal.stop_loss,
        take_profit: proposal.take_profit,
        summary: truncate(&proposal.rationale, 300),
        status: WatchStatus::Active,
        added_at: Utc::now(),
    };
    coordinator.add_to_watch_list(watch).await;
}

async fn persist_stage(coordinator: &Arc<Coordinator>, sessions: &SessionStore, session_id: &str) {
    if let Some(session) = sessions.get(session_id).await {
        if let Err(e) = coordinator
            .store()
            .upsert_session(
                &session.id,
                &session.ticker,
                session.market,
                &session.stage.to_string(),
                session.reanalyze_count,
            )
            .await
        {
            warn!(session_id, error = %e, "failed to persist session");
        }
    }
}

// ─── Prompt context formatting ───────────────────────────────────────────────

fn format_technical_context(
    ctx: &MarketContext,
    indicators: &scoring::TechIndicators,
    bid_ask: f64,
) -> String {
    format!(
        "{} ({})\nprice: {:.0} ({:+.2}%)\nRSI(14): {}\ntrend: {}\nMA cross: {}\nvolume ratio: {}\nbid/ask ratio: {:.2}\nchart days: {}",
        ctx.asset.name,
        ctx.asset.ticker,
        ctx.asset.price,
        ctx.asset.change_pct,
        indicators
            .rsi
            .map(|v| format!("{v:.1}"))
            .unwrap_or_else(|| "n/a".into()),
        trend_name(indicators.trend),
        cross_name(indicators.cross),
        indicators
            .volume_ratio
            .map(|v| format!("{v:.2}x"))
            .unwrap_or_else(|| "n/a".into()),
        bid_ask,
        ctx.chart.len(),
    )
}

fn format_fundamental_context(ctx: &MarketContext) -> String {
    let fmt_opt = |v: Option<f64>| {
        v.map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "n/a".into())
    };
    format!(
        "{} ({})\nprice: {:.0}\nPER: {}\nPBR: {}\nEPS: {}\nmarket cap: {}",
        ctx.asset.name,
        ctx.asset.ticker,
        ctx.asset.price,
        fmt_opt(ctx.asset.per),
        fmt_opt(ctx.asset.pbr),
        fmt_opt(ctx.asset.eps),
        fmt_opt(ctx.asset.market_cap),
    )
}

fn format_market_context(ctx: &MarketContext) -> String {
    format!(
        "{} ({})\nprice: {:.0} ({:+.2}%)\n24h volume: {:.2}\nbid/ask ratio: {:.2}\nbest bid/ask: {:?}/{:?}",
        ctx.asset.name,
        ctx.asset.ticker,
        ctx.asset.price,
        ctx.asset.change_pct,
        ctx.asset.volume,
        ctx.orderbook.bid_ask_ratio(),
        ctx.orderbook.best_bid(),
        ctx.orderbook.best_ask(),
    )
}

fn format_analyses_context(
    ticker: &str,
    name: &str,
    price: f64,
    analyses: &[AnalysisResult],
) -> String {
    let mut out = format!("{name} ({ticker}) at {price:.0}\n\n");
    for a in analyses {
        out.push_str(&format!(
            "[{}] {} (confidence {:.0}%)\n{}\n\n",
            a.kind,
            a.signal,
            a.confidence * 100.0,
            a.summary
        ));
    }
    out
}

fn format_decision_context(
    session: &Session,
    ctx: &MarketContext,
    consensus: Signal,
    avg_confidence: f64,
    analyses: &[AnalysisResult],
) -> String {
    let position = match &ctx.existing_position {
        Some(h) => format!(
            "holding {:.0} units, avg {:.0}, current {:.0}, P&L {:+.2}%",
            h.quantity, h.avg_price, h.current_price, h.pnl_pct
        ),
        None => "no existing position".into(),
    };
    let mut out = format!(
        "{} ({})\nconsensus: {} (avg confidence {:.0}%)\nposition: {}\n",
        session.name,
        session.ticker,
        consensus,
        avg_confidence * 100.0,
        position,
    );
    if let Some(feedback) = &session.user_feedback {
        out.push_str(&format!("user feedback from last rejection: {feedback}\n"));
    }
    out.push('\n');
    out.push_str(&format_analyses_context(
        &session.ticker,
        &session.name,
        ctx.asset.price,
        analyses,
    ));
    out
}

fn trend_name(trend: Trend) -> &'static str {
    match trend {
        Trend::Bullish => "bullish",
        Trend::Bearish => "bearish",
        Trend::Neutral => "neutral",
    }
}

fn cross_name(cross: Cross) -> &'static str {
    match cross {
        Cross::Golden => "golden_cross",
        Cross::Dead => "dead_cross",
        Cross::None => "none",
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
