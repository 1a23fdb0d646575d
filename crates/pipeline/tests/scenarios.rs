//! End-to-end flows over the paper exchange with a scripted reasoner:
//! session lifecycle, approval execution, rejection re-analysis, daily
//! trade limits and market-closed queueing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use common::ExchangeClient;
use sqlx::SqlitePool;
use tokio::sync::mpsc;

use common::{
    Market, NullNotifier, OrderConfig, PipelineConfig, QueueStatus, RiskParameters, TradeAction,
    TradeProposal, TradingMode,
};
use engine::{ClientPriceSource, Coordinator, HolidayCalendar, OrderAgent, Store};
use paper::PaperExchange;
use pipeline::{
    CryptoDomain, PipelineDeps, PipelineRunner, ScriptedReasoner, Stage, StockDomain,
};
use risk::{PortfolioAgent, RiskMonitor};

struct World {
    coordinator: Arc<Coordinator>,
    runner: Arc<PipelineRunner>,
    stock: Arc<PaperExchange>,
    crypto: Arc<PaperExchange>,
    calendar: Arc<HolidayCalendar>,
    db: SqlitePool,
}

async fn build_world(params: RiskParameters) -> World {
    let db = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("../../migrations").run(&db).await.unwrap();

    let stock = Arc::new(PaperExchange::new(Market::Krx, 10_000_000.0, 0.0));
    let crypto = Arc::new(PaperExchange::new(Market::Crypto, 10_000_000.0, 0.0));
    let stock_client: Arc<dyn common::ExchangeClient> = stock.clone();
    let crypto_client: Arc<dyn common::ExchangeClient> = crypto.clone();

    let calendar = Arc::new(HolidayCalendar::new(
        db.clone(),
        reqwest::Client::new(),
        "http://unused.invalid",
    ));

    let (alert_tx, alert_rx) = mpsc::channel(64);
    let (exit_tx, exit_rx) = mpsc::channel(32);
    let price_source =
        ClientPriceSource::new(stock_client.clone(), Some(crypto_client.clone()));
    let monitor = Arc::new(RiskMonitor::new(
        params.clone(),
        price_source,
        alert_tx,
        exit_tx,
    ));

    let orders = Arc::new(OrderAgent::new(
        stock_client.clone(),
        Some(crypto_client.clone()),
        &OrderConfig {
            split_threshold: 100.0,
            split_pause_ms: 1,
        },
    ));

    let coordinator = Arc::new(Coordinator::new(
        params.clone(),
        PortfolioAgent::new(params),
        orders,
        monitor,
        stock_client.clone(),
        calendar.clone(),
        Store::new(db.clone()),
        Arc::new(NullNotifier),
        alert_rx,
        exit_rx,
    ));
    coordinator.start().await.unwrap();

    let reasoner = Arc::new(ScriptedReasoner::default());
    let runner = Arc::new(PipelineRunner::new(
        &PipelineConfig {
            max_concurrent: 3,
            slot_wait_sec: 10,
        },
        PipelineDeps {
            client: stock_client,
            reasoner: reasoner.clone(),
            domain: Arc::new(StockDomain),
        },
        Some(PipelineDeps {
            client: crypto_client,
            reasoner,
            domain: Arc::new(CryptoDomain),
        }),
        coordinator.clone(),
        Arc::new(NullNotifier),
    ));

    World {
        coordinator,
        runner,
        stock,
        crypto,
        calendar,
        db,
    }
}

fn buy_proposal(ticker: &str, market: Market, entry: f64, size_pct: f64) -> TradeProposal {
    TradeProposal {
        id: uuid::Uuid::new_v4().to_string(),
        ticker: ticker.to_string(),
        name: ticker.to_string(),
        market,
        action: TradeAction::Buy,
        quantity: 0.0,
        entry_price: entry,
        stop_loss: Some(entry * 0.92),
        take_profit: Some(entry * 1.10),
        risk_score: 0.3,
        position_size_pct: size_pct,
        rationale: "test proposal".into(),
        bull_case: String::new(),
        bear_case: String::new(),
        analyses: Vec::new(),
        created_at: Utc::now(),
    }
}

async fn wait_for_stage(world: &World, session_id: &str, stage: Stage) {
    for _ in 0..200 {
        if let Some(session) = world.runner.status(session_id).await {
            if session.stage == stage || session.stage == Stage::Complete {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session never reached {stage:?}");
}

// ── Scenario: approved buy completes, position is watched ────────────────────

#[tokio::test]
async fn approved_buy_creates_position_and_watches_it() {
    let world = build_world(RiskParameters::default()).await;
    world.crypto.seed_price("KRW-TEST", "Test Coin", 50_000.0).await;

    // Risk grade 3 + target 10% of 10M equity -> 1M -> 20 units.
    let proposal = buy_proposal("KRW-TEST", Market::Crypto, 50_000.0, 10.0);
    let plan = world.coordinator.on_trade_approved(&proposal, None).await;
    assert_eq!(plan.quantity, 20.0, "rationale: {}", plan.rationale);

    // One fill on the exchange, one tracked position, counter at 1.
    let fills = world.crypto.get_filled_orders().await.unwrap();
    assert_eq!(fills.len(), 1);

    let positions = world.coordinator.positions().await;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].quantity, 20.0);
    assert_eq!(positions[0].avg_price, 50_000.0);
    assert_eq!(world.coordinator.daily_trades_count().await, 1);
}

// ── Scenario: repeated buys merge with a weighted average cost ───────────────

#[tokio::test]
async fn repeated_buys_merge_at_weighted_average() {
    let world = build_world(RiskParameters::default()).await;
    world.crypto.seed_price("KRW-TEST", "Test Coin", 50_000.0).await;

    let first = buy_proposal("KRW-TEST", Market::Crypto, 50_000.0, 5.0);
    let plan = world.coordinator.on_trade_approved(&first, None).await;
    assert_eq!(plan.quantity, 10.0);

    // The price moves; adding on merges into one position at the
    // cost-weighted mean.
    world.crypto.set_price("KRW-TEST", 60_000.0).await;
    let second = buy_proposal("KRW-TEST", Market::Crypto, 60_000.0, 5.0);
    let plan = world.coordinator.on_trade_approved(&second, Some(10.0)).await;
    assert_eq!(plan.quantity, 10.0);

    let positions = world.coordinator.positions().await;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].quantity, 20.0);
    assert_eq!(positions[0].avg_price, 55_000.0);
}

// ── Scenario: daily trade limit boundary ─────────────────────────────────────

#[tokio::test]
async fn daily_limit_blocks_new_buys_but_not_exits() {
    let params = RiskParameters {
        max_daily_trades: 1,
        ..RiskParameters::default()
    };
    let world = build_world(params).await;
    world.crypto.seed_price("KRW-TEST", "Test Coin", 50_000.0).await;

    // At max - 1: the fill increments the counter to the max.
    let first = buy_proposal("KRW-TEST", Market::Crypto, 50_000.0, 5.0);
    let plan = world.coordinator.on_trade_approved(&first, None).await;
    assert!(plan.quantity > 0.0);
    assert_eq!(world.coordinator.daily_trades_count().await, 1);

    // At the max: the next buy yields quantity 0.
    let second = buy_proposal("KRW-OTHER", Market::Crypto, 50_000.0, 5.0);
    world.crypto.seed_price("KRW-OTHER", "Other Coin", 50_000.0).await;
    let plan = world.coordinator.on_trade_approved(&second, None).await;
    assert_eq!(plan.quantity, 0.0);
    assert!(plan.rationale.contains("daily trade limit"));

    // Exits are still allowed.
    let mut exit = buy_proposal("KRW-TEST", Market::Crypto, 50_000.0, 5.0);
    exit.action = TradeAction::Sell;
    let plan = world.coordinator.on_trade_approved(&exit, None).await;
    assert!(plan.quantity > 0.0, "exit blocked: {}", plan.rationale);
}

// ── Scenario: market closed enqueues the trade ───────────────────────────────

#[tokio::test]
async fn closed_market_queues_the_approved_trade() {
    let world = build_world(RiskParameters::default()).await;

    // Declare the next 60 days KRX holidays so the market is closed no
    // matter when this test runs.
    let today = engine::now_kst().date_naive();
    for i in 0..60 {
        let day = today + chrono::Duration::days(i);
        sqlx::query(
            "INSERT INTO krx_holidays (date, year, day_of_week, name) VALUES (?1, ?2, '', 'test')",
        )
        .bind(day.format("%Y-%m-%d").to_string())
        .bind(day.year())
        .execute(&world.db)
        .await
        .unwrap();
    }
    world.calendar.initialize().await.unwrap();
    assert!(!world.calendar.is_market_open(Market::Krx).await);

    world.stock.seed_price("005930", "Samsung Electronics", 50_000.0).await;
    let proposal = buy_proposal("005930", Market::Krx, 50_000.0, 10.0);
    let plan = world.coordinator.on_trade_approved(&proposal, None).await;

    assert_eq!(plan.quantity, 0.0);
    assert!(plan.rationale.contains("queued"));

    let snapshot = world.coordinator.snapshot().await;
    assert_eq!(snapshot.trade_queue.len(), 1);
    assert_eq!(snapshot.trade_queue[0].status, QueueStatus::Pending);
    // Nothing reached the exchange.
    assert!(world.stock.get_filled_orders().await.unwrap().is_empty());
}

// ── Scenario: pipeline runs to approval; approve resumes execution once ──────

#[tokio::test]
async fn session_suspends_at_approval_and_approve_executes_once() {
    let world = build_world(RiskParameters::default()).await;
    world.crypto.seed_price("KRW-TEST", "Test Coin", 50_000.0).await;

    let session_id = world
        .runner
        .start_analysis("KRW-TEST", Market::Crypto, None)
        .await
        .unwrap();

    wait_for_stage(&world, &session_id, Stage::Approval).await;
    let session = world.runner.status(&session_id).await.unwrap();
    assert_eq!(session.stage, Stage::Approval);
    assert!(session.awaiting_approval);
    let proposal = session.proposal.clone().expect("proposal present");
    assert!(!session.reasoning_log.is_empty());

    // Flat synthetic data yields a hold consensus -> watch action and a
    // watch-list entry.
    assert_eq!(proposal.action, TradeAction::Watch);
    let snapshot = world.coordinator.snapshot().await;
    assert_eq!(snapshot.watch_list.len(), 1);

    // Force a tradeable proposal and approve: execution happens exactly
    // once and the session completes.
    world
        .runner
        .sessions()
        .update(&session_id, |s| {
            if let Some(p) = s.proposal.as_mut() {
                p.action = TradeAction::Buy;
                p.position_size_pct = 10.0;
            }
        })
        .await;

    world.runner.approve(&session_id, None).await.unwrap();

    let session = world.runner.status(&session_id).await.unwrap();
    assert_eq!(session.stage, Stage::Complete);
    assert_eq!(world.crypto.get_filled_orders().await.unwrap().len(), 1);

    // A second approve on the completed session must be refused.
    assert!(world.runner.approve(&session_id, None).await.is_err());
    assert_eq!(world.crypto.get_filled_orders().await.unwrap().len(), 1);
}

// ── Scenario: reject resets to data collection and re-analyzes ───────────────

#[tokio::test]
async fn reject_resets_and_reanalyzes_with_feedback() {
    let world = build_world(RiskParameters::default()).await;
    world.crypto.seed_price("KRW-TEST", "Test Coin", 50_000.0).await;

    let session_id = world
        .runner
        .start_analysis("KRW-TEST", Market::Crypto, None)
        .await
        .unwrap();
    wait_for_stage(&world, &session_id, Stage::Approval).await;

    world
        .runner
        .reject(&session_id, Some("wait for earnings".into()))
        .await
        .unwrap();

    // Immediately after the reject the analyses are cleared; the session
    // then runs again and suspends a second time.
    wait_for_stage(&world, &session_id, Stage::Approval).await;
    let session = world.runner.status(&session_id).await.unwrap();
    assert_eq!(session.reanalyze_count, 1);
    assert!(session.awaiting_approval);
    assert!(session
        .reasoning_log
        .iter()
        .any(|l| l.contains("wait for earnings")));
}

// ── Scenario: cancel marks the session complete ──────────────────────────────

#[tokio::test]
async fn cancel_closes_the_session() {
    let world = build_world(RiskParameters::default()).await;
    world.crypto.seed_price("KRW-TEST", "Test Coin", 50_000.0).await;

    let session_id = world
        .runner
        .start_analysis("KRW-TEST", Market::Crypto, None)
        .await
        .unwrap();
    world.runner.cancel(&session_id).await.unwrap();

    let session = world.runner.status(&session_id).await.unwrap();
    assert_eq!(session.stage, Stage::Complete);
    assert_eq!(session.error.as_deref(), Some("cancelled by user"));
}

// ── Invariant: stock exposure stays under the cap after an approval ──────────

#[tokio::test]
async fn exposure_stays_under_total_stock_cap() {
    let world = build_world(RiskParameters::default()).await;
    world.crypto.seed_price("KRW-A", "Coin A", 10_000.0).await;
    world.crypto.seed_price("KRW-B", "Coin B", 10_000.0).await;

    for ticker in ["KRW-A", "KRW-B"] {
        let proposal = buy_proposal(ticker, Market::Crypto, 10_000.0, 15.0);
        let plan = world.coordinator.on_trade_approved(&proposal, None).await;
        assert!(plan.quantity > 0.0);
    }

    let snapshot = world.coordinator.snapshot().await;
    let exposure: f64 = snapshot.positions.iter().map(|p| p.market_value()).sum();
    let cap = snapshot.account.total_equity * 0.80;
    // ±0.5% rounding allowance from integer unit quantities.
    assert!(
        exposure <= cap * 1.005,
        "exposure {exposure} exceeds cap {cap}"
    );
    assert_eq!(world.coordinator.mode().await, TradingMode::Active);
}
