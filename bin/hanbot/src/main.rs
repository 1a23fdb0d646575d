use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use api::{AppState, LogBuffer, LogFanout};
use common::{
    Config, ExchangeClient, Market, Notifier, NullNotifier, Reasoner,
};
use engine::{
    ClientPriceSource, Coordinator, HolidayCalendar, KiwoomClient, MemoryKv, OrderAgent,
    RateLimiter, Store, TieredCache, UpbitClient, UpbitTickerStream,
};
use paper::PaperExchange;
use pipeline::{
    CryptoDomain, HttpReasoner, PipelineDeps, PipelineRunner, ScriptedReasoner, StockDomain,
};
use risk::{PortfolioAgent, RiskMonitor};
use telegram_ctrl::{start_bot, BotDeps, TelegramNotifier};

#[tokio::main]
async fn main() {
    // ── Config ────────────────────────────────────────────────────────────
    let cfg = Config::load();

    // ── Logging (stdout + dashboard WebSocket fan-out) ────────────────────
    let (log_tx, _) = broadcast::channel::<String>(1024);
    let log_buffer = LogBuffer::new(500);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_writer(LogFanout::new(log_tx.clone(), log_buffer.clone()))
        .with_ansi(false)
        .init();
    info!(mock = cfg.file.exchange.mock, "HanBot starting");

    // ── Database ──────────────────────────────────────────────────────────
    let db = SqlitePool::connect(&cfg.database_url)
        .await
        .unwrap_or_else(|e| panic!("Failed to connect to database: {e}"));
    sqlx::migrate!("../../migrations")
        .run(&db)
        .await
        .unwrap_or_else(|e| panic!("Database migration failed: {e}"));
    info!("database ready");

    // ── Exchange shell: limiter, cache, calendar ──────────────────────────
    let limiter = Arc::new(RateLimiter::new(&cfg.file.rate));
    let cache = Arc::new(
        TieredCache::new(&cfg.file.cache)
            .with_shared_kv(Arc::new(MemoryKv::default()))
            .with_durable(db.clone()),
    );
    let sweeper = cache.spawn_sweeper();

    let calendar = Arc::new(HolidayCalendar::new(
        db.clone(),
        reqwest::Client::new(),
        &cfg.file.exchange.holiday_url,
    ));
    if let Err(e) = calendar.initialize().await {
        warn!(error = %e, "holiday calendar initialization failed");
    }

    // ── Exchange clients (simulator or live, by config) ───────────────────
    let rate_timeout = std::time::Duration::from_secs_f64(cfg.file.rate.acquire_timeout_sec);

    let stock_client: Arc<dyn ExchangeClient> = if cfg.file.exchange.mock {
        info!("mock mode — routing stock orders to the paper exchange");
        Arc::new(PaperExchange::new(Market::Krx, 10_000_000.0, 10.0))
    } else {
        Arc::new(KiwoomClient::new(
            cfg.file.exchange.kiwoom_base_url.clone(),
            cfg.kiwoom_app_key.clone(),
            cfg.kiwoom_secret_key.clone(),
            Arc::clone(&limiter),
            Arc::clone(&cache),
            rate_timeout,
        ))
    };

    let crypto_client: Option<Arc<dyn ExchangeClient>> = if cfg.file.exchange.mock {
        Some(Arc::new(PaperExchange::new(Market::Crypto, 10_000_000.0, 10.0)))
    } else {
        match (&cfg.upbit_access_key, &cfg.upbit_secret_key) {
            (Some(access), Some(secret)) => Some(Arc::new(UpbitClient::new(
                cfg.file.exchange.upbit_base_url.clone(),
                access.clone(),
                secret.clone(),
                Arc::clone(&limiter),
                Arc::clone(&cache),
                rate_timeout,
            ))),
            _ => {
                info!("no crypto credentials — crypto market disabled");
                None
            }
        }
    };

    // ── Notifier ──────────────────────────────────────────────────────────
    let notifier: Arc<dyn Notifier> = match &cfg.telegram_token {
        Some(token) if !cfg.telegram_allowed_user_ids.is_empty() => {
            Arc::new(TelegramNotifier::new(token, &cfg.telegram_allowed_user_ids))
        }
        _ => Arc::new(NullNotifier),
    };

    // ── Risk monitor and price feed ───────────────────────────────────────
    let (alert_tx, alert_rx) = mpsc::channel(64);
    let (exit_tx, exit_rx) = mpsc::channel(32);

    let price_source = ClientPriceSource::new(Arc::clone(&stock_client), crypto_client.clone());
    if !cfg.file.exchange.mock && crypto_client.is_some() && !cfg.upbit_ws_markets.is_empty() {
        let (tick_tx, tick_rx) = broadcast::channel(1024);
        let stream = UpbitTickerStream::new(
            cfg.file.exchange.upbit_ws_url.clone(),
            cfg.upbit_ws_markets.clone(),
            tick_tx,
        );
        tokio::spawn(stream.run());
        let _tick_pump = price_source.watch_ticks(tick_rx);
    }

    let monitor = Arc::new(RiskMonitor::new(
        cfg.file.risk.clone(),
        price_source,
        alert_tx,
        exit_tx,
    ));

    // ── Coordinator ───────────────────────────────────────────────────────
    let orders = Arc::new(OrderAgent::new(
        Arc::clone(&stock_client),
        crypto_client.clone(),
        &cfg.file.order,
    ));
    let coordinator = Arc::new(Coordinator::new(
        cfg.file.risk.clone(),
        PortfolioAgent::new(cfg.file.risk.clone()),
        orders,
        Arc::clone(&monitor),
        Arc::clone(&stock_client),
        Arc::clone(&calendar),
        Store::new(db.clone()),
        Arc::clone(&notifier),
        alert_rx,
        exit_rx,
    ));

    // ── Analysis pipeline ─────────────────────────────────────────────────
    let reasoner: Arc<dyn Reasoner> = if cfg.reasoner_api_key.is_empty() {
        info!("no reasoner key — using the scripted reasoner");
        Arc::new(ScriptedReasoner::default())
    } else {
        Arc::new(HttpReasoner::new(&cfg.file.reasoner, cfg.reasoner_api_key.clone()))
    };

    let stock_deps = PipelineDeps {
        client: Arc::clone(&stock_client),
        reasoner: Arc::clone(&reasoner),
        domain: Arc::new(StockDomain),
    };
    let crypto_deps = crypto_client.map(|client| PipelineDeps {
        client,
        reasoner: Arc::clone(&reasoner),
        domain: Arc::new(CryptoDomain),
    });

    let runner = Arc::new(PipelineRunner::new(
        &cfg.file.pipeline,
        stock_deps,
        crypto_deps,
        Arc::clone(&coordinator),
        Arc::clone(&notifier),
    ));

    // ── Telegram operator bot ─────────────────────────────────────────────
    if let Some(token) = cfg.telegram_token.clone() {
        let deps = BotDeps {
            coordinator: Arc::clone(&coordinator),
            allowed_user_ids: Arc::new(cfg.telegram_allowed_user_ids.clone()),
        };
        tokio::spawn(start_bot(token, deps));
    }

    // ── Dashboard API ─────────────────────────────────────────────────────
    let api_state = AppState {
        coordinator: Arc::clone(&coordinator),
        runner: Arc::clone(&runner),
        db: db.clone(),
        dashboard_token: cfg.dashboard_token.clone(),
        log_tx,
        log_buffer,
    };
    tokio::spawn(api::serve(api_state, cfg.file.dashboard.port));

    // Trading stays stopped until the operator starts it via the API or
    // Telegram; analysis sessions can run regardless.
    info!("all subsystems started; waiting for shutdown signal");
    tokio::signal::ctrl_c().await.unwrap();

    info!("shutdown signal received");
    coordinator.stop().await;
    sweeper.abort();
}
