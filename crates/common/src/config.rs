use serde::{Deserialize, Serialize};

use crate::StopLossMode;

/// Risk management parameters. Every field is range-checked at startup and
/// again whenever the coordinator reloads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParameters {
    /// Maximum single position as a fraction of total equity (0.01-0.5).
    pub max_single_position_pct: f64,
    /// Minimum cash reserve as a fraction of total equity (0-0.9).
    pub min_cash_ratio: f64,
    /// Maximum total stock allocation as a fraction of total equity (0.1-1.0).
    pub max_total_stock_pct: f64,
    /// Tick-to-tick move (percent) that raises a sudden-move alert (1-30).
    pub sudden_move_threshold_pct: f64,
    /// Maximum filled trades per day (1-100).
    pub max_daily_trades: u32,
    pub stop_loss_mode: StopLossMode,
    pub take_profit_mode: StopLossMode,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            max_single_position_pct: 0.15,
            min_cash_ratio: 0.20,
            max_total_stock_pct: 0.80,
            sudden_move_threshold_pct: 10.0,
            max_daily_trades: 10,
            stop_loss_mode: StopLossMode::UserApproval,
            take_profit_mode: StopLossMode::UserApproval,
        }
    }
}

impl RiskParameters {
    pub fn validate(&self) -> Result<(), String> {
        fn check(name: &str, value: f64, lo: f64, hi: f64) -> Result<(), String> {
            if !(lo..=hi).contains(&value) {
                return Err(format!("{name} must be within [{lo}, {hi}], got {value}"));
            }
            Ok(())
        }
        check(
            "risk.max_single_position_pct",
            self.max_single_position_pct,
            0.01,
            0.5,
        )?;
        check("risk.min_cash_ratio", self.min_cash_ratio, 0.0, 0.9)?;
        check(
            "risk.max_total_stock_pct",
            self.max_total_stock_pct,
            0.1,
            1.0,
        )?;
        check(
            "risk.sudden_move_threshold_pct",
            self.sudden_move_threshold_pct,
            1.0,
            30.0,
        )?;
        if !(1..=100).contains(&self.max_daily_trades) {
            return Err(format!(
                "risk.max_daily_trades must be within [1, 100], got {}",
                self.max_daily_trades
            ));
        }
        Ok(())
    }
}

/// Upstream API rate limits. The broker enforces 5/s per request class;
/// the minimum interval stays conservative to avoid burst detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub query_per_sec: u32,
    pub order_per_sec: u32,
    pub min_interval_sec: f64,
    /// Deadline for acquiring a slot before an order is rejected.
    pub acquire_timeout_sec: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            query_per_sec: 5,
            order_per_sec: 5,
            min_interval_sec: 0.7,
            acquire_timeout_sec: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub l1_max_size: usize,
    /// Sweep interval for expired L1/L3 entries, seconds.
    pub sweep_interval_sec: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            l1_max_size: 1000,
            sweep_interval_sec: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Analysis-slot semaphore size: concurrent pipelines allowed to start.
    pub max_concurrent: usize,
    /// How long a session start may wait for a slot, seconds.
    pub slot_wait_sec: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            slot_wait_sec: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    /// Orders above this quantity are split into three sub-orders.
    pub split_threshold: f64,
    /// Pause between split sub-orders, milliseconds.
    pub split_pause_ms: u64,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            split_threshold: 100.0,
            split_pause_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Route all order flow to the built-in simulator.
    pub mock: bool,
    pub kiwoom_base_url: String,
    pub upbit_base_url: String,
    pub upbit_ws_url: String,
    /// KRX holiday table endpoint (JSON rows).
    pub holiday_url: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            mock: true,
            kiwoom_base_url: "https://mockapi.kiwoom.com".into(),
            upbit_base_url: "https://api.upbit.com".into(),
            upbit_ws_url: "wss://api.upbit.com/websocket/v1".into(),
            holiday_url: "https://open.krx.co.kr/contents/OPN/99/OPN99000001.jspx".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasonerConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub base_url: String,
    pub model: String,
    pub timeout_sec: u64,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            timeout_sec: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Tunables loaded from the TOML config file. Secrets never live here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub risk: RiskParameters,
    pub rate: RateConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub order: OrderConfig,
    pub exchange: ExchangeConfig,
    pub reasoner: ReasonerConfig,
    pub dashboard: DashboardConfig,
}

impl FileConfig {
    /// Parse the TOML config file. Missing file yields pure defaults;
    /// malformed content is a startup error.
    pub fn load(path: &str) -> Result<Self, String> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(format!("failed to read config at '{path}': {e}")),
        };
        let cfg: FileConfig =
            toml::from_str(&content).map_err(|e| format!("failed to parse '{path}': {e}"))?;
        cfg.risk.validate()?;
        Ok(cfg)
    }
}

/// Full runtime configuration: file tunables plus environment secrets.
#[derive(Debug, Clone)]
pub struct Config {
    pub file: FileConfig,

    // Broker credentials
    pub kiwoom_app_key: String,
    pub kiwoom_secret_key: String,

    // Crypto exchange credentials (optional — crypto disabled without them)
    pub upbit_access_key: Option<String>,
    pub upbit_secret_key: Option<String>,
    /// Markets streamed over the crypto ticker WebSocket, e.g. KRW-BTC.
    pub upbit_ws_markets: Vec<String>,

    // Reasoner
    pub reasoner_api_key: String,

    // Telegram
    pub telegram_token: Option<String>,
    pub telegram_allowed_user_ids: Vec<i64>,

    // Dashboard
    pub dashboard_token: String,

    // Database
    pub database_url: String,
}

impl Config {
    /// Load configuration: `.env` if present, then the TOML file named by
    /// `HANBOT_CONFIG` (default `config/hanbot.toml`), then env secrets.
    /// Panics on any missing required variable with a clear message.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let path = std::env::var("HANBOT_CONFIG")
            .unwrap_or_else(|_| "config/hanbot.toml".to_string());
        let file = FileConfig::load(&path)
            .unwrap_or_else(|e| panic!("ERROR: invalid configuration: {e}"));

        let telegram_allowed_user_ids = optional_env("TELEGRAM_ALLOWED_USER_IDS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| {
                        s.trim().parse::<i64>().unwrap_or_else(|_| {
                            panic!(
                                "TELEGRAM_ALLOWED_USER_IDS contains non-numeric ID: '{}'",
                                s.trim()
                            )
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        // The simulator needs no broker credentials.
        let (kiwoom_app_key, kiwoom_secret_key) = if file.exchange.mock {
            (
                optional_env("KIWOOM_APP_KEY").unwrap_or_default(),
                optional_env("KIWOOM_SECRET_KEY").unwrap_or_default(),
            )
        } else {
            (required_env("KIWOOM_APP_KEY"), required_env("KIWOOM_SECRET_KEY"))
        };

        Config {
            file,
            kiwoom_app_key,
            kiwoom_secret_key,
            upbit_access_key: optional_env("UPBIT_ACCESS_KEY"),
            upbit_secret_key: optional_env("UPBIT_SECRET_KEY"),
            upbit_ws_markets: optional_env("UPBIT_WS_MARKETS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            reasoner_api_key: optional_env("REASONER_API_KEY").unwrap_or_default(),
            telegram_token: optional_env("TELEGRAM_TOKEN"),
            telegram_allowed_user_ids,
            dashboard_token: required_env("DASHBOARD_TOKEN"),
            database_url: optional_env("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://hanbot.db?mode=rwc".to_string()),
        }
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(RiskParameters::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_position_pct_rejected() {
        let params = RiskParameters {
            max_single_position_pct: 0.9,
            ..RiskParameters::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn toml_sections_override_defaults() {
        let cfg: FileConfig = toml::from_str(
            r#"
            [risk]
            max_daily_trades = 3

            [rate]
            min_interval_sec = 0.2

            [exchange]
            mock = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.risk.max_daily_trades, 3);
        assert!((cfg.rate.min_interval_sec - 0.2).abs() < 1e-9);
        assert_eq!(cfg.risk.max_single_position_pct, 0.15);
        assert!(cfg.exchange.mock);
    }
}
