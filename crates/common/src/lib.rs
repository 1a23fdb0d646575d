pub mod config;
pub mod error;
pub mod exchange;
pub mod notify;
pub mod reasoner;
pub mod types;

pub use config::{
    CacheConfig, Config, DashboardConfig, ExchangeConfig, FileConfig, OrderConfig, PipelineConfig,
    RateConfig, ReasonerConfig, RiskParameters,
};
pub use error::{broker_code, Error, Result};
pub use exchange::ExchangeClient;
pub use notify::{Notifier, NotifyEvent, NullNotifier};
pub use reasoner::{ChatMessage, ChatRole, Reasoner};
pub use types::*;
