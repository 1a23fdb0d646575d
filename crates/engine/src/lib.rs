pub mod auth;
pub mod cache;
pub mod calendar;
pub mod coordinator;
pub mod kiwoom;
pub mod limiter;
pub mod orders;
pub mod prices;
pub mod store;
pub mod stream;
pub mod ticks;
pub mod upbit;

pub use auth::TokenManager;
pub use cache::{cache_key, CacheStats, MemoryKv, SharedKv, TieredCache};
pub use calendar::{now_kst, HolidayCalendar, MarketSession};
pub use coordinator::{Coordinator, TradingSnapshot};
pub use kiwoom::KiwoomClient;
pub use limiter::{classify_api_id, RateLimiter, RateLimiterStats, RequestKind};
pub use orders::OrderAgent;
pub use prices::ClientPriceSource;
pub use store::{Store, TradeRecord};
pub use stream::UpbitTickerStream;
pub use ticks::{krx_tick_size, round_to_tick};
pub use upbit::UpbitClient;
