pub mod monitor;
pub mod portfolio;

pub use monitor::{PriceSource, RiskMonitor, WatchEntry};
pub use portfolio::{AllocationPlan, PortfolioAgent};
