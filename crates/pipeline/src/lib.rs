pub mod domain;
pub mod prompts;
pub mod reasoner;
pub mod runner;
pub mod scoring;
pub mod session;
pub mod stages;

pub use domain::{AssetDomain, CryptoDomain, StockDomain};
pub use reasoner::{HttpReasoner, ScriptedReasoner};
pub use runner::PipelineRunner;
pub use session::{ApprovalStatus, MarketContext, Session, SessionEvent, SessionStore, Stage};
pub use stages::PipelineDeps;
