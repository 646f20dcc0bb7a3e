//! Trading engine: quant model, execution gateways, strategy core, tick
//! scheduling and session reporting.

pub mod clob_live;
pub mod gateway;
pub mod quant;
pub mod report;
pub mod scheduler;
pub mod strategy;

pub use clob_live::{ClobCredentials, CredentialProvider, EnvCredentialProvider, LiveGateway};
pub use gateway::{ExecutionGateway, Fill, OpenOrder, PaperGateway};
pub use report::SessionReporter;
pub use scheduler::{spawn_monitor, EngineHandles, TickScheduler};
pub use strategy::{EntryDecision, SkipReason, StrategyCore, StrategyStats};
