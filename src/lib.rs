pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod strategy;

pub use config::AppConfig;
pub use coordinator::{Coordinator, DisplaySink, LogDisplay};
pub use error::{CarryError, ExecutionError, Result};
pub use exchange::{HedgeExchange, LendingProtocol};
