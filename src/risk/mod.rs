//! Decision validation against hard risk limits.

mod config;
mod history;
mod manager;

pub use config::RiskConfig;
pub use history::{RiskEventSink, TradeHistory};
pub use manager::{next_local_midnight, AccountSnapshot, Rejection, RiskManager, RiskVerdict};
