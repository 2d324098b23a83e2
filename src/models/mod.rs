//! Data models for decisions, permission levels, trades and risk events.

mod decision;
mod level;
mod risk_event;
mod trade;
mod transition;

pub use decision::{Decision, TradeAction};
pub use level::{
    AccountPermissionState, DowngradeThresholds, EvaluationMarker, PermissionLevel,
    PermissionLevelConfig, PermissionSnapshot, UpgradeThresholds,
};
pub use risk_event::{NewRiskEvent, RiskAction, RiskEvent, RiskEventType, Severity};
pub use trade::{Order, OrderStatus, Trade, TradeSide};
pub use transition::{PermissionTransition, TransitionKind};
