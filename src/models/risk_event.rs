//! Risk events: the audit trail of rejected decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which rule produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskEventType {
    PositionLimit,
    DailyLossLimit,
    MaxDrawdown,
    ConsecutiveLosses,
    ConfidenceThreshold,
    LeverageLimit,
    DailyTradeLimit,
}

impl RiskEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskEventType::PositionLimit => "POSITION_LIMIT",
            RiskEventType::DailyLossLimit => "DAILY_LOSS_LIMIT",
            RiskEventType::MaxDrawdown => "MAX_DRAWDOWN",
            RiskEventType::ConsecutiveLosses => "CONSECUTIVE_LOSSES",
            RiskEventType::ConfidenceThreshold => "CONFIDENCE_THRESHOLD",
            RiskEventType::LeverageLimit => "LEVERAGE_LIMIT",
            RiskEventType::DailyTradeLimit => "DAILY_TRADE_LIMIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "POSITION_LIMIT" => Some(RiskEventType::PositionLimit),
            "DAILY_LOSS_LIMIT" => Some(RiskEventType::DailyLossLimit),
            "MAX_DRAWDOWN" => Some(RiskEventType::MaxDrawdown),
            "CONSECUTIVE_LOSSES" => Some(RiskEventType::ConsecutiveLosses),
            "CONFIDENCE_THRESHOLD" => Some(RiskEventType::ConfidenceThreshold),
            "LEVERAGE_LIMIT" => Some(RiskEventType::LeverageLimit),
            "DAILY_TRADE_LIMIT" => Some(RiskEventType::DailyTradeLimit),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(Severity::Low),
            "MEDIUM" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller must do about a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    /// Drop this order only
    RejectOrder,
    /// Stop trading for the rest of the day
    PauseTrading,
    /// Flatten every position and enter protection mode
    CloseAllPositions,
    /// Keep going but flag the account for a human
    ManualReview,
}

impl RiskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskAction::RejectOrder => "reject_order",
            RiskAction::PauseTrading => "pause_trading",
            RiskAction::CloseAllPositions => "close_all_positions",
            RiskAction::ManualReview => "manual_review",
        }
    }
}

impl std::fmt::Display for RiskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A risk event about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRiskEvent {
    pub account_id: String,
    pub event_type: RiskEventType,
    pub severity: Severity,
    pub description: String,
    pub action_taken: RiskAction,
}

/// A stored risk event. Append-only except for the resolution fields.
#[derive(Debug, Clone, Serialize)]
pub struct RiskEvent {
    pub id: i64,
    pub account_id: String,
    pub event_type: RiskEventType,
    pub severity: Severity,
    pub description: String,
    pub action_taken: String,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
}
