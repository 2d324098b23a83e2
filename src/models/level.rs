//! Permission levels (L0-L5), their configured limits, and per-account state.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trading privilege tier. L0 is protection mode (no trading), L5 is the
/// least restrictive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PermissionLevel {
    L0,
    L1,
    L2,
    L3,
    L4,
    L5,
}

impl PermissionLevel {
    pub const ALL: [PermissionLevel; 6] = [
        PermissionLevel::L0,
        PermissionLevel::L1,
        PermissionLevel::L2,
        PermissionLevel::L3,
        PermissionLevel::L4,
        PermissionLevel::L5,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::L0 => "L0",
            PermissionLevel::L1 => "L1",
            PermissionLevel::L2 => "L2",
            PermissionLevel::L3 => "L3",
            PermissionLevel::L4 => "L4",
            PermissionLevel::L5 => "L5",
        }
    }

    pub fn rank(&self) -> usize {
        *self as usize
    }

    pub fn from_rank(rank: usize) -> Option<Self> {
        Self::ALL.get(rank).copied()
    }

    /// Next level up, `None` at L5.
    pub fn up(&self) -> Option<Self> {
        Self::from_rank(self.rank() + 1)
    }

    /// Next level down, `None` at L0.
    pub fn down(&self) -> Option<Self> {
        self.rank().checked_sub(1).and_then(Self::from_rank)
    }

    pub fn is_protection(&self) -> bool {
        *self == PermissionLevel::L0
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix('L')
            .or_else(|| trimmed.strip_prefix('l'))
            .unwrap_or(trimmed);
        digits
            .parse::<usize>()
            .ok()
            .and_then(Self::from_rank)
            .ok_or_else(|| format!("Invalid permission level: {}", s))
    }
}

/// Performance requirements for leaving a level upwards. `None` means
/// "not required".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpgradeThresholds {
    pub win_rate_7d: Option<f64>,
    pub win_rate_30d: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub min_trades: Option<u32>,
    pub min_days: Option<u32>,
}

impl UpgradeThresholds {
    /// A level with no thresholds at all has no upgrade path.
    pub fn is_empty(&self) -> bool {
        self.win_rate_7d.is_none()
            && self.win_rate_30d.is_none()
            && self.sharpe_ratio.is_none()
            && self.min_trades.is_none()
            && self.min_days.is_none()
    }
}

/// Breach conditions for a level. Any one breached triggers a downgrade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DowngradeThresholds {
    /// Drawdown above this forces protection mode (L0) directly
    pub max_drawdown: Option<f64>,
    pub consecutive_losses: Option<u32>,
    /// 7-day win rate floor
    pub win_rate_7d: Option<f64>,
}

/// One row of the level table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionLevelConfig {
    pub level: PermissionLevel,

    /// Human-readable label
    pub name: String,

    /// Max order value as a fraction of balance (0.0 to 1.0)
    pub max_position_pct: Decimal,

    pub max_leverage: u32,

    /// Minimum decision confidence (0.0 to 1.0)
    pub confidence_threshold: Decimal,

    pub max_daily_trades: u32,

    pub upgrade: UpgradeThresholds,

    pub downgrade: DowngradeThresholds,

    /// Level assigned to new accounts; exactly one row carries it
    pub is_default: bool,
}

/// Immutable view of the limits in force for an account at one instant.
///
/// The risk layer only ever reads this value; it never reaches into
/// mutable account state.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionSnapshot {
    pub account_id: String,
    pub level: PermissionLevel,
    pub max_position_pct: Decimal,
    pub max_leverage: u32,
    pub confidence_threshold: Decimal,
    pub max_daily_trades: u32,
    pub taken_at: DateTime<Utc>,
}

impl PermissionSnapshot {
    pub fn new(account_id: impl Into<String>, config: &PermissionLevelConfig) -> Self {
        Self {
            account_id: account_id.into(),
            level: config.level,
            max_position_pct: config.max_position_pct,
            max_leverage: config.max_leverage,
            confidence_threshold: config.confidence_threshold,
            max_daily_trades: config.max_daily_trades,
            taken_at: Utc::now(),
        }
    }

    pub fn trading_disabled(&self) -> bool {
        self.level.is_protection() || self.max_position_pct <= Decimal::ZERO
    }
}

/// Evidence fingerprint used to keep evaluation idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationMarker {
    pub settled_trades: u32,
    pub latest_trade_at: Option<DateTime<Utc>>,
}

impl EvaluationMarker {
    pub fn encode(&self) -> String {
        match self.latest_trade_at {
            Some(at) => format!("{}@{}", self.settled_trades, at.to_rfc3339()),
            None => format!("{}@", self.settled_trades),
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        let (count, at) = s.split_once('@')?;
        let settled_trades = count.parse().ok()?;
        let latest_trade_at = if at.is_empty() {
            None
        } else {
            Some(DateTime::parse_from_rfc3339(at).ok()?.with_timezone(&Utc))
        };
        Some(Self {
            settled_trades,
            latest_trade_at,
        })
    }
}

/// Current permission state of one account.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountPermissionState {
    pub account_id: String,
    pub level: PermissionLevel,
    pub entered_at: DateTime<Utc>,
    pub consecutive_losses: u32,
    /// Balance recorded when the account was first seen; drawdown baseline
    pub initial_balance: Option<Decimal>,
    pub protection_reason: Option<String>,
    pub last_marker: Option<EvaluationMarker>,
    pub updated_at: DateTime<Utc>,
}

impl AccountPermissionState {
    pub fn new(account_id: impl Into<String>, level: PermissionLevel) -> Self {
        let now = Utc::now();
        Self {
            account_id: account_id.into(),
            level,
            entered_at: now,
            consecutive_losses: 0,
            initial_balance: None,
            protection_reason: None,
            last_marker: None,
            updated_at: now,
        }
    }

    /// Whole days spent at the current level.
    pub fn days_at_level(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entered_at).num_days()
    }
}
