//! Row types as stored, and their conversion into domain models.
//!
//! Decimals are stored as TEXT and parsed back here.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{
    AccountPermissionState, DowngradeThresholds, EvaluationMarker, Order, OrderStatus,
    PermissionLevel, PermissionLevelConfig, PermissionTransition, RiskEvent, RiskEventType,
    Severity, Trade, TradeSide, TransitionKind, UpgradeThresholds,
};

fn decimal(field: &str, raw: &str) -> Result<Decimal> {
    raw.parse::<Decimal>()
        .with_context(|| format!("Invalid decimal in {}: '{}'", field, raw))
}

fn level(raw: &str) -> Result<PermissionLevel> {
    raw.parse::<PermissionLevel>().map_err(|e| anyhow!(e))
}

fn side(raw: &str) -> Result<TradeSide> {
    TradeSide::parse(raw).ok_or_else(|| anyhow!("Invalid trade side '{}'", raw))
}

/// Stored permission level row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredLevel {
    pub level: String,
    pub name: String,
    pub max_position_pct: String,
    pub max_leverage: i64,
    pub confidence_threshold: String,
    pub max_daily_trades: i64,
    pub upgrade_win_rate_7d: Option<f64>,
    pub upgrade_win_rate_30d: Option<f64>,
    pub upgrade_sharpe_ratio: Option<f64>,
    pub upgrade_min_trades: Option<i64>,
    pub upgrade_min_days: Option<i64>,
    pub downgrade_max_drawdown: Option<f64>,
    pub downgrade_consecutive_losses: Option<i64>,
    pub downgrade_win_rate_7d: Option<f64>,
    pub is_default: bool,
}

impl TryFrom<StoredLevel> for PermissionLevelConfig {
    type Error = anyhow::Error;

    fn try_from(row: StoredLevel) -> Result<Self> {
        let count = |field: &str, v: i64| -> Result<u32> {
            u32::try_from(v).with_context(|| format!("{} out of range: {}", field, v))
        };
        let opt_count = |field: &str, v: Option<i64>| -> Result<Option<u32>> {
            v.map(|v| count(field, v)).transpose()
        };

        Ok(Self {
            level: level(&row.level)?,
            name: row.name,
            max_position_pct: decimal("max_position_pct", &row.max_position_pct)?,
            max_leverage: count("max_leverage", row.max_leverage)?,
            confidence_threshold: decimal("confidence_threshold", &row.confidence_threshold)?,
            max_daily_trades: count("max_daily_trades", row.max_daily_trades)?,
            upgrade: UpgradeThresholds {
                win_rate_7d: row.upgrade_win_rate_7d,
                win_rate_30d: row.upgrade_win_rate_30d,
                sharpe_ratio: row.upgrade_sharpe_ratio,
                min_trades: opt_count("upgrade_min_trades", row.upgrade_min_trades)?,
                min_days: opt_count("upgrade_min_days", row.upgrade_min_days)?,
            },
            downgrade: DowngradeThresholds {
                max_drawdown: row.downgrade_max_drawdown,
                consecutive_losses: opt_count(
                    "downgrade_consecutive_losses",
                    row.downgrade_consecutive_losses,
                )?,
                win_rate_7d: row.downgrade_win_rate_7d,
            },
            is_default: row.is_default,
        })
    }
}

/// Stored account permission state.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredAccount {
    pub account_id: String,
    pub level: String,
    pub entered_at: DateTime<Utc>,
    pub consecutive_losses: i64,
    pub initial_balance: Option<String>,
    pub protection_reason: Option<String>,
    pub last_marker: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<StoredAccount> for AccountPermissionState {
    type Error = anyhow::Error;

    fn try_from(row: StoredAccount) -> Result<Self> {
        Ok(Self {
            level: level(&row.level)?,
            account_id: row.account_id,
            entered_at: row.entered_at,
            consecutive_losses: u32::try_from(row.consecutive_losses.max(0)).unwrap_or(u32::MAX),
            initial_balance: row
                .initial_balance
                .as_deref()
                .map(|b| decimal("initial_balance", b))
                .transpose()?,
            protection_reason: row.protection_reason,
            last_marker: row.last_marker.as_deref().and_then(EvaluationMarker::decode),
            updated_at: row.updated_at,
        })
    }
}

/// Stored permission transition.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTransition {
    pub id: i64,
    pub account_id: String,
    pub from_level: String,
    pub to_level: String,
    pub kind: String,
    pub reason: String,
    pub applied: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<StoredTransition> for PermissionTransition {
    type Error = anyhow::Error;

    fn try_from(row: StoredTransition) -> Result<Self> {
        Ok(Self {
            from_level: level(&row.from_level)?,
            to_level: level(&row.to_level)?,
            kind: TransitionKind::parse(&row.kind)
                .ok_or_else(|| anyhow!("Invalid transition kind '{}'", row.kind))?,
            account_id: row.account_id,
            reason: row.reason,
            applied: row.applied,
            created_at: row.created_at,
        })
    }
}

/// Stored order record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredOrder {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: String,
    pub size: String,
    pub price: String,
    pub status: String,
    pub exchange_order_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<StoredOrder> for Order {
    type Error = anyhow::Error;

    fn try_from(row: StoredOrder) -> Result<Self> {
        Ok(Self {
            side: side(&row.side)?,
            size: decimal("size", &row.size)?,
            price: decimal("price", &row.price)?,
            status: OrderStatus::parse(&row.status)
                .ok_or_else(|| anyhow!("Invalid order status '{}'", row.status))?,
            id: row.id,
            account_id: row.account_id,
            symbol: row.symbol,
            exchange_order_id: row.exchange_order_id,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

/// Stored trade record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: String,
    pub account_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub size: String,
    pub price: String,
    pub realized_pnl: Option<String>,
    pub confidence: String,
    pub reasoning: String,
    pub executed_at: DateTime<Utc>,
}

impl TryFrom<StoredTrade> for Trade {
    type Error = anyhow::Error;

    fn try_from(row: StoredTrade) -> Result<Self> {
        Ok(Self {
            side: side(&row.side)?,
            size: decimal("size", &row.size)?,
            price: decimal("price", &row.price)?,
            realized_pnl: row
                .realized_pnl
                .as_deref()
                .map(|p| decimal("realized_pnl", p))
                .transpose()?,
            confidence: decimal("confidence", &row.confidence)?,
            id: row.id,
            account_id: row.account_id,
            order_id: row.order_id,
            symbol: row.symbol,
            reasoning: row.reasoning,
            executed_at: row.executed_at,
        })
    }
}

/// Stored risk event.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredRiskEvent {
    pub id: i64,
    pub account_id: String,
    pub event_type: String,
    pub severity: String,
    pub description: String,
    pub action_taken: String,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<StoredRiskEvent> for RiskEvent {
    type Error = anyhow::Error;

    fn try_from(row: StoredRiskEvent) -> Result<Self> {
        Ok(Self {
            event_type: RiskEventType::parse(&row.event_type)
                .ok_or_else(|| anyhow!("Invalid risk event type '{}'", row.event_type))?,
            severity: Severity::parse(&row.severity)
                .ok_or_else(|| anyhow!("Invalid severity '{}'", row.severity))?,
            id: row.id,
            account_id: row.account_id,
            description: row.description,
            action_taken: row.action_taken,
            resolved: row.resolved,
            resolved_at: row.resolved_at,
            resolved_by: row.resolved_by,
            created_at: row.created_at,
        })
    }
}

/// Convert rows, failing on the first bad one.
pub fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}
