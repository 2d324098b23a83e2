//! Risk manager: validates a proposed decision against hard constraints.
//!
//! Checks run in a fixed order and the first failure wins:
//! 1. HOLD / zero size is accepted immediately
//! 2. Position limit (level `max_position_pct`)
//! 3. Daily realized loss
//! 4. Drawdown from the initial balance
//! 5. Consecutive losing trades
//! 6. Confidence floor (level `confidence_threshold`)
//! 7. Requested leverage (level `max_leverage`)
//! 8. Trades already executed today (level `max_daily_trades`)
//!
//! Checks 3, 4, 5 and 8 read trade history. A failed read follows
//! `RiskConfig::history_fail_policy`. The remaining checks use local inputs
//! only and always fail closed on malformed values.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Local, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, error, warn};

use crate::config::FailPolicy;
use crate::models::{
    Decision, NewRiskEvent, PermissionSnapshot, RiskAction, RiskEventType, Severity,
};

use super::{RiskConfig, RiskEventSink, TradeHistory};

/// Account and market inputs for one validation.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountSnapshot {
    /// Current account balance in quote currency
    pub balance: Decimal,

    /// Current market price of the traded symbol
    pub current_price: Decimal,

    /// Current net position in the traded symbol (base units, signed)
    pub position_size: Decimal,
}

/// Why a decision was rejected, with the numbers that decided it.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectionKind {
    PositionLimit {
        order_value: Decimal,
        limit: Decimal,
    },
    DailyLoss {
        realized_pnl: Decimal,
        limit: Decimal,
    },
    MaxDrawdown {
        drawdown: Decimal,
        limit: Decimal,
    },
    ConsecutiveLosses {
        count: usize,
    },
    ConfidenceFloor {
        confidence: Decimal,
        threshold: Decimal,
    },
    LeverageLimit {
        requested: u32,
        max: u32,
    },
    DailyTradeLimit {
        count: u32,
        max: u32,
    },
    /// A local input was malformed; the owning check failed closed
    InvalidInput {
        check: RiskEventType,
        detail: String,
    },
    /// History was unreadable and the fail policy is closed
    HistoryUnavailable {
        check: RiskEventType,
        error: String,
    },
}

impl RejectionKind {
    pub fn event_type(&self) -> RiskEventType {
        match self {
            RejectionKind::PositionLimit { .. } => RiskEventType::PositionLimit,
            RejectionKind::DailyLoss { .. } => RiskEventType::DailyLossLimit,
            RejectionKind::MaxDrawdown { .. } => RiskEventType::MaxDrawdown,
            RejectionKind::ConsecutiveLosses { .. } => RiskEventType::ConsecutiveLosses,
            RejectionKind::ConfidenceFloor { .. } => RiskEventType::ConfidenceThreshold,
            RejectionKind::LeverageLimit { .. } => RiskEventType::LeverageLimit,
            RejectionKind::DailyTradeLimit { .. } => RiskEventType::DailyTradeLimit,
            RejectionKind::InvalidInput { check, .. } => *check,
            RejectionKind::HistoryUnavailable { check, .. } => *check,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            RejectionKind::DailyLoss { .. } | RejectionKind::MaxDrawdown { .. } => {
                Severity::Critical
            }
            RejectionKind::PositionLimit { .. }
            | RejectionKind::ConsecutiveLosses { .. }
            | RejectionKind::LeverageLimit { .. }
            | RejectionKind::InvalidInput { .. } => Severity::High,
            RejectionKind::ConfidenceFloor { .. }
            | RejectionKind::DailyTradeLimit { .. }
            | RejectionKind::HistoryUnavailable { .. } => Severity::Medium,
        }
    }

    pub fn action(&self) -> RiskAction {
        match self {
            RejectionKind::DailyLoss { .. } => RiskAction::PauseTrading,
            RejectionKind::MaxDrawdown { .. } => RiskAction::CloseAllPositions,
            RejectionKind::ConsecutiveLosses { .. } => RiskAction::ManualReview,
            _ => RiskAction::RejectOrder,
        }
    }
}

/// A rejected decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub reason: String,
}

impl Rejection {
    fn new(kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn action(&self) -> RiskAction {
        self.kind.action()
    }
}

/// Outcome of [`RiskManager::validate_decision`].
#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Accepted,
    Rejected(Rejection),
}

impl RiskVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RiskVerdict::Accepted)
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            RiskVerdict::Accepted => None,
            RiskVerdict::Rejected(r) => Some(r),
        }
    }

    /// `(allowed, reason)` form for API responses.
    pub fn into_tuple(self) -> (bool, Option<String>) {
        match self {
            RiskVerdict::Accepted => (true, None),
            RiskVerdict::Rejected(r) => (false, Some(r.reason)),
        }
    }
}

/// Start of the current local day, in UTC.
pub fn local_day_start(now: DateTime<Local>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| now.with_timezone(&Utc) - Duration::hours(24))
}

/// Next local midnight, in UTC.
pub fn next_local_midnight(now: DateTime<Local>) -> DateTime<Utc> {
    now.date_naive()
        .succ_opt()
        .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| now.with_timezone(&Utc) + Duration::hours(24))
}

/// Result of one history-backed check.
enum Check {
    Pass,
    Fail(Rejection),
}

/// Stateless rule evaluator over injected history.
pub struct RiskManager {
    config: RiskConfig,
    history: Arc<dyn TradeHistory>,
    events: Arc<dyn RiskEventSink>,
}

impl RiskManager {
    pub fn new(
        config: RiskConfig,
        history: Arc<dyn TradeHistory>,
        events: Arc<dyn RiskEventSink>,
    ) -> Self {
        Self {
            config,
            history,
            events,
        }
    }

    /// Validate a decision. A rejection writes exactly one risk event.
    pub async fn validate_decision(
        &self,
        decision: &Decision,
        permission: &PermissionSnapshot,
        account: &AccountSnapshot,
    ) -> RiskVerdict {
        if !decision.is_actionable() {
            debug!(action = %decision.action, size = %decision.size, "Trivial accept");
            return RiskVerdict::Accepted;
        }

        match self.evaluate(decision, permission, account).await {
            None => RiskVerdict::Accepted,
            Some(rejection) => {
                warn!(
                    account = %permission.account_id,
                    level = %permission.level,
                    event_type = %rejection.kind.event_type(),
                    severity = %rejection.severity(),
                    reason = %rejection.reason,
                    "Decision rejected"
                );
                self.record(&permission.account_id, &rejection).await;
                RiskVerdict::Rejected(rejection)
            }
        }
    }

    /// Run the checks in order, stopping at the first failure.
    async fn evaluate(
        &self,
        decision: &Decision,
        permission: &PermissionSnapshot,
        account: &AccountSnapshot,
    ) -> Option<Rejection> {
        if let Some(r) = self.check_position_limit(decision, permission, account) {
            return Some(r);
        }

        let account_id = permission.account_id.as_str();
        let day_start = local_day_start(Local::now());

        if let Check::Fail(r) = self.check_daily_loss(account_id, account, day_start).await {
            return Some(r);
        }
        if let Check::Fail(r) = self.check_drawdown(account_id, account).await {
            return Some(r);
        }
        if let Check::Fail(r) = self.check_consecutive_losses(account_id).await {
            return Some(r);
        }

        if let Some(r) = self.check_confidence(decision, permission) {
            return Some(r);
        }
        if let Some(r) = self.check_leverage(decision, permission) {
            return Some(r);
        }

        if let Check::Fail(r) = self.check_daily_trades(account_id, permission, day_start).await {
            return Some(r);
        }

        None
    }

    fn check_position_limit(
        &self,
        decision: &Decision,
        permission: &PermissionSnapshot,
        account: &AccountSnapshot,
    ) -> Option<Rejection> {
        let invalid = |detail: String| {
            Some(Rejection::new(
                RejectionKind::InvalidInput {
                    check: RiskEventType::PositionLimit,
                    detail: detail.clone(),
                },
                format!("Invalid order input: {}", detail),
            ))
        };

        if decision.size < Decimal::ZERO {
            return invalid(format!("negative size {}", decision.size));
        }
        if account.current_price <= Decimal::ZERO {
            return invalid(format!("non-positive price {}", account.current_price));
        }
        if account.balance < Decimal::ZERO {
            return invalid(format!("negative balance {}", account.balance));
        }

        let order_value = decision.notional(account.current_price);
        let limit = account.balance * permission.max_position_pct;

        if permission.trading_disabled() {
            return Some(Rejection::new(
                RejectionKind::PositionLimit { order_value, limit },
                format!(
                    "Position limit exceeded: trading disabled at {} (protection mode)",
                    permission.level
                ),
            ));
        }

        if order_value > limit {
            return Some(Rejection::new(
                RejectionKind::PositionLimit { order_value, limit },
                format!(
                    "Position limit exceeded: order value ${:.2} > limit ${:.2} ({}% of ${:.2} at {}, current position {})",
                    order_value,
                    limit,
                    (permission.max_position_pct * dec!(100)).normalize(),
                    account.balance,
                    permission.level,
                    account.position_size
                ),
            ));
        }

        None
    }

    async fn check_daily_loss(
        &self,
        account_id: &str,
        account: &AccountSnapshot,
        day_start: DateTime<Utc>,
    ) -> Check {
        let realized = match self.history.realized_pnl_since(account_id, day_start).await {
            Ok(pnl) => pnl,
            Err(e) => return self.history_failure(RiskEventType::DailyLossLimit, e),
        };

        let limit = account.balance * self.config.max_daily_loss_pct;
        if realized < -limit {
            return Check::Fail(Rejection::new(
                RejectionKind::DailyLoss {
                    realized_pnl: realized,
                    limit,
                },
                format!(
                    "Daily loss limit reached: realized ${:.2} today exceeds -${:.2}",
                    realized, limit
                ),
            ));
        }

        Check::Pass
    }

    async fn check_drawdown(&self, account_id: &str, account: &AccountSnapshot) -> Check {
        let initial = match self.history.initial_balance(account_id).await {
            Ok(Some(initial)) if initial > Decimal::ZERO => initial,
            Ok(_) => return Check::Pass,
            Err(e) => return self.history_failure(RiskEventType::MaxDrawdown, e),
        };

        let drawdown = (initial - account.balance) / initial;
        if drawdown > self.config.max_drawdown_pct {
            return Check::Fail(Rejection::new(
                RejectionKind::MaxDrawdown {
                    drawdown,
                    limit: self.config.max_drawdown_pct,
                },
                format!(
                    "Max drawdown exceeded: {:.2}% > {:.2}% (initial ${:.2}, current ${:.2})",
                    drawdown * dec!(100),
                    self.config.max_drawdown_pct * dec!(100),
                    initial,
                    account.balance
                ),
            ));
        }

        Check::Pass
    }

    async fn check_consecutive_losses(&self, account_id: &str) -> Check {
        let max_losses = self.config.max_consecutive_losses;
        if max_losses == 0 {
            return Check::Pass;
        }

        let recent = match self.history.recent_settled_trades(account_id, max_losses).await {
            Ok(trades) => trades,
            Err(e) => return self.history_failure(RiskEventType::ConsecutiveLosses, e),
        };

        if recent.len() >= max_losses && recent.iter().take(max_losses).all(|t| t.is_loss()) {
            return Check::Fail(Rejection::new(
                RejectionKind::ConsecutiveLosses { count: max_losses },
                format!(
                    "Consecutive losses: last {} trades all lost, manual review required",
                    max_losses
                ),
            ));
        }

        Check::Pass
    }

    fn check_confidence(
        &self,
        decision: &Decision,
        permission: &PermissionSnapshot,
    ) -> Option<Rejection> {
        if decision.confidence < Decimal::ZERO || decision.confidence > Decimal::ONE {
            let detail = format!("confidence {} outside [0, 1]", decision.confidence);
            return Some(Rejection::new(
                RejectionKind::InvalidInput {
                    check: RiskEventType::ConfidenceThreshold,
                    detail: detail.clone(),
                },
                format!("Invalid decision: {}", detail),
            ));
        }

        if decision.confidence < permission.confidence_threshold {
            return Some(Rejection::new(
                RejectionKind::ConfidenceFloor {
                    confidence: decision.confidence,
                    threshold: permission.confidence_threshold,
                },
                format!(
                    "Confidence too low: {} < {} required at {}",
                    decision.confidence, permission.confidence_threshold, permission.level
                ),
            ));
        }

        None
    }

    fn check_leverage(
        &self,
        decision: &Decision,
        permission: &PermissionSnapshot,
    ) -> Option<Rejection> {
        let requested = decision.leverage?;

        if requested == 0 {
            return Some(Rejection::new(
                RejectionKind::InvalidInput {
                    check: RiskEventType::LeverageLimit,
                    detail: "leverage 0".to_string(),
                },
                "Invalid decision: leverage must be at least 1",
            ));
        }

        if requested > permission.max_leverage {
            return Some(Rejection::new(
                RejectionKind::LeverageLimit {
                    requested,
                    max: permission.max_leverage,
                },
                format!(
                    "Leverage too high: {}x > {}x allowed at {}",
                    requested, permission.max_leverage, permission.level
                ),
            ));
        }

        None
    }

    async fn check_daily_trades(
        &self,
        account_id: &str,
        permission: &PermissionSnapshot,
        day_start: DateTime<Utc>,
    ) -> Check {
        let count = match self.history.trade_count_since(account_id, day_start).await {
            Ok(count) => count,
            Err(e) => return self.history_failure(RiskEventType::DailyTradeLimit, e),
        };

        if count >= permission.max_daily_trades {
            return Check::Fail(Rejection::new(
                RejectionKind::DailyTradeLimit {
                    count,
                    max: permission.max_daily_trades,
                },
                format!(
                    "Daily trade limit reached: {} of {} trades at {}",
                    count, permission.max_daily_trades, permission.level
                ),
            ));
        }

        Check::Pass
    }

    fn history_failure(&self, check: RiskEventType, error: anyhow::Error) -> Check {
        match self.config.history_fail_policy {
            FailPolicy::Open => {
                warn!(check = %check, error = %error, "Trade history unavailable, check skipped");
                Check::Pass
            }
            FailPolicy::Closed => {
                let error = error.to_string();
                Check::Fail(Rejection::new(
                    RejectionKind::HistoryUnavailable {
                        check,
                        error: error.clone(),
                    },
                    format!("Risk check {} unavailable: {}", check, error),
                ))
            }
        }
    }

    async fn record(&self, account_id: &str, rejection: &Rejection) {
        let event = NewRiskEvent {
            account_id: account_id.to_string(),
            event_type: rejection.kind.event_type(),
            severity: rejection.severity(),
            description: rejection.reason.clone(),
            action_taken: rejection.action(),
        };

        let result: Result<i64> = self.events.record_risk_event(&event).await;
        if let Err(e) = result {
            error!(
                account = %account_id,
                event_type = %event.event_type,
                error = %e,
                "Failed to persist risk event"
            );
        }
    }
}
