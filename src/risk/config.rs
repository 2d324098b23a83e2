//! Risk limits that do not depend on the permission level.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::config::FailPolicy;

/// Account-wide risk configuration. Per-level limits live in the level table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Realized loss since local midnight, as a fraction of balance, that pauses trading
    pub max_daily_loss_pct: Decimal,

    /// Drawdown from the initial balance (0.0 to 1.0) that closes everything
    pub max_drawdown_pct: Decimal,

    /// Number of most recent settled trades that must all lose to trigger review
    pub max_consecutive_losses: usize,

    /// Policy for checks that read trade history when the read fails
    #[serde(skip, default = "default_history_policy")]
    pub history_fail_policy: FailPolicy,
}

fn default_history_policy() -> FailPolicy {
    FailPolicy::Open
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: dec!(0.05), // 5% of balance per day
            max_drawdown_pct: dec!(0.15),   // 15% from initial balance
            max_consecutive_losses: 3,
            history_fail_policy: FailPolicy::Open,
        }
    }
}
