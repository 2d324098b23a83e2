//! Read/write seams the risk layer uses to reach persisted trading facts.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{NewRiskEvent, Trade};

/// Historical trade queries scoped to one account.
#[async_trait]
pub trait TradeHistory: Send + Sync {
    /// Sum of realized P&L of trades executed at or after `since`.
    async fn realized_pnl_since(&self, account_id: &str, since: DateTime<Utc>) -> Result<Decimal>;

    /// Most recent settled trades, newest first.
    async fn recent_settled_trades(&self, account_id: &str, limit: usize) -> Result<Vec<Trade>>;

    /// Settled trades executed at or after `since`, newest first.
    async fn settled_trades_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Trade>>;

    /// Number of trades executed at or after `since`.
    async fn trade_count_since(&self, account_id: &str, since: DateTime<Utc>) -> Result<u32>;

    /// Drawdown baseline recorded for the account, if any.
    async fn initial_balance(&self, account_id: &str) -> Result<Option<Decimal>>;
}

/// Destination for risk events.
#[async_trait]
pub trait RiskEventSink: Send + Sync {
    async fn record_risk_event(&self, event: &NewRiskEvent) -> Result<i64>;
}
