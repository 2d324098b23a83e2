//! Database persistence for permission state, orders, trades, risk events
//! and debate settings.
//!
//! Stores everything needed to resume after restart:
//! - The permission level table (seeded once, admin-editable)
//! - Per-account permission state and the transition log
//! - Orders and the trades they produced
//! - Risk events and their resolution
//! - Debate settings and rate-limit counters

mod records;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use tracing::{debug, info};

use crate::debate::{CounterStore, DebateConfig, DebateSettingsStore};
use crate::models::{
    AccountPermissionState, NewRiskEvent, Order, OrderStatus, PermissionLevelConfig,
    PermissionTransition, RiskEvent, Trade,
};
use crate::permission::{LevelTable, PermissionStore};
use crate::risk::{RiskEventSink, TradeHistory};

use records::{
    convert_all, StoredAccount, StoredLevel, StoredOrder, StoredRiskEvent, StoredTrade,
    StoredTransition,
};

/// Database connection pool with full state management.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.seed_defaults().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same memory instance.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.seed_defaults().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Permission level table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS permission_levels (
                level TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                max_position_pct TEXT NOT NULL,
                max_leverage INTEGER NOT NULL,
                confidence_threshold TEXT NOT NULL,
                max_daily_trades INTEGER NOT NULL,
                upgrade_win_rate_7d REAL,
                upgrade_win_rate_30d REAL,
                upgrade_sharpe_ratio REAL,
                upgrade_min_trades INTEGER,
                upgrade_min_days INTEGER,
                downgrade_max_drawdown REAL,
                downgrade_consecutive_losses INTEGER,
                downgrade_win_rate_7d REAL,
                is_default INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Account permission state
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_permissions (
                account_id TEXT PRIMARY KEY,
                level TEXT NOT NULL REFERENCES permission_levels(level),
                entered_at TEXT NOT NULL,
                consecutive_losses INTEGER NOT NULL DEFAULT 0,
                initial_balance TEXT,
                protection_reason TEXT,
                last_marker TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Transition log
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS permission_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                from_level TEXT NOT NULL,
                to_level TEXT NOT NULL,
                kind TEXT NOT NULL,
                reason TEXT NOT NULL,
                applied INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Orders (every attempt, including failures)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                size TEXT NOT NULL,
                price TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                exchange_order_id TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Trades (filled orders only)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                order_id TEXT NOT NULL UNIQUE REFERENCES orders(id),
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                size TEXT NOT NULL,
                price TEXT NOT NULL,
                realized_pnl TEXT,
                confidence TEXT NOT NULL,
                reasoning TEXT NOT NULL DEFAULT '',
                executed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Risk events
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS risk_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                description TEXT NOT NULL,
                action_taken TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolved_at TEXT,
                resolved_by TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Debate settings
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS debate_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Rate-limit counters (expires_at in epoch milliseconds)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_counters (
                key TEXT PRIMARY KEY,
                count INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_account_time ON trades(account_id, executed_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_account ON orders(account_id, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_risk_events_account ON risk_events(account_id, resolved)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transitions_account ON permission_transitions(account_id, created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert the default level table and debate settings where missing.
    async fn seed_defaults(&self) -> Result<()> {
        for row in LevelTable::defaults().rows() {
            self.write_level(row, false).await?;
        }

        for (key, value) in DebateConfig::default().to_pairs() {
            sqlx::query("INSERT OR IGNORE INTO debate_config (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    // ==================== Permission Levels ====================

    async fn write_level(&self, row: &PermissionLevelConfig, overwrite: bool) -> Result<()> {
        let conflict = if overwrite {
            r#"ON CONFLICT(level) DO UPDATE SET
                name = excluded.name,
                max_position_pct = excluded.max_position_pct,
                max_leverage = excluded.max_leverage,
                confidence_threshold = excluded.confidence_threshold,
                max_daily_trades = excluded.max_daily_trades,
                upgrade_win_rate_7d = excluded.upgrade_win_rate_7d,
                upgrade_win_rate_30d = excluded.upgrade_win_rate_30d,
                upgrade_sharpe_ratio = excluded.upgrade_sharpe_ratio,
                upgrade_min_trades = excluded.upgrade_min_trades,
                upgrade_min_days = excluded.upgrade_min_days,
                downgrade_max_drawdown = excluded.downgrade_max_drawdown,
                downgrade_consecutive_losses = excluded.downgrade_consecutive_losses,
                downgrade_win_rate_7d = excluded.downgrade_win_rate_7d,
                is_default = excluded.is_default,
                updated_at = datetime('now')"#
        } else {
            "ON CONFLICT(level) DO NOTHING"
        };

        let sql = format!(
            r#"
            INSERT INTO permission_levels (
                level, name, max_position_pct, max_leverage, confidence_threshold,
                max_daily_trades, upgrade_win_rate_7d, upgrade_win_rate_30d,
                upgrade_sharpe_ratio, upgrade_min_trades, upgrade_min_days,
                downgrade_max_drawdown, downgrade_consecutive_losses,
                downgrade_win_rate_7d, is_default
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            {}
            "#,
            conflict
        );

        sqlx::query(&sql)
            .bind(row.level.as_str())
            .bind(&row.name)
            .bind(row.max_position_pct.to_string())
            .bind(i64::from(row.max_leverage))
            .bind(row.confidence_threshold.to_string())
            .bind(i64::from(row.max_daily_trades))
            .bind(row.upgrade.win_rate_7d)
            .bind(row.upgrade.win_rate_30d)
            .bind(row.upgrade.sharpe_ratio)
            .bind(row.upgrade.min_trades.map(i64::from))
            .bind(row.upgrade.min_days.map(i64::from))
            .bind(row.downgrade.max_drawdown)
            .bind(row.downgrade.consecutive_losses.map(i64::from))
            .bind(row.downgrade.win_rate_7d)
            .bind(row.is_default)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to write permission level {}", row.level))?;

        Ok(())
    }

    /// Load and validate the level table.
    pub async fn load_level_table(&self) -> Result<LevelTable> {
        let rows = sqlx::query_as::<_, StoredLevel>(
            r#"
            SELECT level, name, max_position_pct, max_leverage, confidence_threshold,
                   max_daily_trades, upgrade_win_rate_7d, upgrade_win_rate_30d,
                   upgrade_sharpe_ratio, upgrade_min_trades, upgrade_min_days,
                   downgrade_max_drawdown, downgrade_consecutive_losses,
                   downgrade_win_rate_7d, is_default
            FROM permission_levels
            ORDER BY level
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch permission levels")?;

        let configs: Vec<PermissionLevelConfig> = convert_all(rows)?;
        let table = LevelTable::new(configs).context("Invalid permission level table")?;
        Ok(table)
    }

    /// Replace the whole level table. The new table is validated as a whole
    /// before anything is written.
    pub async fn save_level_table(&self, table: &LevelTable) -> Result<()> {
        for row in table.rows() {
            self.write_level(row, true).await?;
        }
        info!("Permission level table saved");
        Ok(())
    }

    // ==================== Account Permissions ====================

    pub async fn get_account_state(&self, account_id: &str) -> Result<Option<AccountPermissionState>> {
        let row = sqlx::query_as::<_, StoredAccount>(
            r#"
            SELECT account_id, level, entered_at, consecutive_losses, initial_balance,
                   protection_reason, last_marker, updated_at
            FROM account_permissions WHERE account_id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch account permission state")?;

        row.map(AccountPermissionState::try_from).transpose()
    }

    pub async fn upsert_account_state(&self, state: &AccountPermissionState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_permissions (
                account_id, level, entered_at, consecutive_losses, initial_balance,
                protection_reason, last_marker, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                level = excluded.level,
                entered_at = excluded.entered_at,
                consecutive_losses = excluded.consecutive_losses,
                initial_balance = excluded.initial_balance,
                protection_reason = excluded.protection_reason,
                last_marker = excluded.last_marker,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.account_id)
        .bind(state.level.as_str())
        .bind(state.entered_at)
        .bind(i64::from(state.consecutive_losses))
        .bind(state.initial_balance.map(|b| b.to_string()))
        .bind(&state.protection_reason)
        .bind(state.last_marker.map(|m| m.encode()))
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to save account permission state")?;

        Ok(())
    }

    pub async fn list_accounts(&self) -> Result<Vec<AccountPermissionState>> {
        let rows = sqlx::query_as::<_, StoredAccount>(
            r#"
            SELECT account_id, level, entered_at, consecutive_losses, initial_balance,
                   protection_reason, last_marker, updated_at
            FROM account_permissions ORDER BY account_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch accounts")?;

        convert_all(rows)
    }

    // ==================== Transitions ====================

    pub async fn insert_transition(&self, t: &PermissionTransition) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO permission_transitions (
                account_id, from_level, to_level, kind, reason, applied, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&t.account_id)
        .bind(t.from_level.as_str())
        .bind(t.to_level.as_str())
        .bind(t.kind.as_str())
        .bind(&t.reason)
        .bind(t.applied)
        .bind(t.created_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to record permission transition")?;

        Ok(row.get("id"))
    }

    /// Most recent transitions first.
    pub async fn get_transitions(&self, account_id: &str, limit: i64) -> Result<Vec<PermissionTransition>> {
        let rows = sqlx::query_as::<_, StoredTransition>(
            r#"
            SELECT id, account_id, from_level, to_level, kind, reason, applied, created_at
            FROM permission_transitions
            WHERE account_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch transitions")?;

        convert_all(rows)
    }

    // ==================== Orders ====================

    pub async fn insert_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, account_id, symbol, side, size, price, status,
                exchange_order_id, error_message, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&order.id)
        .bind(&order.account_id)
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.size.to_string())
        .bind(order.price.to_string())
        .bind(order.status.as_str())
        .bind(&order.exchange_order_id)
        .bind(&order.error_message)
        .bind(order.created_at)
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to save order")?;

        Ok(())
    }

    pub async fn update_order_status(
        &self,
        id: &str,
        status: OrderStatus,
        exchange_order_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders SET
                status = ?,
                exchange_order_id = COALESCE(?, exchange_order_id),
                error_message = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(exchange_order_id)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update order status")?;

        Ok(())
    }

    pub async fn get_orders(&self, account_id: &str, limit: i64) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, StoredOrder>(
            r#"
            SELECT id, account_id, symbol, side, size, price, status,
                   exchange_order_id, error_message, created_at
            FROM orders WHERE account_id = ?
            ORDER BY created_at DESC LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch orders")?;

        convert_all(rows)
    }

    // ==================== Trades ====================

    pub async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, account_id, order_id, symbol, side, size, price,
                realized_pnl, confidence, reasoning, executed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.account_id)
        .bind(&trade.order_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.size.to_string())
        .bind(trade.price.to_string())
        .bind(trade.realized_pnl.map(|p| p.to_string()))
        .bind(trade.confidence.to_string())
        .bind(&trade.reasoning)
        .bind(trade.executed_at)
        .execute(&self.pool)
        .await
        .context("Failed to save trade")?;

        Ok(())
    }

    pub async fn get_trades(&self, account_id: &str, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            r#"
            SELECT id, account_id, order_id, symbol, side, size, price,
                   realized_pnl, confidence, reasoning, executed_at
            FROM trades WHERE account_id = ?
            ORDER BY executed_at DESC LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trades")?;

        convert_all(rows)
    }

    async fn settled_pnls_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Decimal>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT realized_pnl FROM trades
            WHERE account_id = ? AND executed_at >= ? AND realized_pnl IS NOT NULL
            "#,
        )
        .bind(account_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch realized P&L")?;

        rows.into_iter()
            .map(|(p,)| p.parse::<Decimal>().with_context(|| format!("Invalid realized_pnl '{}'", p)))
            .collect()
    }

    // ==================== Risk Events ====================

    pub async fn insert_risk_event(&self, event: &NewRiskEvent) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO risk_events (
                account_id, event_type, severity, description, action_taken, resolved, created_at
            ) VALUES (?, ?, ?, ?, ?, 0, ?)
            RETURNING id
            "#,
        )
        .bind(&event.account_id)
        .bind(event.event_type.as_str())
        .bind(event.severity.as_str())
        .bind(&event.description)
        .bind(event.action_taken.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to record risk event")?;

        Ok(row.get("id"))
    }

    /// Newest first.
    pub async fn get_risk_events(
        &self,
        account_id: &str,
        unresolved_only: bool,
        limit: i64,
    ) -> Result<Vec<RiskEvent>> {
        let rows = sqlx::query_as::<_, StoredRiskEvent>(
            r#"
            SELECT id, account_id, event_type, severity, description, action_taken,
                   resolved, resolved_at, resolved_by, created_at
            FROM risk_events
            WHERE account_id = ? AND (? = 0 OR resolved = 0)
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(unresolved_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch risk events")?;

        convert_all(rows)
    }

    /// Mark an event resolved. Returns false if it does not exist or was
    /// already resolved.
    pub async fn resolve_risk_event(&self, id: i64, resolved_by: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE risk_events SET
                resolved = 1,
                resolved_at = ?,
                resolved_by = ?
            WHERE id = ? AND resolved = 0
            "#,
        )
        .bind(Utc::now())
        .bind(resolved_by)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to resolve risk event")?;

        Ok(result.rows_affected() == 1)
    }

    // ==================== Rate Counters ====================

    /// Drop counters that have expired.
    pub async fn purge_expired_counters(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_counters WHERE expires_at <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ==================== Trait Implementations ====================

#[async_trait]
impl TradeHistory for Database {
    async fn realized_pnl_since(&self, account_id: &str, since: DateTime<Utc>) -> Result<Decimal> {
        Ok(self.settled_pnls_since(account_id, since).await?.into_iter().sum())
    }

    async fn recent_settled_trades(&self, account_id: &str, limit: usize) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            r#"
            SELECT id, account_id, order_id, symbol, side, size, price,
                   realized_pnl, confidence, reasoning, executed_at
            FROM trades
            WHERE account_id = ? AND realized_pnl IS NOT NULL
            ORDER BY executed_at DESC LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent settled trades")?;

        convert_all(rows)
    }

    async fn settled_trades_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            r#"
            SELECT id, account_id, order_id, symbol, side, size, price,
                   realized_pnl, confidence, reasoning, executed_at
            FROM trades
            WHERE account_id = ? AND executed_at >= ? AND realized_pnl IS NOT NULL
            ORDER BY executed_at DESC
            "#,
        )
        .bind(account_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch settled trades")?;

        convert_all(rows)
    }

    async fn trade_count_since(&self, account_id: &str, since: DateTime<Utc>) -> Result<u32> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM trades WHERE account_id = ? AND executed_at >= ?")
                .bind(account_id)
                .bind(since)
                .fetch_one(&self.pool)
                .await
                .context("Failed to count trades")?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn initial_balance(&self, account_id: &str) -> Result<Option<Decimal>> {
        Ok(self
            .get_account_state(account_id)
            .await?
            .and_then(|s| s.initial_balance))
    }
}

#[async_trait]
impl RiskEventSink for Database {
    async fn record_risk_event(&self, event: &NewRiskEvent) -> Result<i64> {
        self.insert_risk_event(event).await
    }
}

#[async_trait]
impl PermissionStore for Database {
    async fn load_account_state(&self, account_id: &str) -> Result<Option<AccountPermissionState>> {
        self.get_account_state(account_id).await
    }

    async fn save_account_state(&self, state: &AccountPermissionState) -> Result<()> {
        self.upsert_account_state(state).await
    }

    async fn record_transition(&self, transition: &PermissionTransition) -> Result<i64> {
        self.insert_transition(transition).await
    }
}

#[async_trait]
impl DebateSettingsStore for Database {
    async fn load_debate_settings(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM debate_config ORDER BY key")
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch debate settings")?;
        Ok(rows)
    }

    async fn save_debate_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO debate_config (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = datetime('now')
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CounterStore for Database {
    async fn get(&self, key: &str) -> Result<u64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT count FROM rate_counters WHERE key = ? AND expires_at > ?")
                .bind(key)
                .bind(Utc::now().timestamp_millis())
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read rate counter")?;

        Ok(row.map(|(c,)| c.max(0) as u64).unwrap_or(0))
    }

    async fn increment(&self, keys: &[(&str, Duration)]) -> Result<Vec<u64>> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await.context("Failed to begin counter transaction")?;

        let mut values = Vec::with_capacity(keys.len());
        for (key, ttl) in keys {
            let expires_at = now + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2);
            let (count,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO rate_counters (key, count, expires_at) VALUES (?, 1, ?)
                ON CONFLICT(key) DO UPDATE SET
                    count = CASE WHEN rate_counters.expires_at <= ? THEN 1 ELSE rate_counters.count + 1 END,
                    expires_at = excluded.expires_at
                RETURNING count
                "#,
            )
            .bind(*key)
            .bind(expires_at)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to increment rate counter")?;
            values.push(count.max(0) as u64);
        }

        tx.commit().await.context("Failed to commit counter transaction")?;
        debug!(?values, "Rate counters incremented");
        Ok(values)
    }

    async fn delete(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            sqlx::query("DELETE FROM rate_counters WHERE key = ?")
                .bind(*key)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}
