//! Permission manager: owns each account's level and moves it up or down
//! from trailing performance.
//!
//! Evaluation is split in two. [`propose`] is a pure function of the level
//! table, the account state and the performance window. [`PermissionManager`]
//! gathers those inputs, applies the dry-run flags and the idempotence
//! marker, and persists the result.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::metrics::{PerformanceCalculator, PerformanceWindow};
use crate::models::{
    AccountPermissionState, PermissionLevel, PermissionSnapshot, PermissionTransition,
    TransitionKind,
};
use crate::risk::TradeHistory;

use super::LevelTable;

/// Switches for automatic transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionManagerConfig {
    /// Apply computed upgrades (otherwise only log them)
    pub enable_auto_upgrade: bool,

    /// Apply computed downgrades (otherwise only log them)
    pub enable_auto_downgrade: bool,

    /// Hours after which protection mode clears itself; `None` = manual only
    pub protection_auto_clear_hours: Option<i64>,
}

impl Default for PermissionManagerConfig {
    fn default() -> Self {
        Self {
            enable_auto_upgrade: true,
            enable_auto_downgrade: true,
            protection_auto_clear_hours: None,
        }
    }
}

/// Persistence for account permission state and the transition log.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn load_account_state(&self, account_id: &str) -> Result<Option<AccountPermissionState>>;

    async fn save_account_state(&self, state: &AccountPermissionState) -> Result<()>;

    async fn record_transition(&self, transition: &PermissionTransition) -> Result<i64>;
}

/// A level change computed from one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub to: PermissionLevel,
    pub kind: TransitionKind,
    pub reason: String,
}

/// Outcome of [`PermissionManager::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    NoChange {
        level: PermissionLevel,
        reason: String,
    },
    /// A transition was computed; `applied` tells whether it took effect.
    Transition(PermissionTransition),
}

impl Evaluation {
    /// Level in force after the evaluation.
    pub fn level(&self) -> PermissionLevel {
        match self {
            Evaluation::NoChange { level, .. } => *level,
            Evaluation::Transition(t) if t.applied => t.to_level,
            Evaluation::Transition(t) => t.from_level,
        }
    }
}

/// Compute the transition, if any, for an account.
///
/// Precedence: protection auto-clear (L0 only), forced protection on
/// drawdown, adjacent downgrade, adjacent upgrade.
pub fn propose(
    table: &LevelTable,
    state: &AccountPermissionState,
    window: &PerformanceWindow,
    auto_clear_hours: Option<i64>,
    now: DateTime<Utc>,
) -> Option<Proposal> {
    if state.level.is_protection() {
        let hours = auto_clear_hours?;
        if now - state.entered_at >= Duration::hours(hours) {
            return Some(Proposal {
                to: table.default_level(),
                kind: TransitionKind::ProtectionCleared,
                reason: format!("Protection mode auto-cleared after {}h", hours),
            });
        }
        return None;
    }

    let current = table.get(state.level);

    // Forced protection
    if let (Some(limit), Some(dd)) = (current.downgrade.max_drawdown, window.drawdown) {
        if dd > limit {
            return Some(Proposal {
                to: PermissionLevel::L0,
                kind: TransitionKind::ForcedProtection,
                reason: format!(
                    "Drawdown {:.2}% exceeds {:.2}% allowed at {}",
                    dd * 100.0,
                    limit * 100.0,
                    state.level
                ),
            });
        }
    }

    // Adjacent downgrade: any breach
    if let Some(lower) = state.level.down() {
        let mut breaches = Vec::new();

        if let Some(max_losses) = current.downgrade.consecutive_losses {
            if window.consecutive_losses >= max_losses {
                breaches.push(format!(
                    "{} consecutive losses (limit {})",
                    window.consecutive_losses, max_losses
                ));
            }
        }
        if let (Some(floor), Some(wr)) = (current.downgrade.win_rate_7d, window.win_rate_7d) {
            if wr < floor {
                breaches.push(format!(
                    "7d win rate {:.1}% below {:.1}%",
                    wr * 100.0,
                    floor * 100.0
                ));
            }
        }

        if !breaches.is_empty() {
            return Some(Proposal {
                to: lower,
                kind: TransitionKind::Downgrade,
                reason: breaches.join(", "),
            });
        }
    }

    // Adjacent upgrade: every configured threshold met
    let upgrade = &current.upgrade;
    let higher = state.level.up()?;
    if upgrade.is_empty() {
        return None;
    }

    let meets = |threshold: Option<f64>, value: Option<f64>| match threshold {
        None => true,
        Some(t) => matches!(value, Some(v) if v >= t),
    };

    let days = state.days_at_level(now);
    let ok = meets(upgrade.win_rate_7d, window.win_rate_7d)
        && meets(upgrade.win_rate_30d, window.win_rate_30d)
        && meets(upgrade.sharpe_ratio, window.sharpe_ratio)
        && upgrade.min_trades.map_or(true, |n| window.settled_30d >= n)
        && upgrade.min_days.map_or(true, |d| days >= i64::from(d));

    if !ok {
        return None;
    }

    let mut evidence = vec![format!("{} trades in 30d", window.settled_30d)];
    if let Some(wr) = window.win_rate_30d {
        evidence.push(format!("30d win rate {:.1}%", wr * 100.0));
    }
    if let Some(wr) = window.win_rate_7d {
        evidence.push(format!("7d win rate {:.1}%", wr * 100.0));
    }
    if let Some(sharpe) = window.sharpe_ratio {
        evidence.push(format!("sharpe {:.2}", sharpe));
    }
    evidence.push(format!("{} days at {}", days, state.level));

    Some(Proposal {
        to: higher,
        kind: TransitionKind::Upgrade,
        reason: evidence.join(", "),
    })
}

/// Stateful level tracker over a [`PermissionStore`].
pub struct PermissionManager {
    levels: Arc<RwLock<LevelTable>>,
    store: Arc<dyn PermissionStore>,
    history: Arc<dyn TradeHistory>,
    config: PermissionManagerConfig,
}

impl PermissionManager {
    pub fn new(
        levels: Arc<RwLock<LevelTable>>,
        store: Arc<dyn PermissionStore>,
        history: Arc<dyn TradeHistory>,
        config: PermissionManagerConfig,
    ) -> Self {
        Self {
            levels,
            store,
            history,
            config,
        }
    }

    /// Load the account, creating it at the default level on first sight.
    ///
    /// `balance` becomes the drawdown baseline if none is recorded yet.
    pub async fn ensure_account(
        &self,
        account_id: &str,
        balance: Option<Decimal>,
    ) -> Result<AccountPermissionState> {
        let existing = self
            .store
            .load_account_state(account_id)
            .await
            .context("Failed to load account permission state")?;

        let created = existing.is_none();
        let mut state = match existing {
            Some(state) => state,
            None => {
                let level = self.levels.read().await.default_level();
                info!(account = %account_id, level = %level, "New account registered");
                AccountPermissionState::new(account_id, level)
            }
        };

        let needs_baseline = state.initial_balance.is_none() && balance.is_some();
        if needs_baseline {
            state.initial_balance = balance;
        }
        if created || needs_baseline {
            state.updated_at = Utc::now();
            self.store.save_account_state(&state).await?;
        }

        Ok(state)
    }

    /// Limits currently in force for the account.
    pub async fn snapshot(&self, account_id: &str) -> Result<PermissionSnapshot> {
        let state = self.ensure_account(account_id, None).await?;
        Ok(self.levels.read().await.snapshot(account_id, state.level))
    }

    /// Re-evaluate the account's level against its trailing performance.
    pub async fn evaluate(&self, account_id: &str, balance: Decimal) -> Result<Evaluation> {
        self.evaluate_at(account_id, balance, Utc::now()).await
    }

    pub async fn evaluate_at(
        &self,
        account_id: &str,
        balance: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let mut state = self.ensure_account(account_id, Some(balance)).await?;

        let trades = match self
            .history
            .settled_trades_since(account_id, now - Duration::days(30))
            .await
        {
            Ok(trades) => trades,
            Err(e) => {
                warn!(account = %account_id, error = %e, "Performance window unavailable, keeping level");
                return Ok(Evaluation::NoChange {
                    level: state.level,
                    reason: format!("Insufficient data: {}", e),
                });
            }
        };

        let window = PerformanceCalculator::calculate(&trades, state.initial_balance, balance, now);
        debug!(
            account = %account_id,
            level = %state.level,
            settled_30d = window.settled_30d,
            win_rate_7d = ?window.win_rate_7d,
            win_rate_30d = ?window.win_rate_30d,
            sharpe = ?window.sharpe_ratio,
            drawdown = ?window.drawdown,
            "Evaluating permission level"
        );

        let proposal = {
            let table = self.levels.read().await;
            propose(
                &table,
                &state,
                &window,
                self.config.protection_auto_clear_hours,
                now,
            )
        };

        state.consecutive_losses = window.consecutive_losses;

        let Some(proposal) = proposal else {
            state.updated_at = now;
            self.store.save_account_state(&state).await?;
            return Ok(Evaluation::NoChange {
                level: state.level,
                reason: "Thresholds not met".to_string(),
            });
        };

        // The marker fingerprints trade evidence only. Protection entry and
        // exit depend on balance and time, so they bypass it.
        let marker = window.marker();
        let evidence_based = matches!(
            proposal.kind,
            TransitionKind::Upgrade | TransitionKind::Downgrade
        );
        if evidence_based && state.last_marker == Some(marker) {
            state.updated_at = now;
            self.store.save_account_state(&state).await?;
            return Ok(Evaluation::NoChange {
                level: state.level,
                reason: "No new trades since the last transition".to_string(),
            });
        }

        let applied = match proposal.kind {
            TransitionKind::Upgrade => self.config.enable_auto_upgrade,
            TransitionKind::Downgrade | TransitionKind::ForcedProtection => {
                self.config.enable_auto_downgrade
            }
            TransitionKind::ProtectionCleared | TransitionKind::Manual => true,
        };

        let transition = PermissionTransition {
            account_id: account_id.to_string(),
            from_level: state.level,
            to_level: proposal.to,
            kind: proposal.kind,
            reason: proposal.reason,
            applied,
            created_at: now,
        };

        if applied {
            state.last_marker = Some(marker);
            enter_level(&mut state, &transition, now);
        } else {
            state.updated_at = now;
        }

        self.store.save_account_state(&state).await?;
        self.store.record_transition(&transition).await?;
        log_transition(&transition);

        Ok(Evaluation::Transition(transition))
    }

    /// Jump straight to L0. Applies regardless of the auto-transition
    /// switches. Returns `None` when the account is already protected.
    pub async fn force_protection(
        &self,
        account_id: &str,
        reason: &str,
    ) -> Result<Option<PermissionTransition>> {
        let mut state = self.ensure_account(account_id, None).await?;
        if state.level.is_protection() {
            debug!(account = %account_id, "Already in protection mode");
            return Ok(None);
        }

        let now = Utc::now();
        let transition = PermissionTransition {
            account_id: account_id.to_string(),
            from_level: state.level,
            to_level: PermissionLevel::L0,
            kind: TransitionKind::ForcedProtection,
            reason: reason.to_string(),
            applied: true,
            created_at: now,
        };
        enter_level(&mut state, &transition, now);

        self.store.save_account_state(&state).await?;
        self.store.record_transition(&transition).await?;
        log_transition(&transition);

        Ok(Some(transition))
    }

    /// Operator clearance of protection mode back to the default level.
    ///
    /// `rebase_balance` replaces the drawdown baseline, so the drawdown that
    /// caused protection does not immediately re-trigger it.
    pub async fn reset_protection(
        &self,
        account_id: &str,
        operator: &str,
        rebase_balance: Option<Decimal>,
    ) -> Result<PermissionTransition> {
        let mut state = self.ensure_account(account_id, None).await?;
        if !state.level.is_protection() {
            bail!(
                "Account {} is at {}, not in protection mode",
                account_id,
                state.level
            );
        }

        let now = Utc::now();
        let to = self.levels.read().await.default_level();
        let transition = PermissionTransition {
            account_id: account_id.to_string(),
            from_level: state.level,
            to_level: to,
            kind: TransitionKind::ProtectionCleared,
            reason: format!("Protection cleared by {}", operator),
            applied: true,
            created_at: now,
        };
        enter_level(&mut state, &transition, now);
        state.consecutive_losses = 0;
        if let Some(balance) = rebase_balance {
            state.initial_balance = Some(balance);
        }

        self.store.save_account_state(&state).await?;
        self.store.record_transition(&transition).await?;
        log_transition(&transition);

        Ok(transition)
    }

    /// Operator override to any level.
    pub async fn set_level(
        &self,
        account_id: &str,
        level: PermissionLevel,
        operator: &str,
    ) -> Result<PermissionTransition> {
        let mut state = self.ensure_account(account_id, None).await?;

        let now = Utc::now();
        let transition = PermissionTransition {
            account_id: account_id.to_string(),
            from_level: state.level,
            to_level: level,
            kind: TransitionKind::Manual,
            reason: format!("Set by {}", operator),
            applied: true,
            created_at: now,
        };
        enter_level(&mut state, &transition, now);

        self.store.save_account_state(&state).await?;
        self.store.record_transition(&transition).await?;
        log_transition(&transition);

        Ok(transition)
    }
}

fn enter_level(
    state: &mut AccountPermissionState,
    transition: &PermissionTransition,
    now: DateTime<Utc>,
) {
    state.level = transition.to_level;
    state.entered_at = now;
    state.updated_at = now;
    state.protection_reason = if transition.to_level.is_protection() {
        Some(transition.reason.clone())
    } else {
        None
    };
}

fn log_transition(t: &PermissionTransition) {
    match (t.kind, t.applied) {
        (TransitionKind::ForcedProtection, true) => error!(
            account = %t.account_id,
            from = %t.from_level,
            reason = %t.reason,
            "PROTECTION MODE: all trading halted"
        ),
        (_, true) => info!(
            account = %t.account_id,
            from = %t.from_level,
            to = %t.to_level,
            kind = %t.kind,
            reason = %t.reason,
            "Permission level changed"
        ),
        (_, false) => info!(
            account = %t.account_id,
            from = %t.from_level,
            to = %t.to_level,
            kind = %t.kind,
            reason = %t.reason,
            "Permission transition computed but auto transitions are disabled"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settled_trade, FakeHistory, MemoryPermissionStore};
    use rust_decimal_macros::dec;

    fn table() -> LevelTable {
        LevelTable::defaults()
    }

    fn state_at(level: PermissionLevel, days: i64, now: DateTime<Utc>) -> AccountPermissionState {
        let mut state = AccountPermissionState::new("acct", level);
        state.entered_at = now - Duration::days(days);
        state.initial_balance = Some(dec!(10000));
        state
    }

    /// 25 settled trades over the last 20 days, `wins` of them winners.
    fn trades(wins: usize, now: DateTime<Utc>) -> Vec<crate::models::Trade> {
        (0..25)
            .map(|i| {
                let pnl = if i < wins { dec!(10) } else { dec!(-5) };
                // Interleave so the newest trades are not all losses
                let age = Duration::hours(((i * 7) % 25) as i64 * 19 + 200);
                settled_trade(pnl, now - age)
            })
            .collect()
    }

    fn window(trades: &[crate::models::Trade], balance: Decimal, now: DateTime<Utc>) -> PerformanceWindow {
        PerformanceCalculator::calculate(trades, Some(dec!(10000)), balance, now)
    }

    #[test]
    fn test_upgrade_when_all_thresholds_met() {
        // L2 needs wr30 >= 0.60, 20 trades, 7 days; wr7 and sharpe not required
        let now = Utc::now();
        let state = state_at(PermissionLevel::L2, 10, now);
        let w = PerformanceWindow {
            settled_30d: 25,
            win_rate_30d: Some(0.62),
            win_rate_7d: None,
            sharpe_ratio: None,
            ..PerformanceWindow::empty(now)
        };

        let proposal = propose(&table(), &state, &w, None, now).unwrap();
        assert_eq!(proposal.to, PermissionLevel::L3);
        assert_eq!(proposal.kind, TransitionKind::Upgrade);
    }

    #[test]
    fn test_upgrade_blocked_by_any_unmet_threshold() {
        let now = Utc::now();
        let w = PerformanceWindow {
            settled_30d: 25,
            win_rate_30d: Some(0.62),
            ..PerformanceWindow::empty(now)
        };

        // Not enough days at level
        let fresh = state_at(PermissionLevel::L2, 3, now);
        assert_eq!(propose(&table(), &fresh, &w, None, now), None);

        // Missing data counts as not met
        let seasoned = state_at(PermissionLevel::L2, 10, now);
        let no_data = PerformanceWindow {
            settled_30d: 25,
            ..PerformanceWindow::empty(now)
        };
        assert_eq!(propose(&table(), &seasoned, &no_data, None, now), None);
    }

    #[test]
    fn test_no_upgrade_path_from_top_or_protection() {
        let now = Utc::now();
        let w = PerformanceWindow {
            settled_30d: 500,
            win_rate_7d: Some(1.0),
            win_rate_30d: Some(1.0),
            sharpe_ratio: Some(10.0),
            ..PerformanceWindow::empty(now)
        };
        assert_eq!(propose(&table(), &state_at(PermissionLevel::L5, 100, now), &w, None, now), None);
        assert_eq!(propose(&table(), &state_at(PermissionLevel::L0, 100, now), &w, None, now), None);
    }

    #[test]
    fn test_drawdown_forces_protection_from_any_level() {
        let now = Utc::now();
        let state = state_at(PermissionLevel::L3, 30, now);
        let w = PerformanceWindow {
            drawdown: Some(0.16),
            consecutive_losses: 10,
            ..PerformanceWindow::empty(now)
        };

        let proposal = propose(&table(), &state, &w, None, now).unwrap();
        assert_eq!(proposal.to, PermissionLevel::L0);
        assert_eq!(proposal.kind, TransitionKind::ForcedProtection);
    }

    #[test]
    fn test_downgrade_is_adjacent() {
        let now = Utc::now();
        let state = state_at(PermissionLevel::L4, 30, now);
        let w = PerformanceWindow {
            consecutive_losses: 5,
            win_rate_7d: Some(0.9),
            ..PerformanceWindow::empty(now)
        };

        let proposal = propose(&table(), &state, &w, None, now).unwrap();
        assert_eq!(proposal.to, PermissionLevel::L3);
        assert_eq!(proposal.kind, TransitionKind::Downgrade);

        let cold = PerformanceWindow {
            win_rate_7d: Some(0.30),
            ..PerformanceWindow::empty(now)
        };
        let proposal = propose(&table(), &state_at(PermissionLevel::L2, 1, now), &cold, None, now).unwrap();
        assert_eq!(proposal.to, PermissionLevel::L1);
    }

    #[test]
    fn test_auto_clear_after_hours() {
        let now = Utc::now();
        let mut state = state_at(PermissionLevel::L0, 0, now);
        state.entered_at = now - Duration::hours(25);
        let w = PerformanceWindow::empty(now);

        assert_eq!(propose(&table(), &state, &w, None, now), None);
        let proposal = propose(&table(), &state, &w, Some(24), now).unwrap();
        assert_eq!(proposal.to, PermissionLevel::L1);
        assert_eq!(proposal.kind, TransitionKind::ProtectionCleared);
    }

    fn manager(
        store: Arc<MemoryPermissionStore>,
        history: FakeHistory,
        config: PermissionManagerConfig,
    ) -> PermissionManager {
        PermissionManager::new(
            Arc::new(RwLock::new(table())),
            store,
            Arc::new(history),
            config,
        )
    }

    #[tokio::test]
    async fn test_new_account_starts_at_default_with_baseline() {
        let store = Arc::new(MemoryPermissionStore::default());
        let pm = manager(store.clone(), FakeHistory::default(), PermissionManagerConfig::default());

        let state = pm.ensure_account("acct", Some(dec!(5000))).await.unwrap();
        assert_eq!(state.level, PermissionLevel::L1);
        assert_eq!(state.initial_balance, Some(dec!(5000)));

        let snap = pm.snapshot("acct").await.unwrap();
        assert_eq!(snap.max_position_pct, dec!(0.10));
        assert!(store.state("acct").is_some());
    }

    #[tokio::test]
    async fn test_evaluation_upgrades_once_and_is_idempotent() {
        let now = Utc::now();
        let store = Arc::new(MemoryPermissionStore::default());
        store.put(state_at(PermissionLevel::L2, 10, now));

        let history = FakeHistory {
            settled: trades(16, now),
            ..FakeHistory::default()
        };
        let pm = manager(store.clone(), history, PermissionManagerConfig::default());

        let first = pm.evaluate_at("acct", dec!(10000), now).await.unwrap();
        assert!(matches!(
            &first,
            Evaluation::Transition(t) if t.applied && t.to_level == PermissionLevel::L3
        ));

        // Same evidence again: L3 thresholds are not met either, and no
        // second move happens
        let second = pm.evaluate_at("acct", dec!(10000), now).await.unwrap();
        assert_eq!(second.level(), PermissionLevel::L3);
        assert!(matches!(second, Evaluation::NoChange { .. }));
        assert_eq!(store.transitions().len(), 1);
    }

    #[tokio::test]
    async fn test_marker_blocks_repeat_downgrade() {
        let now = Utc::now();
        let store = Arc::new(MemoryPermissionStore::default());
        store.put(state_at(PermissionLevel::L4, 40, now));

        // Five losses in a row breach both L4 (5) and L3 (4)
        let losses: Vec<_> = (1..=5)
            .map(|h| settled_trade(dec!(-10), now - Duration::hours(h)))
            .collect();
        let history = FakeHistory {
            settled: losses,
            ..FakeHistory::default()
        };
        let pm = manager(store.clone(), history, PermissionManagerConfig::default());

        let first = pm.evaluate_at("acct", dec!(10000), now).await.unwrap();
        assert_eq!(first.level(), PermissionLevel::L3);

        let second = pm.evaluate_at("acct", dec!(10000), now).await.unwrap();
        assert_eq!(second.level(), PermissionLevel::L3);
        assert_eq!(store.transitions().len(), 1);
    }

    #[tokio::test]
    async fn test_balance_drop_after_downgrade_forces_protection() {
        let now = Utc::now();
        let store = Arc::new(MemoryPermissionStore::default());
        store.put(state_at(PermissionLevel::L4, 40, now));

        let losses: Vec<_> = (1..=5)
            .map(|h| settled_trade(dec!(-10), now - Duration::hours(h)))
            .collect();
        let history = FakeHistory {
            settled: losses,
            ..FakeHistory::default()
        };
        let pm = manager(store.clone(), history, PermissionManagerConfig::default());

        let first = pm.evaluate_at("acct", dec!(10000), now).await.unwrap();
        assert_eq!(first.level(), PermissionLevel::L3);

        // No new trades, but the balance is now 20% under the baseline
        let second = pm.evaluate_at("acct", dec!(8000), now).await.unwrap();
        assert!(matches!(
            &second,
            Evaluation::Transition(t) if t.applied && t.kind == TransitionKind::ForcedProtection
        ));
        assert_eq!(second.level(), PermissionLevel::L0);
        assert_eq!(store.transitions().len(), 2);

        // Protection is terminal for evaluation without auto-clear
        let third = pm.evaluate_at("acct", dec!(8000), now).await.unwrap();
        assert!(matches!(third, Evaluation::NoChange { level: PermissionLevel::L0, .. }));
        assert_eq!(store.transitions().len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_transition_applies_once_enabled() {
        let now = Utc::now();
        let store = Arc::new(MemoryPermissionStore::default());
        store.put(state_at(PermissionLevel::L2, 10, now));

        let history = FakeHistory {
            settled: trades(16, now),
            ..FakeHistory::default()
        };
        let dry = manager(
            store.clone(),
            history.clone(),
            PermissionManagerConfig {
                enable_auto_upgrade: false,
                ..PermissionManagerConfig::default()
            },
        );
        let observed = dry.evaluate_at("acct", dec!(10000), now).await.unwrap();
        assert!(matches!(&observed, Evaluation::Transition(t) if !t.applied));
        assert_eq!(store.state("acct").unwrap().last_marker, None);

        // Same evidence, switch turned on
        let live = manager(store.clone(), history, PermissionManagerConfig::default());
        let applied = live.evaluate_at("acct", dec!(10000), now).await.unwrap();
        assert!(matches!(
            &applied,
            Evaluation::Transition(t) if t.applied && t.to_level == PermissionLevel::L3
        ));
        assert_eq!(store.state("acct").unwrap().level, PermissionLevel::L3);

        let logged = store.transitions();
        assert_eq!(logged.len(), 2);
        assert!(!logged[0].applied && logged[1].applied);
    }

    #[tokio::test]
    async fn test_dry_run_logs_without_applying() {
        let now = Utc::now();
        let store = Arc::new(MemoryPermissionStore::default());
        store.put(state_at(PermissionLevel::L2, 10, now));

        let history = FakeHistory {
            settled: trades(16, now),
            ..FakeHistory::default()
        };
        let config = PermissionManagerConfig {
            enable_auto_upgrade: false,
            ..PermissionManagerConfig::default()
        };
        let pm = manager(store.clone(), history, config);

        let result = pm.evaluate_at("acct", dec!(10000), now).await.unwrap();
        assert!(matches!(&result, Evaluation::Transition(t) if !t.applied));
        assert_eq!(result.level(), PermissionLevel::L2);
        assert_eq!(store.state("acct").unwrap().level, PermissionLevel::L2);

        let logged = store.transitions();
        assert_eq!(logged.len(), 1);
        assert!(!logged[0].applied);
    }

    #[tokio::test]
    async fn test_history_failure_keeps_level() {
        let now = Utc::now();
        let store = Arc::new(MemoryPermissionStore::default());
        store.put(state_at(PermissionLevel::L3, 30, now));
        let pm = manager(store.clone(), FakeHistory::failing(), PermissionManagerConfig::default());

        // Drawdown of 20% would force protection if data were available
        let result = pm.evaluate_at("acct", dec!(8000), now).await.unwrap();
        assert!(matches!(
            &result,
            Evaluation::NoChange { level: PermissionLevel::L3, reason } if reason.starts_with("Insufficient data")
        ));
        assert!(store.transitions().is_empty());
    }

    #[tokio::test]
    async fn test_drawdown_evaluation_forces_protection() {
        let now = Utc::now();
        let store = Arc::new(MemoryPermissionStore::default());
        store.put(state_at(PermissionLevel::L3, 30, now));
        let history = FakeHistory {
            settled: vec![settled_trade(dec!(-1600), now - Duration::hours(1))],
            ..FakeHistory::default()
        };
        let pm = manager(store.clone(), history, PermissionManagerConfig::default());

        let result = pm.evaluate_at("acct", dec!(8400), now).await.unwrap();
        assert_eq!(result.level(), PermissionLevel::L0);

        let snap = pm.snapshot("acct").await.unwrap();
        assert!(snap.trading_disabled());
        assert!(store.state("acct").unwrap().protection_reason.is_some());
    }

    #[tokio::test]
    async fn test_force_and_reset_protection() {
        let store = Arc::new(MemoryPermissionStore::default());
        let config = PermissionManagerConfig {
            enable_auto_downgrade: false,
            ..PermissionManagerConfig::default()
        };
        let pm = manager(store.clone(), FakeHistory::default(), config);
        pm.ensure_account("acct", Some(dec!(10000))).await.unwrap();

        tokio_test::assert_err!(pm.reset_protection("acct", "ops", None).await);

        let forced = pm
            .force_protection("acct", "Forced liquidation of BTC")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forced.to_level, PermissionLevel::L0);
        assert!(forced.applied);
        assert!(pm.force_protection("acct", "again").await.unwrap().is_none());

        let cleared = pm
            .reset_protection("acct", "ops", Some(dec!(8000)))
            .await
            .unwrap();
        assert_eq!(cleared.to_level, PermissionLevel::L1);
        let state = store.state("acct").unwrap();
        assert_eq!(state.initial_balance, Some(dec!(8000)));
        assert_eq!(state.protection_reason, None);

        let manual = pm.set_level("acct", PermissionLevel::L4, "ops").await.unwrap();
        assert_eq!(manual.kind, TransitionKind::Manual);
        assert_eq!(pm.snapshot("acct").await.unwrap().level, PermissionLevel::L4);
        assert_eq!(store.transitions().len(), 3);
    }

    #[test]
    fn test_window_helper_matches_fixture() {
        let now = Utc::now();
        let w = window(&trades(16, now), dec!(10000), now);
        assert_eq!(w.settled_30d, 25);
        assert!((w.win_rate_30d.unwrap() - 0.64).abs() < 1e-9);
    }
}
