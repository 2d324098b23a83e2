//! Trading orchestration: the shared application state and the cycle that
//! takes one decision from the model to the exchange.
//!
//! Handles:
//! - Fetching account and market state from the exchange
//! - Validating decisions and applying the rejection's action
//! - Debate escalation with re-validation of revised decisions
//! - Execution and post-trade permission evaluation
//! - Liquidation polling and config reloads

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{DecisionSource, MarketContext};
use crate::config::{AppConfig, CounterBackend};
use crate::db::Database;
use crate::debate::{
    CounterStore, DebateConfigManager, DebateContext, DebateCoordinator, DebateRateLimiter,
    DebateReviewer, DebateSettingsStore, InMemoryCounterStore,
};
use crate::exchange::ExchangeAdapter;
use crate::executor::{ExecutionResult, TradeExecutor};
use crate::models::{Decision, PermissionSnapshot, RiskAction};
use crate::permission::{Evaluation, LevelTable, PermissionManager, PermissionStore};
use crate::reload::{ReloadBus, ReloadSignal};
use crate::risk::{
    next_local_midnight, AccountSnapshot, Rejection, RiskEventSink, RiskManager, RiskVerdict,
    TradeHistory,
};

/// What one trading cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The cycle did not run
    Skipped(String),
    /// Nothing to execute
    Held(String),
    Rejected(Rejection),
    Executed(ExecutionResult),
}

/// Everything a trading cycle needs, with lifecycle tied to the process.
pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub bus: ReloadBus,
    pub levels: Arc<RwLock<LevelTable>>,
    pub risk: RiskManager,
    pub permissions: PermissionManager,
    pub debate_config: Arc<DebateConfigManager>,
    pub debate: DebateCoordinator,
    pub executor: TradeExecutor,
    exchange: Arc<dyn ExchangeAdapter>,
    decisions: Arc<dyn DecisionSource>,

    // Runtime state
    trading_enabled: AtomicBool,
    paused_until: RwLock<Option<DateTime<Utc>>>,
    review_flags: Mutex<HashSet<String>>,
    cycle_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppState {
    /// Wire every component over one database and one exchange.
    pub async fn new(
        config: AppConfig,
        db: Arc<Database>,
        exchange: Arc<dyn ExchangeAdapter>,
        decisions: Arc<dyn DecisionSource>,
        reviewer: Arc<dyn DebateReviewer>,
        bus: ReloadBus,
    ) -> Result<Self> {
        let table = db.load_level_table().await?;
        let levels = Arc::new(RwLock::new(table));

        let history: Arc<dyn TradeHistory> = db.clone();
        let sink: Arc<dyn RiskEventSink> = db.clone();
        let store: Arc<dyn PermissionStore> = db.clone();
        let settings: Arc<dyn DebateSettingsStore> = db.clone();
        let counters: Arc<dyn CounterStore> = match config.debate_counter_backend {
            CounterBackend::Sqlite => db.clone(),
            CounterBackend::Memory => Arc::new(InMemoryCounterStore::new()),
        };

        let risk = RiskManager::new(config.risk.clone(), history.clone(), sink);
        let permissions = PermissionManager::new(
            levels.clone(),
            store,
            history,
            config.permission.clone(),
        );

        let debate_config = Arc::new(
            DebateConfigManager::load(settings, Some(bus.clone()))
                .await
                .context("Invalid debate configuration")?,
        );
        let limiter = Arc::new(DebateRateLimiter::new(
            counters,
            debate_config.clone(),
            config.debate_fail_policy,
            config.debate_fail_open_max_streak,
        ));
        let debate = DebateCoordinator::new(debate_config.clone(), limiter, reviewer);
        let executor = TradeExecutor::new(config.account_id.clone(), db.clone(), exchange.clone());

        Ok(Self {
            config,
            db,
            bus,
            levels,
            risk,
            permissions,
            debate_config,
            debate,
            executor,
            exchange,
            decisions,
            trading_enabled: AtomicBool::new(true),
            paused_until: RwLock::new(None),
            review_flags: Mutex::new(HashSet::new()),
            cycle_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn trading_enabled(&self) -> bool {
        self.trading_enabled.load(Ordering::SeqCst)
    }

    pub fn set_trading_enabled(&self, enabled: bool) {
        self.trading_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "Trading switch changed");
    }

    /// Flip the trading switch and return the new state.
    pub fn toggle_trading(&self) -> bool {
        let enabled = !self.trading_enabled.fetch_xor(true, Ordering::SeqCst);
        info!(enabled, "Trading switch toggled");
        enabled
    }

    pub async fn paused_until(&self) -> Option<DateTime<Utc>> {
        *self.paused_until.read().await
    }

    pub async fn flagged_for_review(&self, account_id: &str) -> bool {
        self.review_flags.lock().await.contains(account_id)
    }

    /// Claim the cycle slot for an account. `None` when a cycle is already
    /// in flight.
    pub async fn try_begin_cycle(&self, account_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.cycle_locks.lock().await;
            locks
                .entry(account_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned().ok()
    }

    /// One trading cycle for the configured account and symbol.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let account_id = self.config.account_id.clone();
        let Some(_guard) = self.try_begin_cycle(&account_id).await else {
            debug!(account = %account_id, "Cycle already in flight, skipping");
            return Ok(CycleOutcome::Skipped("Cycle already in flight".to_string()));
        };

        if !self.trading_enabled() {
            return Ok(CycleOutcome::Skipped("Trading disabled".to_string()));
        }
        if let Some(until) = self.paused_until().await {
            if Utc::now() < until {
                return Ok(CycleOutcome::Skipped(format!("Trading paused until {}", until)));
            }
            *self.paused_until.write().await = None;
            info!(account = %account_id, "Trading pause expired");
        }

        let symbol = self.config.symbol.as_str();

        // 1. Account and market state
        let (balance, positions, price) = tokio::try_join!(
            self.exchange.get_account_balance(),
            self.exchange.get_positions(),
            self.exchange.get_price(symbol),
        )
        .context("Failed to fetch exchange state")?;

        let position_size: Decimal = positions
            .iter()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.size)
            .sum();

        self.permissions
            .ensure_account(&account_id, Some(balance))
            .await?;
        let permission = self.permissions.snapshot(&account_id).await?;
        if permission.trading_disabled() {
            debug!(account = %account_id, "Protection mode, no decision requested");
            return Ok(CycleOutcome::Skipped(format!(
                "Protection mode at {}",
                permission.level
            )));
        }

        // 2. Decision
        let context = MarketContext {
            account_id: account_id.clone(),
            symbol: symbol.to_string(),
            current_price: price,
            balance,
            position_size,
            permission: permission.clone(),
        };
        let decision = match self.decisions.decide(&context).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(account = %account_id, error = %e, "Decision source failed, holding");
                return Ok(CycleOutcome::Held(format!("Decision unavailable: {}", e)));
            }
        };
        if !decision.is_actionable() {
            info!(account = %account_id, reasoning = %decision.reasoning, "HOLD");
            return Ok(CycleOutcome::Held(decision.reasoning));
        }

        // 3. Validation
        let account = AccountSnapshot {
            balance,
            current_price: price,
            position_size,
        };
        if let Some(rejection) = self.validate(&decision, &permission, &account).await? {
            return Ok(CycleOutcome::Rejected(rejection));
        }

        // 4. Debate gate
        let debate_context = DebateContext {
            account_id: account_id.clone(),
            symbol: symbol.to_string(),
            current_price: price,
            balance,
            level: permission.level,
        };
        let resolution = self.debate.escalate(decision, &debate_context).await;
        let revised = resolution.is_revised();
        let decision = resolution.into_decision();

        if revised {
            if !decision.is_actionable() {
                info!(account = %account_id, "Debate turned the decision into HOLD");
                return Ok(CycleOutcome::Held(decision.reasoning));
            }
            if let Some(rejection) = self.validate(&decision, &permission, &account).await? {
                return Ok(CycleOutcome::Rejected(rejection));
            }
        }

        // 5. Execution
        let result = self
            .executor
            .execute_decision(&decision, symbol, price)
            .await?;

        // 6. Post-trade evaluation
        if result.success {
            if let Err(e) = self.evaluate_permissions().await {
                warn!(account = %account_id, error = %e, "Post-trade permission evaluation failed");
            }
        }

        Ok(CycleOutcome::Executed(result))
    }

    /// Validate and, on rejection, apply the rejection's action.
    async fn validate(
        &self,
        decision: &Decision,
        permission: &PermissionSnapshot,
        account: &AccountSnapshot,
    ) -> Result<Option<Rejection>> {
        match self.risk.validate_decision(decision, permission, account).await {
            RiskVerdict::Accepted => Ok(None),
            RiskVerdict::Rejected(rejection) => {
                self.apply_rejection(&permission.account_id, &rejection).await?;
                Ok(Some(rejection))
            }
        }
    }

    async fn apply_rejection(&self, account_id: &str, rejection: &Rejection) -> Result<()> {
        match rejection.action() {
            RiskAction::RejectOrder => {}
            RiskAction::PauseTrading => {
                let until = next_local_midnight(Local::now());
                *self.paused_until.write().await = Some(until);
                warn!(account = %account_id, until = %until, "Trading paused for the day");
            }
            RiskAction::CloseAllPositions => {
                self.permissions
                    .force_protection(account_id, &rejection.reason)
                    .await?;
                let closed = self.executor.close_all_positions(&rejection.reason).await?;
                error!(account = %account_id, closed = closed.len(), "All positions closed");
            }
            RiskAction::ManualReview => {
                self.review_flags.lock().await.insert(account_id.to_string());
                warn!(account = %account_id, reason = %rejection.reason, "Account flagged for manual review");
            }
        }
        Ok(())
    }

    /// Re-evaluate the configured account against the current balance.
    pub async fn evaluate_permissions(&self) -> Result<Evaluation> {
        let balance = self
            .exchange
            .get_account_balance()
            .await
            .context("Failed to fetch balance")?;
        self.permissions
            .evaluate(&self.config.account_id, balance)
            .await
    }

    /// Force protection for every liquidation the exchange reports.
    pub async fn poll_liquidations(&self) -> Result<usize> {
        let events = self
            .exchange
            .poll_liquidations()
            .await
            .context("Failed to poll liquidations")?;

        for event in &events {
            let reason = format!(
                "Forced liquidation of {} {} @ {}",
                event.size, event.symbol, event.price
            );
            error!(account = %self.config.account_id, symbol = %event.symbol, "Liquidation detected");
            self.permissions
                .force_protection(&self.config.account_id, &reason)
                .await?;
        }

        Ok(events.len())
    }

    /// Reload one config from the database. A failed reload keeps the
    /// config already in force.
    pub async fn reload(&self, signal: ReloadSignal) {
        match signal {
            ReloadSignal::Levels => match self.db.load_level_table().await {
                Ok(table) => {
                    *self.levels.write().await = table;
                    info!("Permission level table reloaded");
                }
                Err(e) => {
                    error!(error = %e, "Level table reload failed, keeping previous table");
                }
            },
            ReloadSignal::Debate => {
                // Errors are logged by the manager
                let _ = self.debate_config.reload().await;
            }
        }
    }
}

/// Main loop: trading cycles, periodic evaluation and config reloads until
/// Ctrl-C.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    info!(
        account = %state.config.account_id,
        symbol = %state.config.symbol,
        interval_secs = state.config.trading_interval_secs,
        "Starting trading loop"
    );
    match state.debate.limiter().usage().await {
        Ok(usage) => info!(
            daily = usage.daily_count,
            daily_limit = usage.daily_limit,
            hourly = usage.hourly_count,
            hourly_limit = usage.hourly_limit,
            backend = %state.config.debate_counter_backend,
            "Debate budget"
        ),
        Err(e) => warn!(error = %e, "Debate counters unreadable"),
    }

    let mut trading = interval(Duration::from_secs(state.config.trading_interval_secs));
    trading.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut evaluation = interval(Duration::from_secs(state.config.permission_eval_interval_secs));
    evaluation.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut reloads = state.bus.subscribe();
    #[cfg(unix)]
    spawn_hangup_listener(state.bus.clone());
    #[cfg(unix)]
    spawn_switch_listener(state.clone());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = trading.tick() => {
                match state.run_cycle().await {
                    Ok(outcome) => debug!(?outcome, "Cycle complete"),
                    Err(e) => error!(error = %e, "Error in trading cycle"),
                }
                if let Err(e) = state.poll_liquidations().await {
                    warn!(error = %e, "Liquidation poll failed");
                }
            }
            _ = evaluation.tick() => {
                if let Err(e) = state.evaluate_permissions().await {
                    warn!(error = %e, "Periodic permission evaluation failed");
                }
                match state.db.purge_expired_counters().await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "Expired debate counters purged"),
                    Err(e) => warn!(error = %e, "Counter purge failed"),
                }
            }
            received = reloads.recv() => match received {
                Ok(signal) => state.reload(signal).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Reload signals dropped, reloading everything");
                    state.reload(ReloadSignal::Levels).await;
                    state.reload(ReloadSignal::Debate).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("Reload bus closed");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Trading loop stopped");
    Ok(())
}

/// Republish SIGHUP as reload signals so out-of-process config writes are
/// picked up.
#[cfg(unix)]
fn spawn_hangup_listener(bus: ReloadBus) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "SIGHUP listener unavailable");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading config");
            bus.publish(ReloadSignal::Levels);
            bus.publish(ReloadSignal::Debate);
        }
    });
}

/// Flip the trading switch on SIGUSR1.
#[cfg(unix)]
fn spawn_switch_listener(state: Arc<AppState>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut toggle = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "SIGUSR1 listener unavailable");
                return;
            }
        };
        while toggle.recv().await.is_some() {
            state.toggle_trading();
        }
    });
}
