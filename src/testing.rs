//! In-memory fakes for the trait seams, shared by unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::api::{DecisionSource, MarketContext};
use crate::debate::{
    CounterStore, DebateContext, DebateOutcome, DebateReviewer, DebateSettingsStore,
    InMemoryCounterStore,
};
use crate::exchange::{ExchangeAdapter, ExchangeError, Fill, OrderRequest, Position};
use crate::models::{
    AccountPermissionState, Decision, NewRiskEvent, PermissionTransition, Trade, TradeSide,
};
use crate::permission::PermissionStore;
use crate::risk::{RiskEventSink, TradeHistory};

/// A settled trade with the given P&L.
pub fn settled_trade(pnl: Decimal, at: DateTime<Utc>) -> Trade {
    Trade {
        id: uuid::Uuid::new_v4().to_string(),
        account_id: "acct".to_string(),
        order_id: uuid::Uuid::new_v4().to_string(),
        symbol: "BTC".to_string(),
        side: TradeSide::Sell,
        size: dec!(1),
        price: dec!(100),
        realized_pnl: Some(pnl),
        confidence: dec!(0.8),
        reasoning: String::new(),
        executed_at: at,
    }
}

/// `n` losing trades, newest first.
pub fn losing_trades(n: usize) -> Vec<Trade> {
    let now = Utc::now();
    (0..n)
        .map(|i| settled_trade(dec!(-10), now - chrono::Duration::minutes(i as i64 + 1)))
        .collect()
}

/// Canned trade history.
#[derive(Debug, Clone, Default)]
pub struct FakeHistory {
    pub realized_pnl_today: Decimal,
    /// Returned by `recent_settled_trades`, newest first
    pub recent: Vec<Trade>,
    /// Filtered by `settled_trades_since`
    pub settled: Vec<Trade>,
    pub trades_today: u32,
    pub initial_balance: Option<Decimal>,
    pub fail: bool,
}

impl FakeHistory {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn check(&self) -> Result<()> {
        if self.fail {
            bail!("history store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl TradeHistory for FakeHistory {
    async fn realized_pnl_since(&self, _account_id: &str, _since: DateTime<Utc>) -> Result<Decimal> {
        self.check()?;
        Ok(self.realized_pnl_today)
    }

    async fn recent_settled_trades(&self, _account_id: &str, limit: usize) -> Result<Vec<Trade>> {
        self.check()?;
        Ok(self.recent.iter().take(limit).cloned().collect())
    }

    async fn settled_trades_since(
        &self,
        _account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Trade>> {
        self.check()?;
        let mut trades: Vec<Trade> = self
            .settled
            .iter()
            .filter(|t| t.is_settled() && t.executed_at >= since)
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        Ok(trades)
    }

    async fn trade_count_since(&self, _account_id: &str, _since: DateTime<Utc>) -> Result<u32> {
        self.check()?;
        Ok(self.trades_today)
    }

    async fn initial_balance(&self, _account_id: &str) -> Result<Option<Decimal>> {
        self.check()?;
        Ok(self.initial_balance)
    }
}

/// Keeps every risk event it is given.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<NewRiskEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<NewRiskEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RiskEventSink for RecordingSink {
    async fn record_risk_event(&self, event: &NewRiskEvent) -> Result<i64> {
        let mut events = self.events.lock().map_err(|_| anyhow!("poisoned"))?;
        events.push(event.clone());
        Ok(events.len() as i64)
    }
}

#[derive(Debug, Default)]
pub struct MemoryPermissionStore {
    accounts: Mutex<HashMap<String, AccountPermissionState>>,
    transitions: Mutex<Vec<PermissionTransition>>,
}

impl MemoryPermissionStore {
    pub fn put(&self, state: AccountPermissionState) {
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts.insert(state.account_id.clone(), state);
        }
    }

    pub fn state(&self, account_id: &str) -> Option<AccountPermissionState> {
        self.accounts.lock().ok()?.get(account_id).cloned()
    }

    pub fn transitions(&self) -> Vec<PermissionTransition> {
        self.transitions.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PermissionStore for MemoryPermissionStore {
    async fn load_account_state(&self, account_id: &str) -> Result<Option<AccountPermissionState>> {
        Ok(self.state(account_id))
    }

    async fn save_account_state(&self, state: &AccountPermissionState) -> Result<()> {
        self.put(state.clone());
        Ok(())
    }

    async fn record_transition(&self, transition: &PermissionTransition) -> Result<i64> {
        let mut log = self.transitions.lock().map_err(|_| anyhow!("poisoned"))?;
        log.push(transition.clone());
        Ok(log.len() as i64)
    }
}

/// Debate settings rows kept in memory. Empty means all defaults.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    rows: Mutex<BTreeMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn get(&self, key: &str) -> Option<String> {
        self.rows.lock().ok()?.get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: &str) {
        if let Ok(mut rows) = self.rows.lock() {
            rows.insert(key.to_string(), value.to_string());
        }
    }
}

#[async_trait]
impl DebateSettingsStore for MemorySettingsStore {
    async fn load_debate_settings(&self) -> Result<Vec<(String, String)>> {
        let rows = self.rows.lock().map_err(|_| anyhow!("poisoned"))?;
        Ok(rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn save_debate_setting(&self, key: &str, value: &str) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }
}

/// Counter store that errors until `recover` is called.
pub struct FailingCounterStore {
    failing: AtomicBool,
    inner: InMemoryCounterStore,
}

impl Default for FailingCounterStore {
    fn default() -> Self {
        Self {
            failing: AtomicBool::new(true),
            inner: InMemoryCounterStore::new(),
        }
    }
}

impl FailingCounterStore {
    pub fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("counter store connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn get(&self, key: &str) -> Result<u64> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn increment(&self, keys: &[(&str, Duration)]) -> Result<Vec<u64>> {
        self.check()?;
        self.inner.increment(keys).await
    }

    async fn delete(&self, keys: &[&str]) -> Result<()> {
        self.check()?;
        self.inner.delete(keys).await
    }
}

enum Script {
    Agree,
    Revise(Decision),
    Fail,
    Slow(Duration),
}

/// Debate reviewer with a fixed behaviour.
pub struct ScriptedReviewer {
    script: Script,
}

impl ScriptedReviewer {
    pub fn agree() -> Self {
        Self { script: Script::Agree }
    }

    pub fn revise(decision: Decision) -> Self {
        Self {
            script: Script::Revise(decision),
        }
    }

    pub fn failing() -> Self {
        Self { script: Script::Fail }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            script: Script::Slow(delay),
        }
    }
}

#[async_trait]
impl DebateReviewer for ScriptedReviewer {
    async fn review(&self, decision: &Decision, _context: &DebateContext) -> Result<DebateOutcome> {
        let decision = match &self.script {
            Script::Agree => decision.clone(),
            Script::Revise(revised) => revised.clone(),
            Script::Fail => bail!("reviewer model returned 503"),
            Script::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                decision.clone()
            }
        };
        Ok(DebateOutcome {
            decision,
            summary: "scripted".to_string(),
        })
    }
}

/// Decision source that always answers the same way.
pub struct ScriptedSource {
    decision: Option<Decision>,
}

impl ScriptedSource {
    pub fn new(decision: Decision) -> Self {
        Self {
            decision: Some(decision),
        }
    }

    pub fn failing() -> Self {
        Self { decision: None }
    }
}

#[async_trait]
impl DecisionSource for ScriptedSource {
    async fn decide(&self, _context: &MarketContext) -> Result<Decision> {
        self.decision
            .clone()
            .ok_or_else(|| anyhow!("decision endpoint timed out"))
    }
}

/// Exchange that rejects every call as unavailable.
pub struct DownExchange;

#[async_trait]
impl ExchangeAdapter for DownExchange {
    async fn get_account_balance(&self) -> Result<Decimal, ExchangeError> {
        Err(ExchangeError::Rejected("exchange unavailable".to_string()))
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Err(ExchangeError::Rejected("exchange unavailable".to_string()))
    }

    async fn get_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
        Err(ExchangeError::Rejected("exchange unavailable".to_string()))
    }

    async fn place_order(&self, _order: &OrderRequest) -> Result<Fill, ExchangeError> {
        Err(ExchangeError::Rejected("exchange unavailable".to_string()))
    }

    async fn close_all_positions(&self) -> Result<Vec<Fill>, ExchangeError> {
        Err(ExchangeError::Rejected("exchange unavailable".to_string()))
    }
}
