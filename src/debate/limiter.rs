//! Debate rate limiting: daily and hourly budgets on TTL-expiring counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::FailPolicy;

use super::DebateConfigManager;

const DAILY_TTL: Duration = Duration::from_secs(86_400);
const HOURLY_TTL: Duration = Duration::from_secs(3_600);

/// Shared counters with per-key expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value, 0 when absent or expired.
    async fn get(&self, key: &str) -> Result<u64>;

    /// Increment every key by one and (re)set its TTL, as one atomic
    /// operation. Returns the new values in input order.
    async fn increment(&self, keys: &[(&str, Duration)]) -> Result<Vec<u64>>;

    async fn delete(&self, keys: &[&str]) -> Result<()>;
}

/// Process-local [`CounterStore`].
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> Result<u64> {
        let mut counters = self.counters.lock().await;
        match counters.get(key) {
            Some((count, expires)) if *expires > Instant::now() => Ok(*count),
            Some(_) => {
                counters.remove(key);
                Ok(0)
            }
            None => Ok(0),
        }
    }

    async fn increment(&self, keys: &[(&str, Duration)]) -> Result<Vec<u64>> {
        let mut counters = self.counters.lock().await;
        let now = Instant::now();

        let mut values = Vec::with_capacity(keys.len());
        for (key, ttl) in keys {
            let entry = counters.entry(key.to_string()).or_insert((0, now));
            if entry.1 <= now {
                entry.0 = 0;
            }
            entry.0 += 1;
            entry.1 = now + *ttl;
            values.push(entry.0);
        }

        Ok(values)
    }

    async fn delete(&self, keys: &[&str]) -> Result<()> {
        let mut counters = self.counters.lock().await;
        for key in keys {
            counters.remove(*key);
        }
        Ok(())
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimit {
    Allowed,
    Denied(String),
}

impl RateLimit {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimit::Allowed)
    }

    /// `(allowed, reason)` form.
    pub fn into_tuple(self) -> (bool, Option<String>) {
        match self {
            RateLimit::Allowed => (true, None),
            RateLimit::Denied(reason) => (false, Some(reason)),
        }
    }
}

/// Current counter values against their limits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebateUsage {
    pub daily_count: u64,
    pub daily_limit: u64,
    pub hourly_count: u64,
    pub hourly_limit: u64,
}

pub fn daily_key(now: DateTime<Local>) -> String {
    format!("debate:daily:{}", now.format("%Y-%m-%d"))
}

pub fn hourly_key(now: DateTime<Local>) -> String {
    format!("debate:hourly:{}", now.format("%Y-%m-%d-%H"))
}

/// Enforces the daily and hourly debate budgets.
///
/// Storage errors follow the configured [`FailPolicy`]. Under `Open`, a
/// streak of more than `max_failure_streak` consecutive errors denies
/// debates until a read succeeds again.
pub struct DebateRateLimiter {
    store: Arc<dyn CounterStore>,
    config: Arc<DebateConfigManager>,
    policy: FailPolicy,
    max_failure_streak: u32,
    failure_streak: AtomicU32,
}

impl DebateRateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        config: Arc<DebateConfigManager>,
        policy: FailPolicy,
        max_failure_streak: u32,
    ) -> Self {
        Self {
            store,
            config,
            policy,
            max_failure_streak,
            failure_streak: AtomicU32::new(0),
        }
    }

    pub async fn check_rate_limit(&self) -> RateLimit {
        self.check_rate_limit_at(Local::now()).await
    }

    pub async fn check_rate_limit_at(&self, now: DateTime<Local>) -> RateLimit {
        let config = self.config.current().await;

        let counts = match self.read_counts(now).await {
            Ok(counts) => {
                self.failure_streak.store(0, Ordering::Relaxed);
                counts
            }
            Err(e) => return self.storage_failure(e),
        };
        let (daily, hourly) = counts;

        if daily >= config.daily_limit {
            return RateLimit::Denied(format!(
                "Debate daily limit reached ({}/{})",
                daily, config.daily_limit
            ));
        }
        if hourly >= config.hourly_limit {
            return RateLimit::Denied(format!(
                "Debate hourly limit reached ({}/{})",
                hourly, config.hourly_limit
            ));
        }

        debug!(daily, hourly, "Debate rate limit ok");
        RateLimit::Allowed
    }

    /// Record one triggered debate against both budgets.
    pub async fn increment_count(&self) -> Result<(u64, u64)> {
        self.increment_count_at(Local::now()).await
    }

    pub async fn increment_count_at(&self, now: DateTime<Local>) -> Result<(u64, u64)> {
        let daily = daily_key(now);
        let hourly = hourly_key(now);
        let values = self
            .store
            .increment(&[(daily.as_str(), DAILY_TTL), (hourly.as_str(), HOURLY_TTL)])
            .await?;

        let (d, h) = match values.as_slice() {
            [d, h] => (*d, *h),
            other => anyhow::bail!("Counter store returned {} values, expected 2", other.len()),
        };
        debug!(daily = d, hourly = h, "Debate counted");
        Ok((d, h))
    }

    pub async fn usage(&self) -> Result<DebateUsage> {
        self.usage_at(Local::now()).await
    }

    pub async fn usage_at(&self, now: DateTime<Local>) -> Result<DebateUsage> {
        let config = self.config.current().await;
        let (daily_count, hourly_count) = self.read_counts(now).await?;
        Ok(DebateUsage {
            daily_count,
            daily_limit: config.daily_limit,
            hourly_count,
            hourly_limit: config.hourly_limit,
        })
    }

    /// Drop the current day and hour counters.
    pub async fn reset(&self) -> Result<()> {
        self.reset_at(Local::now()).await
    }

    pub async fn reset_at(&self, now: DateTime<Local>) -> Result<()> {
        let daily = daily_key(now);
        let hourly = hourly_key(now);
        self.store.delete(&[daily.as_str(), hourly.as_str()]).await?;
        warn!(daily = %daily, hourly = %hourly, "Debate counters reset");
        Ok(())
    }

    async fn read_counts(&self, now: DateTime<Local>) -> Result<(u64, u64)> {
        let daily = self.store.get(&daily_key(now)).await?;
        let hourly = self.store.get(&hourly_key(now)).await?;
        Ok((daily, hourly))
    }

    fn storage_failure(&self, e: anyhow::Error) -> RateLimit {
        match self.policy {
            FailPolicy::Closed => {
                error!(error = %e, "Debate counters unavailable, denying debate");
                RateLimit::Denied(format!("Debate rate limit storage unavailable: {}", e))
            }
            FailPolicy::Open => {
                let streak = self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
                if streak > self.max_failure_streak {
                    error!(streak, error = %e, "Debate counters still unavailable, circuit open");
                    RateLimit::Denied(format!(
                        "Debate rate limit storage unavailable for {} consecutive checks",
                        streak
                    ))
                } else {
                    warn!(streak, error = %e, "Debate counters unavailable, allowing debate");
                    RateLimit::Allowed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debate::DebateConfig;
    use crate::testing::{FailingCounterStore, MemorySettingsStore};
    use chrono::TimeZone;

    fn limiter_with(
        store: Arc<dyn CounterStore>,
        config: DebateConfig,
        policy: FailPolicy,
        streak: u32,
    ) -> DebateRateLimiter {
        let settings = Arc::new(MemorySettingsStore::default());
        let manager = Arc::new(DebateConfigManager::fixed(settings, config));
        DebateRateLimiter::new(store, manager, policy, streak)
    }

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 14, hour, minute, 0)
            .earliest()
            .unwrap()
    }

    #[test]
    fn test_counter_keys() {
        let now = at(9, 30);
        assert_eq!(daily_key(now), "debate:daily:2024-03-14");
        assert_eq!(hourly_key(now), "debate:hourly:2024-03-14-09");
    }

    #[tokio::test]
    async fn test_daily_limit_reached_after_exact_count() {
        let config = DebateConfig {
            daily_limit: 100,
            hourly_limit: 1000,
            ..DebateConfig::default()
        };
        let limiter = limiter_with(Arc::new(InMemoryCounterStore::new()), config, FailPolicy::Open, 5);
        let now = at(12, 0);

        for _ in 0..99 {
            limiter.increment_count_at(now).await.unwrap();
        }
        assert!(limiter.check_rate_limit_at(now).await.is_allowed());

        // 99/100 -> one more debate -> 100/100
        assert_eq!(limiter.increment_count_at(now).await.unwrap(), (100, 100));

        let (allowed, reason) = limiter.check_rate_limit_at(now).await.into_tuple();
        assert!(!allowed);
        assert!(reason.unwrap().contains("daily limit"));
    }

    #[tokio::test]
    async fn test_hourly_limit_and_daily_priority() {
        let config = DebateConfig {
            daily_limit: 3,
            hourly_limit: 2,
            ..DebateConfig::default()
        };
        let limiter = limiter_with(Arc::new(InMemoryCounterStore::new()), config, FailPolicy::Open, 5);

        let nine = at(9, 10);
        limiter.increment_count_at(nine).await.unwrap();
        limiter.increment_count_at(nine).await.unwrap();
        let denied = limiter.check_rate_limit_at(nine).await;
        assert!(matches!(&denied, RateLimit::Denied(r) if r.contains("hourly limit")));

        // A new hour has its own counter
        let ten = at(10, 5);
        assert!(limiter.check_rate_limit_at(ten).await.is_allowed());
        limiter.increment_count_at(ten).await.unwrap();

        // Both budgets exhausted: daily wins
        limiter.increment_count_at(ten).await.unwrap();
        let denied = limiter.check_rate_limit_at(ten).await;
        assert!(matches!(&denied, RateLimit::Denied(r) if r.contains("daily limit")));

        let usage = limiter.usage_at(ten).await.unwrap();
        assert_eq!(usage.daily_count, 4);
        assert_eq!(usage.hourly_count, 2);

        limiter.reset_at(ten).await.unwrap();
        assert!(limiter.check_rate_limit_at(ten).await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_ttl_expiry() {
        let store = InMemoryCounterStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.increment(&[("k", ttl)]).await.unwrap(), vec![1]);
        assert_eq!(store.increment(&[("k", ttl)]).await.unwrap(), vec![2]);
        assert_eq!(store.get("k").await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get("k").await.unwrap(), 0);
        assert_eq!(store.increment(&[("k", ttl)]).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_fail_open_until_streak_then_closed() {
        let failing = Arc::new(FailingCounterStore::default());
        let limiter = limiter_with(failing.clone(), DebateConfig::default(), FailPolicy::Open, 2);
        let now = at(12, 0);

        assert!(limiter.check_rate_limit_at(now).await.is_allowed());
        assert!(limiter.check_rate_limit_at(now).await.is_allowed());
        assert!(!limiter.check_rate_limit_at(now).await.is_allowed());

        // Storage recovers: streak resets
        failing.recover();
        assert!(limiter.check_rate_limit_at(now).await.is_allowed());
        failing.fail();
        assert!(limiter.check_rate_limit_at(now).await.is_allowed());
    }

    #[tokio::test]
    async fn test_fail_closed_denies_immediately() {
        let failing = Arc::new(FailingCounterStore::default());
        let limiter = limiter_with(failing, DebateConfig::default(), FailPolicy::Closed, 5);

        let (allowed, reason) = limiter.check_rate_limit_at(at(12, 0)).await.into_tuple();
        assert!(!allowed);
        assert!(reason.unwrap().contains("unavailable"));
    }
}
