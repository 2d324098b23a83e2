//! Debate escalation: decide whether to debate, run the reviewer under a
//! hard timeout, and fall back to the original decision when it fails.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::models::{Decision, PermissionLevel};

use super::{DebateConfigManager, DebateRateLimiter, RateLimit};

/// Inputs a debate sees besides the decision itself.
#[derive(Debug, Clone)]
pub struct DebateContext {
    pub account_id: String,
    pub symbol: String,
    pub current_price: Decimal,
    pub balance: Decimal,
    pub level: PermissionLevel,
}

/// Result of a completed debate.
#[derive(Debug, Clone, PartialEq)]
pub struct DebateOutcome {
    /// Decision after review; may equal the original
    pub decision: Decision,
    /// Manager's summary of the arguments
    pub summary: String,
}

/// Multi-agent review of one decision.
#[async_trait]
pub trait DebateReviewer: Send + Sync {
    async fn review(&self, decision: &Decision, context: &DebateContext) -> Result<DebateOutcome>;
}

/// Outcome of the debate trigger gate.
#[derive(Debug, Clone, PartialEq)]
pub enum DebateTrigger {
    Trigger,
    /// Not debated, with the reason
    Skip(String),
}

impl DebateTrigger {
    pub fn is_triggered(&self) -> bool {
        matches!(self, DebateTrigger::Trigger)
    }
}

/// What happened to a decision at the debate gate.
#[derive(Debug, Clone, PartialEq)]
pub enum DebateResolution {
    /// Not escalated; the decision proceeds unchanged
    Skipped { decision: Decision, reason: String },
    /// Debate completed
    Reviewed {
        original: Decision,
        revised: Decision,
        summary: String,
    },
    /// Debate timed out or failed; the original decision proceeds
    Fallback { decision: Decision, reason: String },
}

impl DebateResolution {
    /// Decision to carry forward.
    pub fn decision(&self) -> &Decision {
        match self {
            DebateResolution::Skipped { decision, .. } => decision,
            DebateResolution::Reviewed { revised, .. } => revised,
            DebateResolution::Fallback { decision, .. } => decision,
        }
    }

    pub fn into_decision(self) -> Decision {
        match self {
            DebateResolution::Skipped { decision, .. } => decision,
            DebateResolution::Reviewed { revised, .. } => revised,
            DebateResolution::Fallback { decision, .. } => decision,
        }
    }

    /// True when the debate changed the decision, which must then be
    /// validated again.
    pub fn is_revised(&self) -> bool {
        matches!(self, DebateResolution::Reviewed { original, revised, .. } if original != revised)
    }
}

pub struct DebateCoordinator {
    config: Arc<DebateConfigManager>,
    limiter: Arc<DebateRateLimiter>,
    reviewer: Arc<dyn DebateReviewer>,
}

impl DebateCoordinator {
    pub fn new(
        config: Arc<DebateConfigManager>,
        limiter: Arc<DebateRateLimiter>,
        reviewer: Arc<dyn DebateReviewer>,
    ) -> Self {
        Self {
            config,
            limiter,
            reviewer,
        }
    }

    pub fn limiter(&self) -> &DebateRateLimiter {
        &self.limiter
    }

    /// Whether a decision of this value at this level should be debated:
    /// the config thresholds first, then the rate limit.
    pub async fn should_trigger_debate(
        &self,
        position_size_usd: Decimal,
        level: PermissionLevel,
    ) -> DebateTrigger {
        let config = self.config.current().await;
        if !config.should_trigger(position_size_usd, level) {
            return DebateTrigger::Skip(format!(
                "Below debate threshold (value ${:.2}, level {})",
                position_size_usd, level
            ));
        }

        match self.limiter.check_rate_limit().await {
            RateLimit::Allowed => DebateTrigger::Trigger,
            RateLimit::Denied(reason) => {
                warn!(reason = %reason, "Debate skipped by rate limit");
                DebateTrigger::Skip(reason)
            }
        }
    }

    /// Run the gate and, if triggered, the debate.
    pub async fn escalate(&self, decision: Decision, context: &DebateContext) -> DebateResolution {
        if !decision.is_actionable() {
            return DebateResolution::Skipped {
                decision,
                reason: "Nothing to debate".to_string(),
            };
        }

        let value = decision.notional(context.current_price);
        let trigger = self.should_trigger_debate(value, context.level).await;
        if let DebateTrigger::Skip(reason) = trigger {
            debug!(account = %context.account_id, reason = %reason, "No debate");
            return DebateResolution::Skipped { decision, reason };
        }

        if let Err(e) = self.limiter.increment_count().await {
            warn!(error = %e, "Failed to count debate");
        }

        let config = self.config.current().await;
        let timeout = Duration::from_secs(config.timeout_seconds);
        info!(
            account = %context.account_id,
            action = %decision.action,
            value = %value,
            timeout_secs = config.timeout_seconds,
            "Escalating decision to debate"
        );

        match tokio::time::timeout(timeout, self.reviewer.review(&decision, context)).await {
            Ok(Ok(outcome)) => {
                info!(
                    account = %context.account_id,
                    original = %decision.action,
                    revised = %outcome.decision.action,
                    "Debate concluded"
                );
                DebateResolution::Reviewed {
                    original: decision,
                    revised: outcome.decision,
                    summary: outcome.summary,
                }
            }
            Ok(Err(e)) => {
                warn!(account = %context.account_id, error = %e, "Debate failed, using original decision");
                DebateResolution::Fallback {
                    decision,
                    reason: format!("Debate failed: {}", e),
                }
            }
            Err(_) => {
                warn!(
                    account = %context.account_id,
                    timeout_secs = config.timeout_seconds,
                    "Debate timed out, using original decision"
                );
                DebateResolution::Fallback {
                    decision,
                    reason: format!("Debate timed out after {}s", config.timeout_seconds),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailPolicy;
    use crate::debate::{DebateConfig, InMemoryCounterStore};
    use crate::models::TradeAction;
    use crate::testing::{MemorySettingsStore, ScriptedReviewer};
    use rust_decimal_macros::dec;

    fn coordinator(config: DebateConfig, reviewer: ScriptedReviewer) -> DebateCoordinator {
        let manager = Arc::new(DebateConfigManager::fixed(
            Arc::new(MemorySettingsStore::default()),
            config,
        ));
        let limiter = Arc::new(DebateRateLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            manager.clone(),
            FailPolicy::Open,
            5,
        ));
        DebateCoordinator::new(manager, limiter, Arc::new(reviewer))
    }

    fn context(level: PermissionLevel) -> DebateContext {
        DebateContext {
            account_id: "acct".to_string(),
            symbol: "BTC".to_string(),
            current_price: dec!(100),
            balance: dec!(100000),
            level,
        }
    }

    fn big_buy() -> Decision {
        Decision::new(TradeAction::Buy, dec!(20), dec!(0.8))
    }

    #[tokio::test]
    async fn test_small_or_low_level_decisions_skip() {
        let coord = coordinator(DebateConfig::default(), ScriptedReviewer::agree());

        let small = Decision::new(TradeAction::Buy, dec!(1), dec!(0.8));
        let res = coord.escalate(small, &context(PermissionLevel::L3)).await;
        assert!(matches!(res, DebateResolution::Skipped { .. }));

        let res = coord.escalate(big_buy(), &context(PermissionLevel::L1)).await;
        assert!(matches!(res, DebateResolution::Skipped { .. }));
        assert_eq!(coord.limiter().usage().await.unwrap().daily_count, 0);

        assert!(coord.should_trigger_debate(dec!(2000), PermissionLevel::L2).await.is_triggered());
        let below = coord.should_trigger_debate(dec!(999), PermissionLevel::L5).await;
        assert!(matches!(&below, DebateTrigger::Skip(reason) if reason.contains("threshold")));
    }

    #[tokio::test]
    async fn test_debate_revises_and_counts_once() {
        let revised = Decision::new(TradeAction::Buy, dec!(10), dec!(0.7));
        let coord = coordinator(DebateConfig::default(), ScriptedReviewer::revise(revised.clone()));

        let res = coord.escalate(big_buy(), &context(PermissionLevel::L2)).await;
        assert!(res.is_revised());
        assert_eq!(res.decision(), &revised);

        let usage = coord.limiter().usage().await.unwrap();
        assert_eq!((usage.daily_count, usage.hourly_count), (1, 1));
    }

    #[tokio::test]
    async fn test_reviewer_error_falls_back() {
        let coord = coordinator(DebateConfig::default(), ScriptedReviewer::failing());
        let res = coord.escalate(big_buy(), &context(PermissionLevel::L4)).await;

        assert!(matches!(&res, DebateResolution::Fallback { reason, .. } if reason.contains("failed")));
        assert_eq!(res.into_decision(), big_buy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back() {
        let config = DebateConfig {
            timeout_seconds: 1,
            ..DebateConfig::default()
        };
        let coord = coordinator(config, ScriptedReviewer::slow(Duration::from_secs(5)));

        let res = coord.escalate(big_buy(), &context(PermissionLevel::L4)).await;
        assert!(matches!(&res, DebateResolution::Fallback { reason, .. } if reason.contains("timed out")));
        assert_eq!(res.decision(), &big_buy());
    }

    #[tokio::test]
    async fn test_rate_limited_decision_skips_debate() {
        let config = DebateConfig {
            daily_limit: 1,
            ..DebateConfig::default()
        };
        let coord = coordinator(config, ScriptedReviewer::agree());

        let first = coord.escalate(big_buy(), &context(PermissionLevel::L2)).await;
        assert!(matches!(first, DebateResolution::Reviewed { .. }));
        let gate = coord.should_trigger_debate(dec!(5000), PermissionLevel::L2).await;
        assert!(matches!(&gate, DebateTrigger::Skip(reason) if reason.contains("daily limit")));

        let second = coord.escalate(big_buy(), &context(PermissionLevel::L2)).await;
        assert!(matches!(&second, DebateResolution::Skipped { reason, .. } if reason.contains("daily limit")));
    }
}
