//! Debate gating: when to escalate a decision to a multi-agent review and
//! how many reviews the budget allows.

mod config;
mod coordinator;
mod limiter;
mod reviewer;

pub use config::{DebateConfig, DebateConfigManager, DebateSettingsStore, DEBATE_KEYS};
pub use coordinator::{DebateContext, DebateCoordinator, DebateOutcome, DebateReviewer};
pub use limiter::{CounterStore, DebateRateLimiter, InMemoryCounterStore, RateLimit};
pub use reviewer::LlmDebateReviewer;
