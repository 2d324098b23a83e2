//! Application configuration loaded from the environment.
//!
//! `.env` is read by `main` through dotenvy before [`AppConfig::from_env`]
//! runs. Unparsable values are logged and replaced by their defaults; only
//! the level table and the debate settings are validated strictly.

use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;

use crate::api::LlmConfig;
use crate::models::PermissionLevel;
use crate::permission::PermissionManagerConfig;
use crate::risk::RiskConfig;

/// What to do when the storage behind a check is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPolicy {
    /// Treat the check as passed
    Open,
    /// Treat the check as failed
    Closed,
}

impl FromStr for FailPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" | "fail_open" => Ok(FailPolicy::Open),
            "closed" | "close" | "fail_closed" => Ok(FailPolicy::Closed),
            other => Err(format!("Invalid fail policy: {}", other)),
        }
    }
}

impl std::fmt::Display for FailPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailPolicy::Open => write!(f, "open"),
            FailPolicy::Closed => write!(f, "closed"),
        }
    }
}

/// Where debate rate counters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterBackend {
    /// Shared `rate_counters` table; survives restarts
    Sqlite,
    /// Process-local map; counts reset on restart
    Memory,
}

impl FromStr for CounterBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" | "db" => Ok(CounterBackend::Sqlite),
            "memory" | "mem" => Ok(CounterBackend::Memory),
            other => Err(format!("Invalid counter backend: {}", other)),
        }
    }
}

impl std::fmt::Display for CounterBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterBackend::Sqlite => write!(f, "sqlite"),
            CounterBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Invalid level table or debate settings.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no permission level is marked default")]
    NoDefaultLevel,

    #[error("{0} permission levels are marked default, expected exactly one")]
    MultipleDefaultLevels(usize),

    #[error("protection level L0 cannot be the default level")]
    ProtectionAsDefault,

    #[error("permission level {0} is missing")]
    MissingLevel(PermissionLevel),

    #[error("permission level {0} is defined more than once")]
    DuplicateLevel(PermissionLevel),

    #[error("{level}: {field} must be within [0, 1], got {value}")]
    RatioOutOfRange {
        level: PermissionLevel,
        field: &'static str,
        value: String,
    },

    #[error("unknown debate setting '{0}'")]
    UnknownDebateSetting(String),

    #[error("invalid value '{value}' for debate setting '{key}': {reason}")]
    InvalidDebateSetting {
        key: String,
        value: String,
        reason: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Account the trading loop runs for
    pub account_id: String,

    /// Symbol the trading loop trades
    pub symbol: String,

    pub risk: RiskConfig,

    pub permission: PermissionManagerConfig,

    /// Policy when the debate counter store is unreachable
    pub debate_fail_policy: FailPolicy,

    /// Consecutive storage failures tolerated before the limiter closes
    pub debate_fail_open_max_streak: u32,

    /// Backing store for the trading loop's debate counters
    pub debate_counter_backend: CounterBackend,

    /// Seconds between trading cycles
    pub trading_interval_secs: u64,

    /// Seconds between periodic permission re-evaluations
    pub permission_eval_interval_secs: u64,

    pub llm: LlmConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            account_id: "default".to_string(),
            symbol: "BTC".to_string(),
            risk: RiskConfig::default(),
            permission: PermissionManagerConfig::default(),
            debate_fail_policy: FailPolicy::Open,
            debate_fail_open_max_streak: 5,
            debate_counter_backend: CounterBackend::Sqlite,
            trading_interval_secs: 60,
            permission_eval_interval_secs: 3600,
            llm: LlmConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(account) = std::env::var("ACCOUNT_ID") {
            if !account.trim().is_empty() {
                config.account_id = account.trim().to_string();
            }
        }
        if let Ok(symbol) = std::env::var("TRADING_SYMBOL") {
            if !symbol.trim().is_empty() {
                config.symbol = symbol.trim().to_uppercase();
            }
        }

        // Risk
        config.risk.max_daily_loss_pct =
            env_ratio("MAX_DAILY_LOSS_PCT", config.risk.max_daily_loss_pct);
        config.risk.max_drawdown_pct = env_ratio("MAX_DRAWDOWN_PCT", config.risk.max_drawdown_pct);
        config.risk.max_consecutive_losses =
            env_parse("MAX_CONSECUTIVE_LOSSES", config.risk.max_consecutive_losses);
        config.risk.history_fail_policy =
            env_parse("RISK_HISTORY_FAIL_POLICY", config.risk.history_fail_policy);

        // Permission levels
        config.permission.enable_auto_upgrade =
            env_flag("ENABLE_AUTO_UPGRADE", config.permission.enable_auto_upgrade);
        config.permission.enable_auto_downgrade =
            env_flag("ENABLE_AUTO_DOWNGRADE", config.permission.enable_auto_downgrade);
        if let Ok(hours) = std::env::var("PROTECTION_AUTO_CLEAR_HOURS") {
            match hours.trim().parse::<i64>() {
                Ok(h) if h > 0 => config.permission.protection_auto_clear_hours = Some(h),
                _ => warn!(
                    value = %hours,
                    "Invalid PROTECTION_AUTO_CLEAR_HOURS, protection mode needs manual clearance"
                ),
            }
        }

        // Debate limiter
        config.debate_fail_policy = env_parse("DEBATE_FAIL_POLICY", config.debate_fail_policy);
        config.debate_fail_open_max_streak =
            env_parse("DEBATE_FAIL_OPEN_MAX_STREAK", config.debate_fail_open_max_streak);
        config.debate_counter_backend =
            env_parse("DEBATE_COUNTER_BACKEND", config.debate_counter_backend);

        // Scheduling
        config.trading_interval_secs =
            env_parse("TRADING_INTERVAL_SECS", config.trading_interval_secs).max(1);
        config.permission_eval_interval_secs =
            env_parse("PERMISSION_EVAL_INTERVAL_SECS", config.permission_eval_interval_secs).max(1);

        // LLM endpoint
        if let Ok(base) = std::env::var("LLM_API_BASE") {
            config.llm.api_base = base.trim_end_matches('/').to_string();
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            if !key.is_empty() {
                config.llm.api_key = Some(key);
            }
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.llm.model = model;
        }
        config.llm.timeout_secs = env_parse("LLM_TIMEOUT_SECS", config.llm.timeout_secs);

        config
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = %default, "Failed to parse setting, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_ratio(key: &str, default: Decimal) -> Decimal {
    let value: Decimal = env_parse(key, default);
    if value < Decimal::ZERO || value > Decimal::ONE {
        warn!(key, value = %value, default = %default, "Ratio must be within [0, 1], using default");
        return default;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_policy_parse() {
        assert_eq!("open".parse::<FailPolicy>(), Ok(FailPolicy::Open));
        assert_eq!("FAIL_CLOSED".parse::<FailPolicy>(), Ok(FailPolicy::Closed));
        assert!("maybe".parse::<FailPolicy>().is_err());
    }

    #[test]
    fn test_counter_backend_parse() {
        assert_eq!("sqlite".parse::<CounterBackend>(), Ok(CounterBackend::Sqlite));
        assert_eq!(" Memory ".parse::<CounterBackend>(), Ok(CounterBackend::Memory));
        assert!("redis".parse::<CounterBackend>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.debate_fail_policy, FailPolicy::Open);
        assert_eq!(config.debate_counter_backend, CounterBackend::Sqlite);
        assert_eq!(config.trading_interval_secs, 60);
        assert!(config.permission.enable_auto_upgrade);
        assert!(config.permission.enable_auto_downgrade);
    }
}
