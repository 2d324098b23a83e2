//! Debate settings and the manager that loads, validates and reloads them.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::ConfigError;
use crate::models::PermissionLevel;
use crate::reload::{ReloadBus, ReloadSignal};

/// Setting keys as stored in the `debate_config` table.
pub const DEBATE_KEYS: [&str; 6] = [
    "enabled",
    "min_position_size",
    "min_permission_level",
    "timeout_seconds",
    "daily_limit",
    "hourly_limit",
];

/// When a decision is escalated to a debate, and how often.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateConfig {
    pub enabled: bool,

    /// Minimum order value (quote currency) that warrants a debate
    pub min_position_size: Decimal,

    /// Accounts below this level never debate
    pub min_permission_level: PermissionLevel,

    /// Hard cap on one debate
    pub timeout_seconds: u64,

    pub daily_limit: u64,

    pub hourly_limit: u64,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_position_size: dec!(1000), // $1000 order value
            min_permission_level: PermissionLevel::L2,
            timeout_seconds: 60,
            daily_limit: 100,
            hourly_limit: 20,
        }
    }
}

impl DebateConfig {
    /// Build from stored key/value rows on top of the defaults.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.apply(key, value)?;
        }
        Ok(config)
    }

    /// Parse and set one setting.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidDebateSetting {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let raw = value.trim();

        match key {
            "enabled" => {
                self.enabled = match raw.to_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" => true,
                    "false" | "0" | "no" | "off" => false,
                    _ => return Err(invalid("expected a boolean")),
                }
            }
            "min_position_size" => {
                let size: Decimal = raw.parse().map_err(|_| invalid("expected a number"))?;
                if size < Decimal::ZERO {
                    return Err(invalid("must not be negative"));
                }
                self.min_position_size = size;
            }
            "min_permission_level" => {
                self.min_permission_level = raw
                    .parse()
                    .map_err(|_| invalid("expected a level L0-L5"))?;
            }
            "timeout_seconds" => {
                let secs: u64 = raw.parse().map_err(|_| invalid("expected whole seconds"))?;
                if secs == 0 {
                    return Err(invalid("must be at least 1"));
                }
                self.timeout_seconds = secs;
            }
            "daily_limit" => {
                self.daily_limit = raw.parse().map_err(|_| invalid("expected a count"))?;
            }
            "hourly_limit" => {
                self.hourly_limit = raw.parse().map_err(|_| invalid("expected a count"))?;
            }
            other => return Err(ConfigError::UnknownDebateSetting(other.to_string())),
        }

        Ok(())
    }

    /// Settings as stored key/value rows.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("enabled", self.enabled.to_string()),
            ("min_position_size", self.min_position_size.to_string()),
            ("min_permission_level", self.min_permission_level.to_string()),
            ("timeout_seconds", self.timeout_seconds.to_string()),
            ("daily_limit", self.daily_limit.to_string()),
            ("hourly_limit", self.hourly_limit.to_string()),
        ]
    }

    /// Config part of the trigger decision; the rate limit is checked
    /// separately.
    pub fn should_trigger(&self, position_size_usd: Decimal, level: PermissionLevel) -> bool {
        self.enabled
            && position_size_usd >= self.min_position_size
            && level >= self.min_permission_level
    }
}

/// Storage for debate settings.
#[async_trait]
pub trait DebateSettingsStore: Send + Sync {
    async fn load_debate_settings(&self) -> Result<Vec<(String, String)>>;

    async fn save_debate_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Current debate settings, backed by a store and kept fresh by reloads.
pub struct DebateConfigManager {
    store: Arc<dyn DebateSettingsStore>,
    current: RwLock<DebateConfig>,
    bus: Option<ReloadBus>,
}

impl DebateConfigManager {
    /// Load and validate. Invalid stored settings are a startup error.
    pub async fn load(store: Arc<dyn DebateSettingsStore>, bus: Option<ReloadBus>) -> Result<Self> {
        let config = Self::read(store.as_ref()).await?;
        Ok(Self {
            store,
            current: RwLock::new(config),
            bus,
        })
    }

    /// Fixed settings with no backing rows, for tools and tests.
    pub fn fixed(store: Arc<dyn DebateSettingsStore>, config: DebateConfig) -> Self {
        Self {
            store,
            current: RwLock::new(config),
            bus: None,
        }
    }

    async fn read(store: &dyn DebateSettingsStore) -> Result<DebateConfig> {
        let rows = store
            .load_debate_settings()
            .await
            .context("Failed to load debate settings")?;
        let config = DebateConfig::from_pairs(rows.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        Ok(config)
    }

    pub async fn current(&self) -> DebateConfig {
        self.current.read().await.clone()
    }

    /// Validate, persist and publish one setting.
    pub async fn set(&self, key: &str, value: &str) -> Result<DebateConfig> {
        let mut updated = self.current().await;
        updated.apply(key, value)?;

        self.store
            .save_debate_setting(key, value.trim())
            .await
            .context("Failed to save debate setting")?;
        *self.current.write().await = updated.clone();

        info!(key, value, "Debate setting updated");
        if let Some(bus) = &self.bus {
            bus.publish(ReloadSignal::Debate);
        }

        Ok(updated)
    }

    /// Re-read the store. On failure the previous settings stay in force.
    pub async fn reload(&self) -> Result<()> {
        match Self::read(self.store.as_ref()).await {
            Ok(config) => {
                *self.current.write().await = config;
                info!("Debate settings reloaded");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Debate settings reload failed, keeping previous settings");
                Err(e)
            }
        }
    }
}
