//! The validated permission level table.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::ConfigError;
use crate::models::{
    DowngradeThresholds, PermissionLevel, PermissionLevelConfig, PermissionSnapshot,
    UpgradeThresholds,
};

/// All six levels, indexed by rank. Construction validates the table, so
/// lookups never fail.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelTable {
    levels: Vec<PermissionLevelConfig>,
    default_level: PermissionLevel,
}

impl LevelTable {
    /// Validate and index a set of level rows.
    pub fn new(rows: Vec<PermissionLevelConfig>) -> Result<Self, ConfigError> {
        let mut slots: Vec<Option<PermissionLevelConfig>> = vec![None; PermissionLevel::ALL.len()];

        for row in rows {
            validate_row(&row)?;
            let slot = &mut slots[row.level.rank()];
            if slot.is_some() {
                return Err(ConfigError::DuplicateLevel(row.level));
            }
            *slot = Some(row);
        }

        let mut levels = Vec::with_capacity(slots.len());
        for (level, slot) in PermissionLevel::ALL.iter().zip(slots) {
            levels.push(slot.ok_or(ConfigError::MissingLevel(*level))?);
        }

        let defaults: Vec<PermissionLevel> = levels
            .iter()
            .filter(|l| l.is_default)
            .map(|l| l.level)
            .collect();
        let default_level = match defaults.as_slice() {
            [] => return Err(ConfigError::NoDefaultLevel),
            [PermissionLevel::L0] => return Err(ConfigError::ProtectionAsDefault),
            [only] => *only,
            many => return Err(ConfigError::MultipleDefaultLevels(many.len())),
        };

        Ok(Self {
            levels,
            default_level,
        })
    }

    /// The built-in table seeded into a fresh database.
    pub fn defaults() -> Self {
        Self {
            levels: default_rows(),
            default_level: PermissionLevel::L1,
        }
    }

    pub fn get(&self, level: PermissionLevel) -> &PermissionLevelConfig {
        &self.levels[level.rank()]
    }

    /// Level assigned to new accounts and restored on protection reset.
    pub fn default_level(&self) -> PermissionLevel {
        self.default_level
    }

    pub fn snapshot(&self, account_id: &str, level: PermissionLevel) -> PermissionSnapshot {
        PermissionSnapshot::new(account_id, self.get(level))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PermissionLevelConfig> {
        self.levels.iter()
    }

    pub fn rows(&self) -> &[PermissionLevelConfig] {
        &self.levels
    }
}

fn validate_row(row: &PermissionLevelConfig) -> Result<(), ConfigError> {
    let out_of_range = |field: &'static str, value: String| ConfigError::RatioOutOfRange {
        level: row.level,
        field,
        value,
    };

    let decimals = [
        ("max_position_pct", row.max_position_pct),
        ("confidence_threshold", row.confidence_threshold),
    ];
    for (field, value) in decimals {
        if value < Decimal::ZERO || value > Decimal::ONE {
            return Err(out_of_range(field, value.to_string()));
        }
    }

    let ratios = [
        ("upgrade_win_rate_7d", row.upgrade.win_rate_7d),
        ("upgrade_win_rate_30d", row.upgrade.win_rate_30d),
        ("downgrade_max_drawdown", row.downgrade.max_drawdown),
        ("downgrade_win_rate_7d", row.downgrade.win_rate_7d),
    ];
    for (field, value) in ratios {
        if let Some(v) = value {
            if !(0.0..=1.0).contains(&v) {
                return Err(out_of_range(field, v.to_string()));
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn row(
    level: PermissionLevel,
    name: &str,
    max_position_pct: Decimal,
    max_leverage: u32,
    confidence_threshold: Decimal,
    max_daily_trades: u32,
    upgrade: UpgradeThresholds,
    downgrade: DowngradeThresholds,
) -> PermissionLevelConfig {
    PermissionLevelConfig {
        level,
        name: name.to_string(),
        max_position_pct,
        max_leverage,
        confidence_threshold,
        max_daily_trades,
        upgrade,
        downgrade,
        is_default: level == PermissionLevel::L1,
    }
}

fn default_rows() -> Vec<PermissionLevelConfig> {
    use PermissionLevel::*;

    vec![
        row(
            L0,
            "Protection",
            dec!(0),
            1,
            dec!(1.00),
            0,
            UpgradeThresholds::default(),
            DowngradeThresholds::default(),
        ),
        row(
            L1,
            "Novice",
            dec!(0.10),
            2,
            dec!(0.75),
            5,
            UpgradeThresholds {
                win_rate_7d: Some(0.55),
                win_rate_30d: Some(0.55),
                sharpe_ratio: None,
                min_trades: Some(10),
                min_days: Some(3),
            },
            DowngradeThresholds {
                max_drawdown: Some(0.10),
                consecutive_losses: Some(3),
                win_rate_7d: None,
            },
        ),
        row(
            L2,
            "Apprentice",
            dec!(0.20),
            3,
            dec!(0.70),
            10,
            UpgradeThresholds {
                win_rate_7d: None,
                win_rate_30d: Some(0.60),
                sharpe_ratio: None,
                min_trades: Some(20),
                min_days: Some(7),
            },
            DowngradeThresholds {
                max_drawdown: Some(0.12),
                consecutive_losses: Some(4),
                win_rate_7d: Some(0.40),
            },
        ),
        row(
            L3,
            "Intermediate",
            dec!(0.30),
            5,
            dec!(0.65),
            15,
            UpgradeThresholds {
                win_rate_7d: Some(0.60),
                win_rate_30d: Some(0.60),
                sharpe_ratio: Some(1.0),
                min_trades: Some(40),
                min_days: Some(14),
            },
            DowngradeThresholds {
                max_drawdown: Some(0.15),
                consecutive_losses: Some(4),
                win_rate_7d: Some(0.45),
            },
        ),
        row(
            L4,
            "Advanced",
            dec!(0.40),
            10,
            dec!(0.60),
            20,
            UpgradeThresholds {
                win_rate_7d: Some(0.62),
                win_rate_30d: Some(0.62),
                sharpe_ratio: Some(1.5),
                min_trades: Some(80),
                min_days: Some(30),
            },
            DowngradeThresholds {
                max_drawdown: Some(0.18),
                consecutive_losses: Some(5),
                win_rate_7d: Some(0.45),
            },
        ),
        row(
            L5,
            "Expert",
            dec!(0.50),
            20,
            dec!(0.55),
            30,
            UpgradeThresholds::default(),
            DowngradeThresholds {
                max_drawdown: Some(0.20),
                consecutive_losses: Some(5),
                win_rate_7d: Some(0.50),
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_is_valid() {
        let table = LevelTable::new(default_rows()).unwrap();
        assert_eq!(table, LevelTable::defaults());
        assert_eq!(table.default_level(), PermissionLevel::L1);
        assert_eq!(table.get(PermissionLevel::L1).max_position_pct, dec!(0.10));
        assert!(table.get(PermissionLevel::L0).upgrade.is_empty());
        assert!(table.get(PermissionLevel::L5).upgrade.is_empty());
        assert!(table.snapshot("acct", PermissionLevel::L0).trading_disabled());
    }

    #[test]
    fn test_missing_and_duplicate_levels() {
        let mut rows = default_rows();
        rows.pop();
        assert_eq!(
            LevelTable::new(rows),
            Err(ConfigError::MissingLevel(PermissionLevel::L5))
        );

        let mut rows = default_rows();
        let dup = rows[2].clone();
        rows.push(dup);
        assert_eq!(
            LevelTable::new(rows),
            Err(ConfigError::DuplicateLevel(PermissionLevel::L2))
        );
    }

    #[test]
    fn test_exactly_one_default() {
        let mut rows = default_rows();
        rows[1].is_default = false;
        assert_eq!(LevelTable::new(rows), Err(ConfigError::NoDefaultLevel));

        let mut rows = default_rows();
        rows[3].is_default = true;
        assert_eq!(
            LevelTable::new(rows),
            Err(ConfigError::MultipleDefaultLevels(2))
        );

        let mut rows = default_rows();
        rows[1].is_default = false;
        rows[0].is_default = true;
        assert_eq!(LevelTable::new(rows), Err(ConfigError::ProtectionAsDefault));
    }

    #[test]
    fn test_ratio_bounds() {
        let mut rows = default_rows();
        rows[2].max_position_pct = dec!(1.5);
        assert!(matches!(
            LevelTable::new(rows),
            Err(ConfigError::RatioOutOfRange { field: "max_position_pct", .. })
        ));

        let mut rows = default_rows();
        rows[3].downgrade.max_drawdown = Some(-0.1);
        assert!(matches!(
            LevelTable::new(rows),
            Err(ConfigError::RatioOutOfRange { field: "downgrade_max_drawdown", .. })
        ));
    }
}
