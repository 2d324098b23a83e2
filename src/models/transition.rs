//! Permission-level transition log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PermissionLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Upgrade,
    Downgrade,
    /// Direct jump to L0 from any level
    ForcedProtection,
    /// L0 cleared back to the default level
    ProtectionCleared,
    /// Operator override
    Manual,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Upgrade => "upgrade",
            TransitionKind::Downgrade => "downgrade",
            TransitionKind::ForcedProtection => "forced_protection",
            TransitionKind::ProtectionCleared => "protection_cleared",
            TransitionKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upgrade" => Some(TransitionKind::Upgrade),
            "downgrade" => Some(TransitionKind::Downgrade),
            "forced_protection" => Some(TransitionKind::ForcedProtection),
            "protection_cleared" => Some(TransitionKind::ProtectionCleared),
            "manual" => Some(TransitionKind::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One computed level change. `applied` is false when auto transitions are
/// disabled and the change was only observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionTransition {
    pub account_id: String,
    pub from_level: PermissionLevel,
    pub to_level: PermissionLevel,
    pub kind: TransitionKind,
    pub reason: String,
    pub applied: bool,
    pub created_at: DateTime<Utc>,
}
