//! Permission levels and the account level state machine.

mod levels;
mod manager;

pub use levels::LevelTable;
pub use manager::{Evaluation, PermissionManager, PermissionManagerConfig, PermissionStore};
