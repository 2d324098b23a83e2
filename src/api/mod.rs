//! LLM client used as the decision source and by debate reviewers.

mod decision_client;
mod llm_client;
mod types;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{Decision, PermissionSnapshot};

pub use decision_client::DecisionClient;
pub use llm_client::{LlmClient, LlmConfig};
pub use types::*;

/// Everything a decision source sees for one cycle.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub account_id: String,
    pub symbol: String,
    pub current_price: Decimal,
    pub balance: Decimal,
    pub position_size: Decimal,
    pub permission: PermissionSnapshot,
}

/// Produces trading decisions.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    async fn decide(&self, context: &MarketContext) -> Result<Decision>;
}
