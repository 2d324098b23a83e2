//! LLM-backed decision source.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::models::Decision;

use super::llm_client::LlmClient;
use super::types::ChatMessage;
use super::{DecisionSource, MarketContext};

const SYSTEM_PROMPT: &str = "You are a disciplined crypto trading assistant. \
Reply with a single JSON object and nothing else: \
{\"action\": \"BUY\" | \"SELL\" | \"HOLD\", \"size\": <base units>, \
\"confidence\": <0.0-1.0>, \"reasoning\": <short string>}. \
Optionally include \"leverage\": <integer>. Respect the limits you are given.";

/// Asks the model for one decision per cycle.
pub struct DecisionClient {
    llm: LlmClient,
    temperature: f32,
}

impl DecisionClient {
    pub fn new(llm: LlmClient) -> Self {
        Self {
            llm,
            temperature: 0.2,
        }
    }

    fn prompt(context: &MarketContext) -> Vec<ChatMessage> {
        let payload = json!({
            "symbol": context.symbol,
            "price": context.current_price.to_string(),
            "balance": context.balance.to_string(),
            "position_size": context.position_size.to_string(),
            "permission_level": context.permission.level.as_str(),
            "max_position_pct": context.permission.max_position_pct.to_string(),
            "max_leverage": context.permission.max_leverage,
            "min_confidence": context.permission.confidence_threshold.to_string(),
        });

        vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!("Market and account state:\n{}", payload)),
        ]
    }
}

#[async_trait]
impl DecisionSource for DecisionClient {
    async fn decide(&self, context: &MarketContext) -> Result<Decision> {
        let messages = Self::prompt(context);
        let raw = self.llm.chat(&messages, self.temperature).await?;
        debug!(model = %self.llm.model(), raw = %raw, "Model reply");

        match Decision::from_llm_output(&raw) {
            Ok(decision) => Ok(decision),
            Err(e) => {
                warn!(error = %e, "Unparsable model reply, holding");
                Ok(Decision::hold(format!("Unparsable model reply: {}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PermissionSnapshot;
    use crate::permission::LevelTable;
    use crate::models::PermissionLevel;
    use rust_decimal_macros::dec;

    #[test]
    fn test_prompt_carries_limits() {
        let table = LevelTable::defaults();
        let context = MarketContext {
            account_id: "acct".to_string(),
            symbol: "BTC".to_string(),
            current_price: dec!(65000),
            balance: dec!(10000),
            position_size: dec!(0.01),
            permission: PermissionSnapshot::new("acct", table.get(PermissionLevel::L2)),
        };

        let messages = DecisionClient::prompt(&context);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[1].content.contains("\"permission_level\":\"L2\""));
        assert!(messages[1].content.contains("\"max_leverage\":3"));
    }
}
