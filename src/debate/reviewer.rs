//! LLM debate: a bull and a bear argue, a manager rules.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::api::{ChatMessage, LlmClient};
use crate::models::Decision;

use super::{DebateContext, DebateOutcome, DebateReviewer};

const BULL_PROMPT: &str = "You are the bullish analyst in a trading debate. \
Argue in at most five sentences why the proposed trade should go ahead, or be larger.";

const BEAR_PROMPT: &str = "You are the bearish analyst in a trading debate. \
Argue in at most five sentences why the proposed trade should be reduced or skipped.";

const MANAGER_PROMPT: &str = "You are the risk manager closing a trading debate. \
Weigh both arguments and reply with a single JSON object and nothing else: \
{\"action\": \"BUY\" | \"SELL\" | \"HOLD\", \"size\": <base units>, \
\"confidence\": <0.0-1.0>, \"reasoning\": <one-paragraph summary of the debate>}. \
Never increase the size beyond the proposal.";

pub struct LlmDebateReviewer {
    llm: LlmClient,
}

impl LlmDebateReviewer {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    fn proposal(decision: &Decision, context: &DebateContext) -> String {
        format!(
            "Proposed trade on {} at price {}: {} {} (confidence {}). Account balance {}, level {}.\nRationale: {}",
            context.symbol,
            context.current_price,
            decision.action,
            decision.size,
            decision.confidence,
            context.balance,
            context.level,
            decision.reasoning
        )
    }
}

#[async_trait]
impl DebateReviewer for LlmDebateReviewer {
    async fn review(&self, decision: &Decision, context: &DebateContext) -> Result<DebateOutcome> {
        let proposal = Self::proposal(decision, context);

        let bull_msgs = [ChatMessage::system(BULL_PROMPT), ChatMessage::user(proposal.clone())];
        let bear_msgs = [ChatMessage::system(BEAR_PROMPT), ChatMessage::user(proposal.clone())];
        let (bull, bear) = futures::try_join!(
            self.llm.chat(&bull_msgs, 0.7),
            self.llm.chat(&bear_msgs, 0.7)
        )?;
        debug!(bull = %bull, bear = %bear, "Debate arguments");

        let ruling = self
            .llm
            .chat(
                &[
                    ChatMessage::system(MANAGER_PROMPT),
                    ChatMessage::user(format!(
                        "{}\n\nBull case:\n{}\n\nBear case:\n{}",
                        proposal, bull, bear
                    )),
                ],
                0.2,
            )
            .await?;

        let mut revised = Decision::from_llm_output(&ruling)?;
        // Manager may shrink but never grow the trade
        if revised.size > decision.size {
            revised.size = decision.size;
        }
        if revised.leverage.is_none() {
            revised.leverage = decision.leverage;
        }

        Ok(DebateOutcome {
            summary: revised.reasoning.clone(),
            decision: revised,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PermissionLevel, TradeAction};
    use rust_decimal_macros::dec;

    #[test]
    fn test_proposal_text() {
        let decision = Decision::new(TradeAction::Sell, dec!(3), dec!(0.8)).with_reasoning("overbought");
        let context = DebateContext {
            account_id: "acct".to_string(),
            symbol: "ETH".to_string(),
            current_price: dec!(3000),
            balance: dec!(50000),
            level: PermissionLevel::L3,
        };

        let text = LlmDebateReviewer::proposal(&decision, &context);
        assert!(text.contains("SELL 3"));
        assert!(text.contains("level L3"));
        assert!(text.contains("overbought"));
    }
}
