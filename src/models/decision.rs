//! Trading decision as produced by an LLM client.
//!
//! The model output is only trusted to have the shape
//! `{action, size, confidence, reasoning}` after JSON parsing. Everything
//! else (code fences, casing, surrounding prose) is tolerated here so the
//! risk layer only ever sees a typed [`Decision`].

use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TradeSide;

/// What the model wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Hold => "HOLD",
        }
    }

    /// Order side for this action, `None` for HOLD.
    pub fn side(&self) -> Option<TradeSide> {
        match self {
            TradeAction::Buy => Some(TradeSide::Buy),
            TradeAction::Sell => Some(TradeSide::Sell),
            TradeAction::Hold => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "buy" | "long" => Some(TradeAction::Buy),
            "sell" | "short" => Some(TradeAction::Sell),
            "hold" | "wait" | "none" => Some(TradeAction::Hold),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// BUY, SELL or HOLD
    pub action: TradeAction,

    /// Order size in base units
    pub size: Decimal,

    /// Model confidence (expected 0.0 to 1.0)
    pub confidence: Decimal,

    /// Free-form explanation kept for later analysis
    #[serde(default)]
    pub reasoning: String,

    /// Requested leverage, if the model asked for one
    #[serde(default)]
    pub leverage: Option<u32>,
}

/// Loose shape accepted from model output before normalisation.
#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    size: Option<Decimal>,
    #[serde(default)]
    confidence: Option<Decimal>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    leverage: Option<u32>,
}

impl Decision {
    pub fn new(action: TradeAction, size: Decimal, confidence: Decimal) -> Self {
        Self {
            action,
            size,
            confidence,
            reasoning: String::new(),
            leverage: None,
        }
    }

    /// A do-nothing decision.
    pub fn hold(reasoning: impl Into<String>) -> Self {
        Self {
            action: TradeAction::Hold,
            size: Decimal::ZERO,
            confidence: Decimal::ZERO,
            reasoning: reasoning.into(),
            leverage: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = Some(leverage);
        self
    }

    /// True when the decision would place an order.
    pub fn is_actionable(&self) -> bool {
        self.action != TradeAction::Hold && !self.size.is_zero()
    }

    /// Order value at the given price.
    pub fn notional(&self, price: Decimal) -> Decimal {
        self.size * price
    }

    /// Parse a decision out of raw model output.
    ///
    /// Accepts a bare JSON object, a fenced ```json block, or an object
    /// embedded in surrounding prose. Missing size/confidence default to zero.
    pub fn from_llm_output(raw: &str) -> Result<Self> {
        let json = extract_json_object(raw)
            .ok_or_else(|| anyhow!("No JSON object found in model output"))?;

        let parsed: RawDecision =
            serde_json::from_str(json).context("Model output is not a valid decision object")?;

        let action = TradeAction::parse(&parsed.action)
            .ok_or_else(|| anyhow!("Unknown action '{}'", parsed.action))?;

        Ok(Self {
            action,
            size: parsed.size.unwrap_or(Decimal::ZERO),
            confidence: parsed.confidence.unwrap_or(Decimal::ZERO),
            reasoning: parsed.reasoning.unwrap_or_default(),
            leverage: parsed.leverage,
        })
    }
}

/// Slice out the outermost `{ ... }` of a model reply.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}
