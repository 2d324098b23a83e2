//! Orders sent to the exchange and the trades they produce.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            TradeSide::Buy => Decimal::ONE,
            TradeSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

/// Lifecycle of an order we attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(OrderStatus::Pending),
            "FILLED" => Some(OrderStatus::Filled),
            "FAILED" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

/// An order attempt. Failed orders are kept for audit but never counted
/// as trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub size: Decimal,
    /// Reference price at submission
    pub price: Decimal,
    pub status: OrderStatus,
    /// Identifier assigned by the exchange, once known
    pub exchange_order_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An executed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,

    pub account_id: String,

    /// Order that produced this fill
    pub order_id: String,

    pub symbol: String,

    pub side: TradeSide,

    /// Filled quantity in base units
    pub size: Decimal,

    /// Fill price
    pub price: Decimal,

    /// Realized P&L when the fill reduced a position; `None` for opening fills
    pub realized_pnl: Option<Decimal>,

    /// Confidence of the originating decision
    pub confidence: Decimal,

    /// Reasoning of the originating decision
    #[serde(default)]
    pub reasoning: String,

    pub executed_at: DateTime<Utc>,
}

impl Trade {
    /// Total value of the fill.
    pub fn notional(&self) -> Decimal {
        self.size * self.price
    }

    /// A settled trade has a realized outcome and counts toward win rates.
    pub fn is_settled(&self) -> bool {
        self.realized_pnl.is_some()
    }

    pub fn is_win(&self) -> bool {
        matches!(self.realized_pnl, Some(p) if p > Decimal::ZERO)
    }

    pub fn is_loss(&self) -> bool {
        matches!(self.realized_pnl, Some(p) if p < Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_trade(side: TradeSide, pnl: Option<Decimal>) -> Trade {
        Trade {
            id: "t1".to_string(),
            account_id: "default".to_string(),
            order_id: "o1".to_string(),
            symbol: "BTC".to_string(),
            side,
            size: dec!(2),
            price: dec!(100),
            realized_pnl: pnl,
            confidence: dec!(0.8),
            reasoning: String::new(),
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn test_notional() {
        assert_eq!(make_trade(TradeSide::Sell, None).notional(), dec!(200));
    }

    #[test]
    fn test_settlement_flags() {
        assert!(!make_trade(TradeSide::Buy, None).is_settled());
        assert!(make_trade(TradeSide::Sell, Some(dec!(5))).is_win());
        assert!(make_trade(TradeSide::Sell, Some(dec!(-5))).is_loss());

        let flat = make_trade(TradeSide::Sell, Some(Decimal::ZERO));
        assert!(flat.is_settled() && !flat.is_win() && !flat.is_loss());
    }
}
