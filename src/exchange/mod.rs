//! Exchange adapter seam.

mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::models::TradeSide;

pub use paper::PaperExchange;

/// Failures surfaced by an exchange adapter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("insufficient margin: order needs {needed}, available {available}")]
    InsufficientMargin { needed: Decimal, available: Decimal },

    #[error("order rejected: {0}")]
    Rejected(String),
}

/// An open net position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub symbol: String,
    /// Signed size in base units; negative is short
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: TradeSide,
    pub size: Decimal,
    pub leverage: Option<u32>,
}

/// Execution report for a filled order.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub size: Decimal,
    pub price: Decimal,
    /// Realized P&L when the fill reduced a position
    pub realized_pnl: Option<Decimal>,
    pub filled_at: DateTime<Utc>,
}

/// A position the exchange closed on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct LiquidationEvent {
    pub symbol: String,
    pub size: Decimal,
    pub price: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Account equity in quote currency.
    async fn get_account_balance(&self) -> Result<Decimal, ExchangeError>;

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    async fn place_order(&self, order: &OrderRequest) -> Result<Fill, ExchangeError>;

    /// Flatten every open position at market.
    async fn close_all_positions(&self) -> Result<Vec<Fill>, ExchangeError>;

    /// Forced liquidations since the last poll.
    async fn poll_liquidations(&self) -> Result<Vec<LiquidationEvent>, ExchangeError> {
        Ok(Vec::new())
    }
}
