//! In-process simulated exchange.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::models::TradeSide;

use super::{ExchangeAdapter, ExchangeError, Fill, LiquidationEvent, OrderRequest, Position};

#[derive(Debug, Clone, Copy, Default)]
struct PaperPosition {
    /// Signed size
    size: Decimal,
    entry_price: Decimal,
}

impl PaperPosition {
    fn unrealized(&self, price: Decimal) -> Decimal {
        self.size * (price - self.entry_price)
    }
}

#[derive(Debug, Default)]
struct PaperState {
    /// Deposited cash plus realized P&L
    cash: Decimal,
    positions: HashMap<String, PaperPosition>,
    prices: HashMap<String, Decimal>,
    liquidations: Vec<LiquidationEvent>,
    next_order: u64,
}

impl PaperState {
    fn equity(&self) -> Decimal {
        let unrealized: Decimal = self
            .positions
            .iter()
            .map(|(symbol, p)| {
                self.prices
                    .get(symbol)
                    .map(|price| p.unrealized(*price))
                    .unwrap_or(Decimal::ZERO)
            })
            .sum();
        self.cash + unrealized
    }

    fn price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    /// Apply a fill at `price` and return the realized P&L of any reduced part.
    fn fill(&mut self, symbol: &str, side: TradeSide, size: Decimal, price: Decimal) -> Option<Decimal> {
        let signed = side.sign() * size;
        let pos = self.positions.entry(symbol.to_string()).or_default();

        let increasing = pos.size.is_zero() || pos.size.is_sign_positive() == signed.is_sign_positive();
        let realized = if increasing {
            let total = pos.size.abs() + size;
            pos.entry_price = (pos.size.abs() * pos.entry_price + size * price) / total;
            pos.size += signed;
            None
        } else {
            let closed = pos.size.abs().min(size);
            let direction = if pos.size.is_sign_positive() {
                Decimal::ONE
            } else {
                Decimal::NEGATIVE_ONE
            };
            let pnl = closed * (price - pos.entry_price) * direction;
            let remaining = pos.size + signed;
            if !remaining.is_zero() && remaining.is_sign_positive() != pos.size.is_sign_positive() {
                // Flipped through zero: the remainder opens at this price
                pos.entry_price = price;
            }
            pos.size = remaining;
            Some(pnl)
        };

        if pos.size.is_zero() {
            self.positions.remove(symbol);
        }
        if let Some(pnl) = realized {
            self.cash += pnl;
        }
        realized
    }

    fn order_id(&mut self) -> String {
        self.next_order += 1;
        format!("paper-{}", self.next_order)
    }
}

/// Simulated perpetual-style exchange: orders fill instantly at the set
/// price, margin is checked against equity and realized P&L settles into
/// the cash balance.
pub struct PaperExchange {
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState {
                cash: initial_balance,
                ..PaperState::default()
            }),
        }
    }

    pub fn with_price(mut self, symbol: &str, price: Decimal) -> Self {
        self.state.get_mut().prices.insert(symbol.to_string(), price);
        self
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state.lock().await.prices.insert(symbol.to_string(), price);
    }

    /// Close a position as the exchange would on margin exhaustion and
    /// queue a liquidation event.
    pub async fn liquidate(&self, symbol: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().await;
        let price = state.price(symbol)?;
        let Some(pos) = state.positions.get(symbol).copied() else {
            return Ok(());
        };

        let side = if pos.size.is_sign_positive() {
            TradeSide::Sell
        } else {
            TradeSide::Buy
        };
        state.fill(symbol, side, pos.size.abs(), price);
        state.liquidations.push(LiquidationEvent {
            symbol: symbol.to_string(),
            size: pos.size.abs(),
            price,
            occurred_at: Utc::now(),
        });
        info!(symbol, size = %pos.size, price = %price, "Paper position liquidated");
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn get_account_balance(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.state.lock().await.equity())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let state = self.state.lock().await;
        let mut positions: Vec<Position> = state
            .positions
            .iter()
            .map(|(symbol, p)| {
                let price = state.prices.get(symbol).copied().unwrap_or(p.entry_price);
                Position {
                    symbol: symbol.clone(),
                    size: p.size,
                    entry_price: p.entry_price,
                    unrealized_pnl: p.unrealized(price),
                }
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.state.lock().await.price(symbol)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<Fill, ExchangeError> {
        if order.size <= Decimal::ZERO {
            return Err(ExchangeError::Rejected(format!("invalid size {}", order.size)));
        }

        let mut state = self.state.lock().await;
        let price = state.price(&order.symbol)?;

        let leverage = Decimal::from(order.leverage.unwrap_or(1).max(1));
        let needed = order.size * price / leverage;
        let available = state.equity();
        if needed > available {
            return Err(ExchangeError::InsufficientMargin { needed, available });
        }

        let realized_pnl = state.fill(&order.symbol, order.side, order.size, price);
        let fill = Fill {
            exchange_order_id: state.order_id(),
            symbol: order.symbol.clone(),
            side: order.side,
            size: order.size,
            price,
            realized_pnl,
            filled_at: Utc::now(),
        };
        debug!(order_id = %fill.exchange_order_id, side = %order.side.as_str(), size = %order.size, price = %price, "Paper fill");
        Ok(fill)
    }

    async fn close_all_positions(&self) -> Result<Vec<Fill>, ExchangeError> {
        let mut state = self.state.lock().await;
        let open: Vec<(String, PaperPosition)> =
            state.positions.iter().map(|(s, p)| (s.clone(), *p)).collect();

        let mut fills = Vec::with_capacity(open.len());
        for (symbol, pos) in open {
            let price = state.price(&symbol)?;
            let side = if pos.size.is_sign_positive() {
                TradeSide::Sell
            } else {
                TradeSide::Buy
            };
            let realized_pnl = state.fill(&symbol, side, pos.size.abs(), price);
            fills.push(Fill {
                exchange_order_id: state.order_id(),
                symbol,
                side,
                size: pos.size.abs(),
                price,
                realized_pnl,
                filled_at: Utc::now(),
            });
        }

        Ok(fills)
    }

    async fn poll_liquidations(&self) -> Result<Vec<LiquidationEvent>, ExchangeError> {
        Ok(std::mem::take(&mut self.state.lock().await.liquidations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(side: TradeSide, size: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: "BTC".to_string(),
            side,
            size,
            leverage: None,
        }
    }

    #[tokio::test]
    async fn test_open_add_and_reduce() {
        let ex = PaperExchange::new(dec!(10000)).with_price("BTC", dec!(100));

        let open = ex.place_order(&order(TradeSide::Buy, dec!(10))).await.unwrap();
        assert_eq!(open.realized_pnl, None);

        ex.set_price("BTC", dec!(120)).await;
        ex.place_order(&order(TradeSide::Buy, dec!(10))).await.unwrap();
        let positions = ex.get_positions().await.unwrap();
        assert_eq!(positions[0].size, dec!(20));
        assert_eq!(positions[0].entry_price, dec!(110));

        ex.set_price("BTC", dec!(130)).await;
        let reduce = ex.place_order(&order(TradeSide::Sell, dec!(5))).await.unwrap();
        assert_eq!(reduce.realized_pnl, Some(dec!(100)));

        // Cash 10100 + unrealized 15 * (130 - 110)
        assert_eq!(ex.get_account_balance().await.unwrap(), dec!(10400));
    }

    #[tokio::test]
    async fn test_flip_and_close_all() {
        let ex = PaperExchange::new(dec!(10000)).with_price("BTC", dec!(100));
        ex.place_order(&order(TradeSide::Buy, dec!(5))).await.unwrap();

        ex.set_price("BTC", dec!(90)).await;
        let flip = ex.place_order(&order(TradeSide::Sell, dec!(8))).await.unwrap();
        assert_eq!(flip.realized_pnl, Some(dec!(-50)));

        let positions = ex.get_positions().await.unwrap();
        assert_eq!(positions[0].size, dec!(-3));
        assert_eq!(positions[0].entry_price, dec!(90));

        ex.set_price("BTC", dec!(80)).await;
        let fills = ex.close_all_positions().await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].side, TradeSide::Buy);
        assert_eq!(fills[0].realized_pnl, Some(dec!(30)));
        assert!(ex.get_positions().await.unwrap().is_empty());
        assert_eq!(ex.get_account_balance().await.unwrap(), dec!(9980));
    }

    #[tokio::test]
    async fn test_rejections() {
        let ex = PaperExchange::new(dec!(1000)).with_price("BTC", dec!(100));

        assert!(matches!(
            ex.place_order(&order(TradeSide::Buy, dec!(20))).await,
            Err(ExchangeError::InsufficientMargin { .. })
        ));

        let levered = OrderRequest {
            leverage: Some(2),
            ..order(TradeSide::Buy, dec!(20))
        };
        assert!(ex.place_order(&levered).await.is_ok());

        let unknown = OrderRequest {
            symbol: "DOGE".to_string(),
            ..order(TradeSide::Buy, dec!(1))
        };
        assert_eq!(
            ex.place_order(&unknown).await,
            Err(ExchangeError::UnknownSymbol("DOGE".to_string()))
        );
    }

    #[tokio::test]
    async fn test_liquidation_is_reported_once() {
        let ex = PaperExchange::new(dec!(1000)).with_price("BTC", dec!(100));
        ex.place_order(&order(TradeSide::Buy, dec!(5))).await.unwrap();

        ex.liquidate("BTC").await.unwrap();
        let events = ex.poll_liquidations().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].size, dec!(5));
        assert!(ex.poll_liquidations().await.unwrap().is_empty());
    }
}
