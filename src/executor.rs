//! Final write path from an accepted decision to an exchange order and a
//! persisted trade.
//!
//! Every attempt is recorded as an order first. Only filled orders produce
//! a trade row, so failed attempts stay visible for audit without counting
//! toward win rates.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info};

use crate::db::Database;
use crate::exchange::{ExchangeAdapter, Fill, OrderRequest};
use crate::models::{Decision, Order, OrderStatus, Trade, TradeSide};

/// Outcome reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub trade_id: Option<String>,
    pub message: String,
}

impl ExecutionResult {
    fn no_order(message: impl Into<String>) -> Self {
        Self {
            success: true,
            trade_id: None,
            message: message.into(),
        }
    }
}

/// Places orders for one account and records the result.
pub struct TradeExecutor {
    account_id: String,
    db: Arc<Database>,
    exchange: Arc<dyn ExchangeAdapter>,
}

impl TradeExecutor {
    pub fn new(
        account_id: impl Into<String>,
        db: Arc<Database>,
        exchange: Arc<dyn ExchangeAdapter>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            db,
            exchange,
        }
    }

    /// Execute a decision the risk manager has already accepted.
    ///
    /// Exchange failures are reported in the result; database failures are
    /// returned as errors.
    pub async fn execute_decision(
        &self,
        decision: &Decision,
        symbol: &str,
        current_price: Decimal,
    ) -> Result<ExecutionResult> {
        let Some(side) = decision.action.side() else {
            return Ok(ExecutionResult::no_order("HOLD: no order placed"));
        };
        if decision.size <= Decimal::ZERO {
            return Ok(ExecutionResult::no_order("Zero size: no order placed"));
        }

        let order = self
            .open_order(symbol, side, decision.size, current_price)
            .await?;

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            size: decision.size,
            leverage: decision.leverage,
        };

        match self.exchange.place_order(&request).await {
            Ok(fill) => {
                let trade = self
                    .record_fill(&order, &fill, decision.confidence, &decision.reasoning)
                    .await?;
                info!(
                    account = %self.account_id,
                    trade_id = %trade.id,
                    side = %side.as_str(),
                    size = %fill.size,
                    price = %fill.price,
                    "Order filled"
                );
                Ok(ExecutionResult {
                    success: true,
                    message: format!(
                        "{} {} {} @ {}",
                        side.as_str(),
                        fill.size,
                        symbol,
                        fill.price
                    ),
                    trade_id: Some(trade.id),
                })
            }
            Err(e) => {
                error!(account = %self.account_id, order_id = %order.id, error = %e, "Order failed");
                self.db
                    .update_order_status(&order.id, OrderStatus::Failed, None, Some(&e.to_string()))
                    .await?;
                Ok(ExecutionResult {
                    success: false,
                    trade_id: None,
                    message: format!("Order failed: {}", e),
                })
            }
        }
    }

    /// Flatten every open position. Each closing fill is recorded like any
    /// other trade so its realized P&L reaches the history.
    pub async fn close_all_positions(&self, reason: &str) -> Result<Vec<ExecutionResult>> {
        let fills = match self.exchange.close_all_positions().await {
            Ok(fills) => fills,
            Err(e) => {
                error!(account = %self.account_id, error = %e, "Failed to close positions");
                return Ok(vec![ExecutionResult {
                    success: false,
                    trade_id: None,
                    message: format!("Close all positions failed: {}", e),
                }]);
            }
        };

        let mut results = Vec::with_capacity(fills.len());
        for fill in fills {
            let order = self
                .open_order(&fill.symbol, fill.side, fill.size, fill.price)
                .await?;
            let trade = self.record_fill(&order, &fill, Decimal::ONE, reason).await?;
            info!(
                account = %self.account_id,
                symbol = %fill.symbol,
                pnl = ?fill.realized_pnl,
                "Position closed"
            );
            results.push(ExecutionResult {
                success: true,
                trade_id: Some(trade.id),
                message: format!("Closed {} {} @ {}", fill.size, fill.symbol, fill.price),
            });
        }

        Ok(results)
    }

    async fn open_order(
        &self,
        symbol: &str,
        side: TradeSide,
        size: Decimal,
        price: Decimal,
    ) -> Result<Order> {
        let order = Order {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: self.account_id.clone(),
            symbol: symbol.to_string(),
            side,
            size,
            price,
            status: OrderStatus::Pending,
            exchange_order_id: None,
            error_message: None,
            created_at: Utc::now(),
        };
        self.db.insert_order(&order).await?;
        Ok(order)
    }

    async fn record_fill(
        &self,
        order: &Order,
        fill: &Fill,
        confidence: Decimal,
        reasoning: &str,
    ) -> Result<Trade> {
        self.db
            .update_order_status(
                &order.id,
                OrderStatus::Filled,
                Some(&fill.exchange_order_id),
                None,
            )
            .await?;

        let trade = Trade {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: self.account_id.clone(),
            order_id: order.id.clone(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            size: fill.size,
            price: fill.price,
            realized_pnl: fill.realized_pnl,
            confidence,
            reasoning: reasoning.to_string(),
            executed_at: fill.filled_at,
        };
        self.db.insert_trade(&trade).await?;
        Ok(trade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::models::TradeAction;
    use crate::testing::DownExchange;
    use rust_decimal_macros::dec;

    async fn executor(exchange: Arc<dyn ExchangeAdapter>) -> (TradeExecutor, Arc<Database>) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        (TradeExecutor::new("acct", db.clone(), exchange), db)
    }

    #[tokio::test]
    async fn test_hold_places_no_order() {
        let (executor, db) = executor(Arc::new(DownExchange)).await;
        let result = executor
            .execute_decision(&Decision::hold("flat"), "BTC", dec!(100))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.trade_id.is_none());
        assert!(db.get_orders("acct", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fill_creates_one_trade() {
        let exchange = Arc::new(PaperExchange::new(dec!(10000)).with_price("BTC", dec!(100)));
        let (executor, db) = executor(exchange).await;
        let decision = Decision::new(TradeAction::Buy, dec!(2), dec!(0.8)).with_reasoning("breakout");

        let result = tokio_test::assert_ok!(executor.execute_decision(&decision, "BTC", dec!(100)).await);
        assert!(result.success);

        let orders = db.get_orders("acct", 10).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Filled);
        assert!(orders[0].exchange_order_id.is_some());

        let trades = db.get_trades("acct", 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(Some(trades[0].id.clone()), result.trade_id);
        assert_eq!(trades[0].order_id, orders[0].id);
        assert_eq!(trades[0].confidence, dec!(0.8));
        assert_eq!(trades[0].reasoning, "breakout");
        assert!(!trades[0].is_settled());
    }

    #[tokio::test]
    async fn test_exchange_failure_records_failed_order() {
        let (executor, db) = executor(Arc::new(DownExchange)).await;
        let decision = Decision::new(TradeAction::Sell, dec!(1), dec!(0.9));

        let result = executor.execute_decision(&decision, "BTC", dec!(100)).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("unavailable"));

        let orders = db.get_orders("acct", 10).await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Failed);
        assert!(orders[0].error_message.is_some());
        assert!(db.get_trades("acct", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_all_records_realized_pnl() {
        let exchange = Arc::new(PaperExchange::new(dec!(10000)).with_price("BTC", dec!(100)));
        let (executor, db) = executor(exchange.clone()).await;

        let buy = Decision::new(TradeAction::Buy, dec!(5), dec!(0.8));
        executor.execute_decision(&buy, "BTC", dec!(100)).await.unwrap();
        exchange.set_price("BTC", dec!(90)).await;

        let results = executor.close_all_positions("max drawdown").await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);

        let trades = db.get_trades("acct", 10).await.unwrap();
        assert_eq!(trades.len(), 2);
        let closing = trades.iter().find(|t| t.is_settled()).unwrap();
        assert_eq!(closing.realized_pnl, Some(dec!(-50)));
        assert_eq!(closing.side, TradeSide::Sell);
    }
}
