//! Calculator for account performance windows: win rates, Sharpe ratio,
//! loss streaks and drawdown.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{EvaluationMarker, Trade};

/// Trailing performance of one account at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceWindow {
    /// Settled trades in the last 7 days
    pub settled_7d: u32,

    /// Settled trades in the last 30 days
    pub settled_30d: u32,

    /// `None` when there are no settled trades in the window
    pub win_rate_7d: Option<f64>,
    pub win_rate_30d: Option<f64>,

    /// Annualized Sharpe ratio of 30-day trade P&Ls, `None` below 2 trades
    pub sharpe_ratio: Option<f64>,

    /// Losing trades in a row, counted from the newest settled trade
    pub consecutive_losses: u32,

    /// Sum of realized P&L over 30 days
    pub pnl_30d: Decimal,

    /// Drawdown of the current balance from the initial balance (0.0 to 1.0)
    pub drawdown: Option<f64>,

    /// Largest peak-to-trough decline of the 30-day realized equity curve,
    /// as a fraction of the peak
    pub max_drawdown_30d: f64,

    /// Newest settled trade time
    pub latest_trade_at: Option<DateTime<Utc>>,

    pub calculated_at: DateTime<Utc>,
}

impl PerformanceWindow {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            settled_7d: 0,
            settled_30d: 0,
            win_rate_7d: None,
            win_rate_30d: None,
            sharpe_ratio: None,
            consecutive_losses: 0,
            pnl_30d: Decimal::ZERO,
            drawdown: None,
            max_drawdown_30d: 0.0,
            latest_trade_at: None,
            calculated_at: now,
        }
    }

    /// Fingerprint of the evidence this window was computed from.
    pub fn marker(&self) -> EvaluationMarker {
        EvaluationMarker {
            settled_trades: self.settled_30d,
            latest_trade_at: self.latest_trade_at,
        }
    }
}

/// Calculator for computing performance windows.
pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Build the window from settled trades of the last 30 days.
    ///
    /// Unsettled trades are ignored. Order of `trades` does not matter.
    pub fn calculate(
        trades: &[Trade],
        initial_balance: Option<Decimal>,
        current_balance: Decimal,
        now: DateTime<Utc>,
    ) -> PerformanceWindow {
        let mut window = PerformanceWindow::empty(now);
        window.drawdown = Self::current_drawdown(initial_balance, current_balance);

        let thirty_days_ago = now - Duration::days(30);
        let seven_days_ago = now - Duration::days(7);

        let mut settled: Vec<&Trade> = trades
            .iter()
            .filter(|t| t.is_settled() && t.executed_at >= thirty_days_ago)
            .collect();

        if settled.is_empty() {
            return window;
        }

        // Newest first
        settled.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));

        let recent: Vec<&Trade> = settled
            .iter()
            .copied()
            .filter(|t| t.executed_at >= seven_days_ago)
            .collect();

        window.settled_30d = settled.len() as u32;
        window.settled_7d = recent.len() as u32;
        window.win_rate_30d = Self::win_rate(&settled);
        window.win_rate_7d = Self::win_rate(&recent);
        window.latest_trade_at = settled.first().map(|t| t.executed_at);
        window.consecutive_losses = settled.iter().take_while(|t| t.is_loss()).count() as u32;

        let pnls: Vec<Decimal> = settled
            .iter()
            .rev()
            .filter_map(|t| t.realized_pnl)
            .collect();
        window.pnl_30d = pnls.iter().copied().sum();
        window.sharpe_ratio = Self::sharpe(&pnls);
        window.max_drawdown_30d = Self::max_drawdown(initial_balance, &pnls);

        window
    }

    fn win_rate(trades: &[&Trade]) -> Option<f64> {
        if trades.is_empty() {
            return None;
        }
        let wins = trades.iter().filter(|t| t.is_win()).count();
        Some(wins as f64 / trades.len() as f64)
    }

    fn current_drawdown(initial: Option<Decimal>, current: Decimal) -> Option<f64> {
        let initial = initial.filter(|i| *i > Decimal::ZERO)?;
        let dd = ((initial - current) / initial).to_f64()?;
        Some(dd.max(0.0))
    }

    /// Sharpe ratio, assuming 0% risk-free rate and 365 periods per year.
    fn sharpe(pnls: &[Decimal]) -> Option<f64> {
        if pnls.len() < 2 {
            return None;
        }

        let returns: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        if returns.len() < 2 {
            return None;
        }

        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();

        if std_dev > 0.0 {
            Some((mean / std_dev) * (365.0_f64).sqrt())
        } else if mean > 0.0 {
            // Identical winning trades: no variance, treat as unbounded
            Some(f64::INFINITY)
        } else {
            Some(0.0)
        }
    }

    /// Maximum drawdown of the equity curve built from P&Ls in time order,
    /// starting from the initial balance when known.
    fn max_drawdown(initial: Option<Decimal>, pnls: &[Decimal]) -> f64 {
        let mut equity = initial.unwrap_or(Decimal::ZERO);
        let mut peak = equity;
        let mut max_dd_pct = 0.0f64;

        for pnl in pnls {
            equity += pnl;

            if equity > peak {
                peak = equity;
            }

            if peak > Decimal::ZERO {
                let dd = peak - equity;
                let dd_pct = dd.to_f64().unwrap_or(0.0) / peak.to_f64().unwrap_or(1.0);
                if dd_pct > max_dd_pct {
                    max_dd_pct = dd_pct;
                }
            }
        }

        max_dd_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::settled_trade;
    use rust_decimal_macros::dec;

    #[test]
    fn test_empty_window() {
        let now = Utc::now();
        let window = PerformanceCalculator::calculate(&[], Some(dec!(1000)), dec!(1000), now);

        assert_eq!(window.settled_30d, 0);
        assert_eq!(window.win_rate_7d, None);
        assert_eq!(window.win_rate_30d, None);
        assert_eq!(window.sharpe_ratio, None);
        assert_eq!(window.drawdown, Some(0.0));
    }

    #[test]
    fn test_win_rates_by_window() {
        let now = Utc::now();
        let trades = vec![
            settled_trade(dec!(10), now - Duration::days(1)),
            settled_trade(dec!(-5), now - Duration::days(2)),
            settled_trade(dec!(20), now - Duration::days(10)),
            settled_trade(dec!(15), now - Duration::days(20)),
            // Outside both windows
            settled_trade(dec!(-50), now - Duration::days(40)),
        ];

        let window = PerformanceCalculator::calculate(&trades, None, dec!(1000), now);

        assert_eq!(window.settled_7d, 2);
        assert_eq!(window.settled_30d, 4);
        assert!((window.win_rate_7d.unwrap() - 0.5).abs() < 1e-9);
        assert!((window.win_rate_30d.unwrap() - 0.75).abs() < 1e-9);
        assert_eq!(window.pnl_30d, dec!(40));
        assert_eq!(window.latest_trade_at, Some(now - Duration::days(1)));
        assert_eq!(window.drawdown, None);
    }

    #[test]
    fn test_consecutive_losses_from_newest() {
        let now = Utc::now();
        let trades = vec![
            settled_trade(dec!(-1), now - Duration::hours(1)),
            settled_trade(dec!(-2), now - Duration::hours(2)),
            settled_trade(dec!(5), now - Duration::hours(3)),
            settled_trade(dec!(-3), now - Duration::hours(4)),
        ];

        let window = PerformanceCalculator::calculate(&trades, None, dec!(1000), now);
        assert_eq!(window.consecutive_losses, 2);
    }

    #[test]
    fn test_sharpe_sign() {
        let now = Utc::now();
        let winners = vec![
            settled_trade(dec!(10), now - Duration::days(1)),
            settled_trade(dec!(12), now - Duration::days(2)),
            settled_trade(dec!(-2), now - Duration::days(3)),
        ];
        let sharpe = PerformanceCalculator::calculate(&winners, None, dec!(1000), now)
            .sharpe_ratio
            .unwrap();
        assert!(sharpe > 0.0);

        let single = vec![settled_trade(dec!(10), now - Duration::days(1))];
        assert_eq!(
            PerformanceCalculator::calculate(&single, None, dec!(1000), now).sharpe_ratio,
            None
        );
    }

    #[test]
    fn test_drawdowns() {
        let now = Utc::now();
        let trades = vec![
            settled_trade(dec!(100), now - Duration::days(5)),
            settled_trade(dec!(-220), now - Duration::days(4)),
            settled_trade(dec!(20), now - Duration::days(3)),
        ];

        let window = PerformanceCalculator::calculate(&trades, Some(dec!(1000)), dec!(840), now);

        // Current: (1000 - 840) / 1000
        assert!((window.drawdown.unwrap() - 0.16).abs() < 1e-9);
        // Curve: 1000 -> 1100 -> 880 -> 900, worst 220 / 1100
        assert!((window.max_drawdown_30d - 0.2).abs() < 1e-9);
    }
}
