//! Performance metrics computed from our own closed trades.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Summary statistics over the trade history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// When these metrics were calculated
    pub calculated_at: DateTime<Utc>,

    // === Basic Statistics ===
    pub total_trades: u32,

    /// Net realized P&L
    pub total_pnl: Decimal,

    pub total_fees: Decimal,

    // === Win/Loss Metrics ===
    pub winning_trades: u32,
    pub losing_trades: u32,

    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,

    /// Average profit on winning trades
    pub avg_win: Decimal,

    /// Average loss on losing trades (absolute value)
    pub avg_loss: Decimal,

    /// Gross profit / gross loss
    pub profit_factor: f64,

    /// Expected P&L per trade
    pub expectancy: Decimal,

    // === Risk Metrics ===
    /// Maximum drawdown of cumulative P&L relative to its peak (0.0 to 1.0)
    pub max_drawdown: f64,

    /// Per-trade Sharpe ratio of net returns (not annualized)
    pub sharpe_ratio: f64,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            calculated_at: Utc::now(),
            total_trades: 0,
            total_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            avg_win: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            profit_factor: 0.0,
            expectancy: Decimal::ZERO,
            max_drawdown: 0.0,
            sharpe_ratio: 0.0,
        }
    }

    /// Average win divided by average loss.
    pub fn payoff_ratio(&self) -> Option<f64> {
        if self.avg_loss.is_zero() {
            return None;
        }
        Some(self.avg_win.to_f64()? / self.avg_loss.to_f64()?)
    }

    /// Full Kelly fraction `f* = (p*b - q) / b`, or `None` without enough
    /// history or without an edge.
    pub fn kelly_fraction(&self, min_trades: u32) -> Option<f64> {
        if self.total_trades < min_trades {
            return None;
        }
        let b = self.payoff_ratio()?;
        if b <= 0.0 {
            return None;
        }
        let p = self.win_rate;
        let q = 1.0 - p;
        let kelly = (p * b - q) / b;
        (kelly > 0.0).then_some(kelly.min(1.0))
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
