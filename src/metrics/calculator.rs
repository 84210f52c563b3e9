//! Calculator for performance metrics over our closed trades: win rate,
//! payoff, drawdown, Sharpe. Feeds the Kelly input of the position sizer.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use statrs::statistics::Statistics;

use crate::models::{PerformanceMetrics, TradeRecord};

/// Calculator for computing performance metrics from trade history.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Calculate metrics from closed trades in the order they were closed.
    pub fn calculate(history: &[TradeRecord]) -> PerformanceMetrics {
        let mut metrics = PerformanceMetrics::new();

        if history.is_empty() {
            return metrics;
        }

        metrics.total_trades = history.len() as u32;
        metrics.total_fees = history.iter().map(|t| t.fees).sum();

        let pnls: Vec<Decimal> = history.iter().map(|t| t.realized_pnl).collect();
        Self::calculate_pnl_metrics(&mut metrics, &pnls);
        Self::calculate_drawdown(&mut metrics, &pnls);

        let returns: Vec<f64> = history
            .iter()
            .filter_map(|t| t.return_pct().to_f64())
            .collect();
        Self::calculate_sharpe(&mut metrics, &returns);

        metrics.calculated_at = Utc::now();
        metrics
    }

    fn calculate_pnl_metrics(metrics: &mut PerformanceMetrics, pnls: &[Decimal]) {
        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            pnls.iter().partition(|&&p| p > Decimal::ZERO);

        metrics.winning_trades = wins.len() as u32;
        metrics.losing_trades = losses.len() as u32;
        metrics.total_pnl = pnls.iter().copied().sum();
        metrics.win_rate = wins.len() as f64 / pnls.len() as f64;

        if !wins.is_empty() {
            metrics.avg_win = wins.iter().copied().sum::<Decimal>() / Decimal::from(wins.len() as u32);
        }
        if !losses.is_empty() {
            metrics.avg_loss = losses.iter().map(|l| l.abs()).sum::<Decimal>()
                / Decimal::from(losses.len() as u32);
        }

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();
        if gross_loss > Decimal::ZERO {
            metrics.profit_factor =
                gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0);
        }

        metrics.expectancy = metrics.total_pnl / Decimal::from(pnls.len() as u32);
    }

    /// Maximum drawdown of the cumulative P&L curve relative to its peak.
    fn calculate_drawdown(metrics: &mut PerformanceMetrics, pnls: &[Decimal]) {
        let mut equity = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_dd_pct = 0.0f64;

        for pnl in pnls {
            equity += pnl;
            if equity > peak {
                peak = equity;
            }
            if peak > Decimal::ZERO {
                let dd = ((peak - equity) / peak).to_f64().unwrap_or(0.0);
                if dd > max_dd_pct {
                    max_dd_pct = dd;
                }
            }
        }

        metrics.max_drawdown = max_dd_pct;
    }

    /// Sharpe ratio per trade, zero risk-free rate.
    fn calculate_sharpe(metrics: &mut PerformanceMetrics, returns: &[f64]) {
        if returns.len() < 2 {
            return;
        }

        let mean = returns.mean();
        let std_dev = returns.std_dev();
        if std_dev > 0.0 {
            metrics.sharpe_ratio = mean / std_dev;
        }
    }
}
