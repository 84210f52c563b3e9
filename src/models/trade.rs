//! Closed-trade history records.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::instrument::AssetClass;
use super::position::{Position, PositionSide};

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    Manual,
    Rebalance,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::Manual => "manual",
            ExitReason::Rebalance => "rebalance",
        };
        f.write_str(name)
    }
}

/// Immutable snapshot of a closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position_id: String,
    pub instrument_id: String,

    #[serde(default)]
    pub name: String,

    pub asset_class: AssetClass,
    pub side: PositionSide,
    pub size: Decimal,

    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,

    /// P&L before fees
    pub gross_pnl: Decimal,

    /// Entry plus exit fees
    pub fees: Decimal,

    /// P&L after fees
    pub realized_pnl: Decimal,

    pub exit_reason: ExitReason,
    pub signal_confidence: f64,

    /// Part of a position whose exit order filled only partly; the rest
    /// stays active under the same position id
    #[serde(default)]
    pub partial: bool,
}

impl TradeRecord {
    /// Snapshot `position` closed at `exit_price` with `exit_fee`.
    pub fn from_exit(
        position: &Position,
        exit_price: Decimal,
        exit_fee: Decimal,
        reason: ExitReason,
        exit_time: DateTime<Utc>,
    ) -> Self {
        let gross_pnl = position.pnl_at(exit_price);
        let fees = position.entry_fee + exit_fee;

        Self {
            position_id: position.id.clone(),
            instrument_id: position.instrument_id.clone(),
            name: position.name.clone(),
            asset_class: position.asset_class,
            side: position.side,
            size: position.size,
            entry_price: position.entry_price,
            exit_price,
            entry_time: position.entry_time,
            exit_time,
            gross_pnl,
            fees,
            realized_pnl: gross_pnl - fees,
            exit_reason: reason,
            signal_confidence: position.signal_confidence,
            partial: false,
        }
    }

    /// Net return on the entry notional.
    pub fn return_pct(&self) -> Decimal {
        let notional = self.entry_price * self.size;
        if notional.is_zero() {
            return Decimal::ZERO;
        }
        self.realized_pnl / notional
    }
}
