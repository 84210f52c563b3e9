//! Position model and its lifecycle states.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::instrument::{AssetClass, Instrument};
use super::trade::ExitReason;
use crate::error::InvariantViolation;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

/// Lifecycle: `PendingEntry -> Open -> (Trailing) -> PendingExit -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    PendingEntry,
    Open,
    Trailing,
    PendingExit,
    Closed,
}

impl PositionState {
    /// Open or trailing: the position is held and managed every cycle.
    pub fn is_held(&self) -> bool {
        matches!(self, PositionState::Open | PositionState::Trailing)
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PositionState::PendingEntry => "pending_entry",
            PositionState::Open => "open",
            PositionState::Trailing => "trailing",
            PositionState::PendingExit => "pending_exit",
            PositionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One of our positions at the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,

    /// ISIN of the instrument
    pub instrument_id: String,

    #[serde(default)]
    pub name: String,

    pub asset_class: AssetClass,
    pub side: PositionSide,
    pub state: PositionState,

    /// Quantity in units of the instrument
    pub size: Decimal,

    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,

    /// ATR at the time of entry
    pub entry_atr: Decimal,

    /// Most recent ATR seen by the exit evaluation
    pub current_atr: Decimal,

    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,

    pub dynamic_stop_loss: Decimal,
    pub dynamic_take_profit: Decimal,

    pub trailing_stop_active: bool,
    pub trailing_stop_price: Option<Decimal>,

    pub signal_confidence: f64,

    /// Budget reserved for this position while it is active
    pub committed_notional: Decimal,

    pub entry_fee: Decimal,

    /// Client order ids, used to reconcile pending orders
    pub entry_order_id: String,
    pub exit_order_id: Option<String>,

    pub exit_reason: Option<ExitReason>,

    pub last_updated: DateTime<Utc>,
}

impl Position {
    /// A position whose entry order has been submitted but not yet filled.
    #[allow(clippy::too_many_arguments)]
    pub fn pending_entry(
        instrument: &Instrument,
        side: PositionSide,
        size: Decimal,
        limit_price: Decimal,
        atr: Decimal,
        signal_confidence: f64,
        committed_notional: Decimal,
        entry_order_id: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instrument_id: instrument.isin.clone(),
            name: instrument.name.clone(),
            asset_class: instrument.asset_class,
            side,
            state: PositionState::PendingEntry,
            size,
            entry_price: limit_price,
            entry_time: now,
            entry_atr: atr,
            current_atr: atr,
            current_price: limit_price,
            unrealized_pnl: Decimal::ZERO,
            dynamic_stop_loss: Decimal::ZERO,
            dynamic_take_profit: Decimal::ZERO,
            trailing_stop_active: false,
            trailing_stop_price: None,
            signal_confidence,
            committed_notional,
            entry_fee: Decimal::ZERO,
            entry_order_id,
            exit_order_id: None,
            exit_reason: None,
            last_updated: now,
        }
    }

    /// Record the confirmed entry fill and move to `Open`.
    pub fn confirm_entry(
        &mut self,
        fill_price: Decimal,
        filled_size: Decimal,
        fee: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), InvariantViolation> {
        self.expect_state(PositionState::PendingEntry, "pending_entry")?;
        self.entry_price = fill_price;
        self.size = filled_size;
        self.entry_fee = fee;
        self.entry_time = now;
        self.state = PositionState::Open;
        self.mark_price(fill_price, now);
        Ok(())
    }

    /// Move a held position to `PendingExit`.
    pub fn begin_exit(
        &mut self,
        reason: ExitReason,
        exit_order_id: String,
        now: DateTime<Utc>,
    ) -> Result<(), InvariantViolation> {
        if !self.state.is_held() {
            return Err(self.transition_error("open or trailing"));
        }
        self.state = PositionState::PendingExit;
        self.exit_reason = Some(reason);
        self.exit_order_id = Some(exit_order_id);
        self.last_updated = now;
        Ok(())
    }

    /// Return a `PendingExit` position to its held state after the exit
    /// order was rejected or cancelled.
    pub fn abandon_exit(&mut self, now: DateTime<Utc>) -> Result<(), InvariantViolation> {
        self.expect_state(PositionState::PendingExit, "pending_exit")?;
        self.state = if self.trailing_stop_active {
            PositionState::Trailing
        } else {
            PositionState::Open
        };
        self.exit_reason = None;
        self.exit_order_id = None;
        self.last_updated = now;
        Ok(())
    }

    /// Update the mark price and unrealized P&L.
    pub fn mark_price(&mut self, price: Decimal, now: DateTime<Utc>) {
        self.current_price = price;
        self.unrealized_pnl = self.pnl_at(price);
        self.last_updated = now;
    }

    /// Gross P&L if the whole position were closed at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.size * self.side.sign()
    }

    /// Move the trailing stop to `candidate` only if that reduces risk.
    ///
    /// Long stops only rise and short stops only fall. Returns whether the
    /// stop moved.
    pub fn ratchet_trailing_stop(&mut self, candidate: Decimal) -> bool {
        let tighter = match (self.trailing_stop_price, self.side) {
            (None, _) => true,
            (Some(current), PositionSide::Long) => candidate > current,
            (Some(current), PositionSide::Short) => candidate < current,
        };

        if tighter {
            self.trailing_stop_price = Some(candidate);
            self.trailing_stop_active = true;
            if self.state == PositionState::Open {
                self.state = PositionState::Trailing;
            }
        }
        tighter
    }

    /// Split off the part of a `PendingExit` position that a partial exit
    /// fill sold. The sold part takes its pro-rata share of the committed
    /// notional and entry fee; `self` keeps the rest and returns to its held
    /// state.
    pub fn split_exit_fill(&mut self, filled: Decimal, now: DateTime<Utc>) -> Result<Position, InvariantViolation> {
        self.expect_state(PositionState::PendingExit, "pending_exit")?;
        if filled <= Decimal::ZERO || filled >= self.size {
            return Err(InvariantViolation::OutOfRange(format!(
                "partial fill {} of {} for position {}",
                filled, self.size, self.id
            )));
        }

        let committed = self.committed_notional * filled / self.size;
        let fee = self.entry_fee * filled / self.size;

        let mut sold = self.clone();
        sold.size = filled;
        sold.committed_notional = committed;
        sold.entry_fee = fee;

        self.size -= filled;
        self.committed_notional -= committed;
        self.entry_fee -= fee;
        self.abandon_exit(now)?;
        self.mark_price(self.current_price, now);
        Ok(sold)
    }

    fn expect_state(&self, expected: PositionState, label: &'static str) -> Result<(), InvariantViolation> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.transition_error(label))
        }
    }

    fn transition_error(&self, expected: &'static str) -> InvariantViolation {
        InvariantViolation::InvalidTransition {
            id: self.id.clone(),
            actual: self.state.to_string(),
            expected,
        }
    }
}
