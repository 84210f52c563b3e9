//! Trading budget and its accounting rules.
//!
//! `remaining` is free cash the bot may commit. Committed notional lives on
//! the positions; the position store checks `remaining + committed <= cap`
//! after every mutation.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::InvariantViolation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    /// Budget the bot was started with
    pub initial: Decimal,

    /// Uncommitted budget available for new entries
    pub remaining: Decimal,

    pub currency: String,

    /// Current ceiling for `remaining + committed`. Equal to `initial`
    /// unless a compounding policy has raised it.
    pub cap: Decimal,

    /// Hard ceiling a compounding policy may raise `cap` to
    #[serde(default)]
    pub max_budget: Option<Decimal>,

    /// Realized profit that did not fit under `cap`
    #[serde(default)]
    pub banked_profit: Decimal,

    /// Losses that exceeded the released amount (e.g. a short moving
    /// beyond its reserved notional). Recorded instead of driving
    /// `remaining` negative.
    #[serde(default)]
    pub uncovered_loss: Decimal,
}

/// Where a released amount ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Release {
    pub returned: Decimal,
    pub banked: Decimal,
    pub uncovered: Decimal,
}

impl Budget {
    pub fn new(initial: Decimal, currency: impl Into<String>) -> Self {
        Self {
            initial,
            remaining: initial,
            currency: currency.into(),
            cap: initial,
            max_budget: None,
            banked_profit: Decimal::ZERO,
            uncovered_loss: Decimal::ZERO,
        }
    }

    pub fn with_max_budget(mut self, max_budget: Decimal) -> Self {
        self.max_budget = Some(max_budget.max(self.initial));
        self
    }

    /// Take `amount` out of `remaining` for a new position.
    pub fn reserve(&mut self, amount: Decimal) -> Result<(), InvariantViolation> {
        if amount <= Decimal::ZERO {
            return Err(InvariantViolation::OutOfRange(format!(
                "reservation must be positive, got {}",
                amount
            )));
        }
        if amount > self.remaining {
            return Err(InvariantViolation::InsufficientBudget {
                remaining: self.remaining,
                requested: amount,
            });
        }
        self.remaining -= amount;
        Ok(())
    }

    /// Return a reservation that never turned into a position.
    pub fn cancel_reservation(&mut self, amount: Decimal) {
        self.remaining += amount;
    }

    /// Return a closed position's committed notional plus its realized P&L.
    ///
    /// `committed_after` is the notional still committed to other positions.
    /// Anything above the cap is banked; a loss deeper than the released
    /// amount is recorded as uncovered.
    pub fn release(&mut self, committed: Decimal, realized_pnl: Decimal, committed_after: Decimal) -> Release {
        let amount = committed + realized_pnl;
        let mut release = Release::default();

        if amount < Decimal::ZERO {
            let shortfall = -amount;
            let covered = shortfall.min(self.remaining);
            self.remaining -= covered;
            release.uncovered = shortfall - covered;
            if release.uncovered > Decimal::ZERO {
                self.uncovered_loss += release.uncovered;
                warn!(uncovered = %release.uncovered, "Loss exceeded available budget");
            }
            return release;
        }

        let headroom = (self.cap - committed_after - self.remaining).max(Decimal::ZERO);
        release.returned = amount.min(headroom);
        release.banked = amount - release.returned;
        self.remaining += release.returned;

        if release.banked > Decimal::ZERO {
            self.banked_profit += release.banked;
            info!(banked = %release.banked, cap = %self.cap, "Profit above budget cap banked");
        }
        release
    }

    /// Raise the cap by up to `amount`, bounded by `max_budget`, moving the
    /// same amount from banked profit into `remaining`. Returns the amount
    /// actually moved.
    pub fn compound(&mut self, amount: Decimal) -> Decimal {
        let Some(max_budget) = self.max_budget else {
            return Decimal::ZERO;
        };
        let room = (max_budget - self.cap).max(Decimal::ZERO);
        let moved = amount.min(room).min(self.banked_profit).max(Decimal::ZERO);

        self.cap += moved;
        self.remaining += moved;
        self.banked_profit -= moved;
        moved
    }

    /// Check `0 <= remaining` and `remaining + committed <= cap`.
    pub fn check(&self, committed: Decimal) -> Result<(), InvariantViolation> {
        if self.remaining < Decimal::ZERO {
            return Err(InvariantViolation::InsufficientBudget {
                remaining: self.remaining,
                requested: Decimal::ZERO,
            });
        }
        if self.remaining + committed > self.cap {
            return Err(InvariantViolation::BudgetCapExceeded {
                remaining: self.remaining,
                committed,
                cap: self.cap,
            });
        }
        Ok(())
    }
}
