//! Budget growth policies applied once per cycle after exits.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::Budget;

pub trait CompoundingPolicy: Send + Sync {
    /// Grow the budget from this cycle's net realized P&L.
    /// Returns the amount added to the cap.
    fn apply(&self, budget: &mut Budget, realized_this_cycle: Decimal) -> Decimal;

    fn name(&self) -> &'static str;
}

/// Profits beyond the initial budget stay banked.
pub struct NoCompounding;

impl CompoundingPolicy for NoCompounding {
    fn apply(&self, _budget: &mut Budget, _realized_this_cycle: Decimal) -> Decimal {
        Decimal::ZERO
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Moves `rate` of each cycle's net profit from banked profit into the cap,
/// up to `max_budget`.
#[derive(Debug, Clone)]
pub struct RateCompounding {
    pub rate: Decimal,
    pub max_budget: Decimal,
    /// Skip a cycle whose net result was a loss
    pub pause_after_loss: bool,
}

impl CompoundingPolicy for RateCompounding {
    fn apply(&self, budget: &mut Budget, realized_this_cycle: Decimal) -> Decimal {
        budget.max_budget = Some(self.max_budget.max(budget.initial));

        if realized_this_cycle < Decimal::ZERO && self.pause_after_loss {
            debug!(realized = %realized_this_cycle, "Compounding paused after a losing cycle");
            return Decimal::ZERO;
        }
        if realized_this_cycle <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let requested = realized_this_cycle * self.rate.clamp(Decimal::ZERO, Decimal::ONE);
        let moved = budget.compound(requested);
        if moved > Decimal::ZERO {
            info!(added = %moved, cap = %budget.cap, "Compounded profit into budget");
        }
        moved
    }

    fn name(&self) -> &'static str {
        "rate"
    }
}

/// Persisted compounding configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompoundingSettings {
    /// Share of each cycle's profit to compound; `None` disables compounding
    pub rate: Option<Decimal>,
    pub max_budget: Option<Decimal>,
    #[serde(default)]
    pub pause_after_loss: bool,
}

impl CompoundingSettings {
    pub fn policy(&self) -> Box<dyn CompoundingPolicy> {
        match (self.rate, self.max_budget) {
            (Some(rate), Some(max_budget)) if rate > Decimal::ZERO => Box::new(RateCompounding {
                rate,
                max_budget,
                pause_after_loss: self.pause_after_loss,
            }),
            _ => Box::new(NoCompounding),
        }
    }
}
