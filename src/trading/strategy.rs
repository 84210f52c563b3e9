//! Trading strategy with entry filters and ATR-based exits.
//!
//! This module defines the rules for:
//! - Dynamic stop-loss and take-profit levels from entry price and the latest ATR
//! - Trailing stop activation and its one-way ratchet
//! - Entry filters on spread and expected profit after fees

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::{ProfileMultipliers, TradingConfig};
use crate::api::Quote;
use crate::models::{ExitReason, Position, PositionSide};

/// Per-order fee: fixed plus a percentage of notional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeModel {
    pub fixed: Decimal,
    pub pct: Decimal,
}

impl FeeModel {
    pub fn fee(&self, notional: Decimal) -> Decimal {
        self.fixed + notional.abs() * self.pct
    }

    /// Entry plus exit fee for a position of `notional`.
    pub fn round_trip(&self, notional: Decimal) -> Decimal {
        self.fee(notional) * Decimal::TWO
    }
}

/// Result of entry validation.
#[derive(Debug, Clone)]
pub struct EntryValidation {
    pub allowed: bool,
    pub reason: String,
}

impl EntryValidation {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: "Entry conditions met".to_string(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Exit signal with the level that was crossed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub trigger: Decimal,
    pub price: Decimal,
}

/// Trading strategy engine.
pub struct Strategy {
    multipliers: ProfileMultipliers,
    fees: FeeModel,
    max_spread_pct: Decimal,
    min_profit_after_fees: Decimal,
}

impl Strategy {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            multipliers: config.profile.multipliers(),
            fees: FeeModel {
                fixed: config.fee_fixed,
                pct: config.fee_pct,
            },
            max_spread_pct: config.max_spread_pct,
            min_profit_after_fees: config.min_profit_after_fees,
        }
    }

    pub fn fees(&self) -> &FeeModel {
        &self.fees
    }

    /// Stop-loss and take-profit for a position entered at `entry`.
    pub fn levels(&self, side: PositionSide, entry: Decimal, atr: Decimal) -> (Decimal, Decimal) {
        let sign = side.sign();
        let stop_loss = entry - sign * self.multipliers.stop_loss * atr;
        let take_profit = entry + sign * self.multipliers.take_profit * atr;
        (stop_loss, take_profit)
    }

    // ==================== Exit Management ====================

    /// Mark `position` at `price` and recompute its exit levels.
    ///
    /// Levels are derived from the entry price and the latest ATR; a
    /// non-positive `atr` keeps the previous one. Once price has moved
    /// `trailing_activation × ATR` into profit the trailing stop follows at
    /// `trailing_distance × ATR`, never loosening. Returns whether the
    /// trailing stop moved.
    pub fn update_levels(
        &self,
        position: &mut Position,
        price: Decimal,
        atr: Decimal,
        now: DateTime<Utc>,
    ) -> bool {
        if atr > Decimal::ZERO {
            position.current_atr = atr;
        }
        let atr = position.current_atr;

        let (stop_loss, take_profit) = self.levels(position.side, position.entry_price, atr);
        position.dynamic_stop_loss = stop_loss;
        position.dynamic_take_profit = take_profit;
        position.mark_price(price, now);

        if atr <= Decimal::ZERO {
            return false;
        }

        let sign = position.side.sign();
        let favorable_move = (price - position.entry_price) * sign;
        if favorable_move < self.multipliers.trailing_activation * atr {
            return false;
        }

        let candidate = price - sign * self.multipliers.trailing_distance * atr;
        let moved = position.ratchet_trailing_stop(candidate);
        if moved {
            debug!(
                position_id = %position.id,
                trailing_stop = %candidate,
                "Trailing stop tightened"
            );
        }
        moved
    }

    /// First exit level crossed at `price`: stop-loss, then trailing stop,
    /// then take-profit.
    pub fn check_exit(&self, position: &Position, price: Decimal) -> Option<ExitSignal> {
        let crossed_down = |level: Decimal| match position.side {
            PositionSide::Long => price <= level,
            PositionSide::Short => price >= level,
        };

        if crossed_down(position.dynamic_stop_loss) {
            return Some(ExitSignal {
                reason: ExitReason::StopLoss,
                trigger: position.dynamic_stop_loss,
                price,
            });
        }

        if let Some(trailing) = position.trailing_stop_price.filter(|_| position.trailing_stop_active) {
            if crossed_down(trailing) {
                return Some(ExitSignal {
                    reason: ExitReason::TrailingStop,
                    trigger: trailing,
                    price,
                });
            }
        }

        let reached_target = match position.side {
            PositionSide::Long => price >= position.dynamic_take_profit,
            PositionSide::Short => price <= position.dynamic_take_profit,
        };
        if reached_target {
            return Some(ExitSignal {
                reason: ExitReason::TakeProfit,
                trigger: position.dynamic_take_profit,
                price,
            });
        }

        None
    }

    // ==================== Entry Validation ====================

    /// Check spread and expected profit for an entry of `notional` at `quote`.
    pub fn validate_entry(&self, side: PositionSide, quote: &Quote, notional: Decimal, atr: Decimal) -> EntryValidation {
        let Some(spread) = quote.spread_pct() else {
            return EntryValidation::deny("No valid quote");
        };
        if spread > self.max_spread_pct {
            return EntryValidation::deny(format!(
                "Spread too wide: {:.4} > {}",
                spread, self.max_spread_pct
            ));
        }

        let price = match side {
            PositionSide::Long => quote.ask,
            PositionSide::Short => quote.bid,
        };
        if price <= Decimal::ZERO {
            return EntryValidation::deny("Non-positive entry price");
        }
        if atr <= Decimal::ZERO {
            return EntryValidation::deny("No ATR to place exits");
        }

        let quantity = notional / price;
        let expected_gain = self.multipliers.take_profit * atr * quantity;
        let net = expected_gain - self.fees.round_trip(notional);
        if net < self.min_profit_after_fees {
            return EntryValidation::deny(format!(
                "Expected profit after fees too small: {:.2} < {}",
                net, self.min_profit_after_fees
            ));
        }

        EntryValidation::allow()
    }
}
