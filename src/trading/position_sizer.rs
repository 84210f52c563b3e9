//! Position sizing: confidence and volatility scaling with an optional Kelly input.

use rust_decimal::Decimal;
use tracing::debug;

use super::config::{KellyMode, TradingConfig};
use crate::error::InvariantViolation;

/// Calculator for entry notionals.
pub struct PositionSizer {
    config: TradingConfig,
}

impl PositionSizer {
    pub fn new(config: TradingConfig) -> Self {
        Self { config }
    }

    /// Notional to commit to a new position.
    ///
    /// # Arguments
    /// * `confidence` - Aggregated signal confidence in [0, 1]
    /// * `atr` - Average True Range in price units; non-positive means unknown
    /// * `price` - Expected entry price
    /// * `available` - Uncommitted budget
    /// * `kelly` - Kelly fraction estimated from our own closed trades
    ///
    /// # Returns
    /// Notional in budget currency, zero when the trade is too small
    pub fn size(
        &self,
        confidence: f64,
        atr: Decimal,
        price: Decimal,
        available: Decimal,
        kelly: Option<f64>,
    ) -> Result<Decimal, InvariantViolation> {
        if price <= Decimal::ZERO {
            return Err(InvariantViolation::OutOfRange(format!(
                "price must be positive, got {}",
                price
            )));
        }
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(InvariantViolation::OutOfRange(format!(
                "confidence must be within [0, 1], got {}",
                confidence
            )));
        }
        if available <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }

        let confidence = Decimal::try_from(confidence)
            .map_err(|_| InvariantViolation::OutOfRange("confidence".to_string()))?;

        let base = if atr > Decimal::ZERO {
            available * self.config.base_fraction * confidence * self.volatility_scale(atr, price)
        } else {
            debug!("No ATR available, using fallback fraction");
            available * self.config.fallback_fraction * confidence
        };

        let sized = match (self.config.kelly_mode, kelly) {
            (KellyMode::Off, _) | (_, None) => base,
            (KellyMode::Blend { weight }, Some(k)) => {
                let weight = weight.clamp(Decimal::ZERO, Decimal::ONE);
                base * (Decimal::ONE - weight) + self.kelly_notional(k, available) * weight
            }
            (KellyMode::Replace, Some(k)) => self.kelly_notional(k, available),
        };

        Ok(self.apply_constraints(sized, available))
    }

    /// `target_volatility / (atr / price)`, clamped to the configured bounds.
    fn volatility_scale(&self, atr: Decimal, price: Decimal) -> Decimal {
        let volatility = atr / price;
        (self.config.target_volatility / volatility).clamp(
            self.config.min_volatility_scale,
            self.config.max_volatility_scale,
        )
    }

    fn kelly_notional(&self, kelly: f64, available: Decimal) -> Decimal {
        let kelly = Decimal::try_from(kelly.clamp(0.0, 1.0)).unwrap_or(Decimal::ZERO);
        available * kelly * self.config.kelly_multiplier
    }

    fn apply_constraints(&self, size: Decimal, available: Decimal) -> Decimal {
        let max_position = available * self.config.max_position_fraction;
        let final_size = size.min(max_position).min(available).max(Decimal::ZERO).round_dp(2);

        if final_size < self.config.min_order_notional {
            return Decimal::ZERO;
        }
        final_size
    }
}
