//! Trading configuration and strategy profiles.

use std::fmt;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Risk profile selecting the ATR multipliers for exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StrategyProfile {
    Conservative,
    Balanced,
    Aggressive,
}

/// Exit distances in multiples of ATR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileMultipliers {
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
    /// Favorable move required before the trailing stop engages
    pub trailing_activation: Decimal,
    /// Distance of the trailing stop behind price
    pub trailing_distance: Decimal,
}

impl StrategyProfile {
    pub fn multipliers(&self) -> ProfileMultipliers {
        match self {
            StrategyProfile::Conservative => ProfileMultipliers {
                take_profit: dec!(1.5),
                stop_loss: dec!(1.0),
                trailing_activation: dec!(1.0),
                trailing_distance: dec!(1.0),
            },
            StrategyProfile::Balanced => ProfileMultipliers {
                take_profit: dec!(2.0),
                stop_loss: dec!(1.25),
                trailing_activation: dec!(1.0),
                trailing_distance: dec!(1.5),
            },
            StrategyProfile::Aggressive => ProfileMultipliers {
                take_profit: dec!(2.5),
                stop_loss: dec!(1.5),
                trailing_activation: dec!(1.5),
                trailing_distance: dec!(2.0),
            },
        }
    }
}

impl fmt::Display for StrategyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyProfile::Conservative => "conservative",
            StrategyProfile::Balanced => "balanced",
            StrategyProfile::Aggressive => "aggressive",
        };
        f.write_str(name)
    }
}

/// How a Kelly estimate from our own history feeds into sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum KellyMode {
    /// Ignore Kelly
    Off,
    /// Weighted mix of the volatility-based size and the Kelly size
    Blend { weight: Decimal },
    /// Use the Kelly size alone
    Replace,
}

/// Configuration for sizing, entry filters and fees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub profile: StrategyProfile,

    // === Sizing ===
    /// Fraction of available budget at full confidence and target volatility
    pub base_fraction: Decimal,

    /// ATR / price the base fraction is calibrated for
    pub target_volatility: Decimal,

    /// Bounds for the volatility scaling factor
    pub min_volatility_scale: Decimal,
    pub max_volatility_scale: Decimal,

    /// Fraction used when no ATR is available
    pub fallback_fraction: Decimal,

    /// Maximum share of available budget for a single position
    pub max_position_fraction: Decimal,

    /// Orders below this notional are not placed
    pub min_order_notional: Decimal,

    pub kelly_mode: KellyMode,

    /// Fraction of full Kelly to use (0.25 = quarter Kelly)
    pub kelly_multiplier: Decimal,

    /// Closed trades needed before Kelly is trusted
    pub kelly_min_trades: u32,

    // === Entry filters ===
    /// Expected take-profit gain minus round-trip fees must reach this
    pub min_profit_after_fees: Decimal,

    /// Maximum bid/ask spread as a fraction of mid
    pub max_spread_pct: Decimal,

    pub max_concurrent_positions: usize,

    /// Open short positions where the asset class supports it
    pub allow_short: bool,

    /// Aggregated signals weaker than this are ignored
    pub neutrality_threshold: f64,

    /// Entry orders still working after this many seconds are cancelled
    pub pending_entry_timeout_secs: u64,

    // === Fees ===
    /// Fixed fee per order
    pub fee_fixed: Decimal,

    /// Percentage fee per order on notional
    pub fee_pct: Decimal,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            profile: StrategyProfile::Balanced,

            base_fraction: dec!(0.10),        // 10% at full confidence
            target_volatility: dec!(0.02),    // 2% daily ATR
            min_volatility_scale: dec!(0.25),
            max_volatility_scale: dec!(2.0),
            fallback_fraction: dec!(0.05),
            max_position_fraction: dec!(0.25),
            min_order_notional: dec!(25),
            kelly_mode: KellyMode::Blend { weight: dec!(0.5) },
            kelly_multiplier: dec!(0.25),     // Quarter Kelly
            kelly_min_trades: 20,

            min_profit_after_fees: dec!(1.0),
            max_spread_pct: dec!(0.01),       // 1% spread
            max_concurrent_positions: 5,
            allow_short: false,
            neutrality_threshold: 0.15,
            pending_entry_timeout_secs: 300,

            fee_fixed: dec!(1.0),
            fee_pct: Decimal::ZERO,
        }
    }
}
