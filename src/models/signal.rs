//! Indicator signal categories and per-instrument signal sets.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lowest and highest score a category may carry.
pub const SCORE_MIN: f64 = -3.0;
pub const SCORE_MAX: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    Momentum,
    Trend,
    Volatility,
    Volume,
    SupportResistance,
    Pattern,
}

impl SignalCategory {
    pub const ALL: [SignalCategory; 6] = [
        SignalCategory::Momentum,
        SignalCategory::Trend,
        SignalCategory::Volatility,
        SignalCategory::Volume,
        SignalCategory::SupportResistance,
        SignalCategory::Pattern,
    ];
}

impl fmt::Display for SignalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalCategory::Momentum => "momentum",
            SignalCategory::Trend => "trend",
            SignalCategory::Volatility => "volatility",
            SignalCategory::Volume => "volume",
            SignalCategory::SupportResistance => "support_resistance",
            SignalCategory::Pattern => "pattern",
        };
        f.write_str(name)
    }
}

impl FromStr for SignalCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SignalCategory::ALL
            .into_iter()
            .find(|c| c.to_string() == s)
            .ok_or_else(|| format!("unknown signal category: {}", s))
    }
}

/// Category scores for one instrument. A category may be absent or null
/// when its indicators could not be computed.
///
/// Categories this build does not know are dropped on deserialization, so a
/// signal source may add new ones without breaking older readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Option<f64>>",
    into = "BTreeMap<SignalCategory, Option<f64>>"
)]
pub struct SignalSet {
    scores: BTreeMap<SignalCategory, Option<f64>>,
}

impl From<BTreeMap<String, Option<f64>>> for SignalSet {
    fn from(raw: BTreeMap<String, Option<f64>>) -> Self {
        let mut set = SignalSet::default();
        for (key, score) in raw {
            match key.parse() {
                Ok(category) => set.set(category, score),
                Err(_) => debug!(category = %key, "Skipping unknown signal category"),
            }
        }
        set
    }
}

impl From<SignalSet> for BTreeMap<SignalCategory, Option<f64>> {
    fn from(set: SignalSet) -> Self {
        set.scores
    }
}

impl SignalSet {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with(mut self, category: SignalCategory, score: f64) -> Self {
        self.scores.insert(category, Some(score));
        self
    }

    pub fn set(&mut self, category: SignalCategory, score: Option<f64>) {
        self.scores.insert(category, score);
    }

    /// Score for `category` if present and finite.
    pub fn get(&self, category: SignalCategory) -> Option<f64> {
        self.scores
            .get(&category)
            .copied()
            .flatten()
            .filter(|s| s.is_finite())
    }

    pub fn is_empty(&self) -> bool {
        SignalCategory::ALL.iter().all(|c| self.get(*c).is_none())
    }
}

/// Everything the signal source reports for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInputs {
    pub signals: SignalSet,

    /// Average True Range in price units
    pub atr: Decimal,
}
