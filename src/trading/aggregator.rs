//! Combines category scores into one directional confidence.
//!
//! Categories without a score are left out of both the weighted sum and the
//! weight total, so a missing indicator neither dilutes nor biases the result.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{SignalCategory, SignalSet, SCORE_MAX, SCORE_MIN};

/// Weight per signal category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryWeights(BTreeMap<SignalCategory, f64>);

impl CategoryWeights {
    pub fn weight(&self, category: SignalCategory) -> f64 {
        self.0.get(&category).copied().unwrap_or(0.0).max(0.0)
    }

    pub fn with(mut self, category: SignalCategory, weight: f64) -> Self {
        self.0.insert(category, weight);
        self
    }
}

impl Default for CategoryWeights {
    fn default() -> Self {
        Self(BTreeMap::from([
            (SignalCategory::Momentum, 0.25),
            (SignalCategory::Trend, 0.30),
            (SignalCategory::Volatility, 0.15),
            (SignalCategory::Volume, 0.15),
            (SignalCategory::SupportResistance, 0.10),
            (SignalCategory::Pattern, 0.05),
        ]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDirection {
    Long,
    Short,
    NoTrade,
}

impl fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalDirection::Long => write!(f, "LONG"),
            SignalDirection::Short => write!(f, "SHORT"),
            SignalDirection::NoTrade => write!(f, "NO_TRADE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSignal {
    /// Weighted mean score in [-3, 3]
    pub score: f64,

    /// `score / 3`, in [-1, 1]
    pub normalized: f64,

    /// `|normalized|`, in [0, 1]
    pub confidence: f64,

    pub direction: SignalDirection,

    /// Number of categories that contributed
    pub categories: usize,
}

impl AggregatedSignal {
    fn no_trade() -> Self {
        Self {
            score: 0.0,
            normalized: 0.0,
            confidence: 0.0,
            direction: SignalDirection::NoTrade,
            categories: 0,
        }
    }
}

pub struct SignalAggregator {
    weights: CategoryWeights,
    neutrality_threshold: f64,
}

impl Default for SignalAggregator {
    fn default() -> Self {
        Self::new(CategoryWeights::default(), 0.15)
    }
}

impl SignalAggregator {
    pub fn new(weights: CategoryWeights, neutrality_threshold: f64) -> Self {
        Self {
            weights,
            neutrality_threshold,
        }
    }

    pub fn aggregate(&self, signals: &SignalSet) -> AggregatedSignal {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut categories = 0;

        for category in SignalCategory::ALL {
            let Some(score) = signals.get(category) else {
                continue;
            };
            let weight = self.weights.weight(category);
            if weight == 0.0 {
                continue;
            }
            weighted_sum += score.clamp(SCORE_MIN, SCORE_MAX) * weight;
            weight_total += weight;
            categories += 1;
        }

        if categories == 0 || weight_total <= 0.0 {
            return AggregatedSignal::no_trade();
        }

        let score = weighted_sum / weight_total;
        let normalized = (score / SCORE_MAX).clamp(-1.0, 1.0);

        let direction = if normalized.abs() < self.neutrality_threshold {
            SignalDirection::NoTrade
        } else if normalized > 0.0 {
            SignalDirection::Long
        } else {
            SignalDirection::Short
        };

        AggregatedSignal {
            score,
            normalized,
            confidence: normalized.abs(),
            direction,
            categories,
        }
    }
}
