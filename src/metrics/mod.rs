//! Performance statistics over the trade history.

mod calculator;

pub use calculator::MetricsCalculator;
