//! Data models for instruments, positions, closed trades, budget and signals.

mod budget;
mod instrument;
mod metrics;
mod position;
mod signal;
mod trade;

pub use budget::Budget;
pub use instrument::{AssetClass, Instrument};
pub use metrics::PerformanceMetrics;
pub use position::{Position, PositionSide, PositionState};
pub use signal::{SignalCategory, SignalInputs, SignalSet, SCORE_MAX, SCORE_MIN};
pub use trade::{ExitReason, TradeRecord};
