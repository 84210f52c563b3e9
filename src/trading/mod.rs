//! Trading logic: signal aggregation, position sizing, strategy, positions and budget.

mod aggregator;
mod compounding;
mod config;
mod market_hours;
mod position_sizer;
mod position_store;
mod signals;
mod strategy;

pub use aggregator::{CategoryWeights, SignalAggregator, SignalDirection};
pub use compounding::{CompoundingPolicy, CompoundingSettings};
pub use config::{StrategyProfile, TradingConfig};
pub use market_hours::MarketCalendar;
pub use position_sizer::PositionSizer;
pub use position_store::PositionStore;
pub use signals::{HttpSignalProvider, SignalProvider};
pub use strategy::Strategy;

#[cfg(test)]
pub(crate) use signals::testing::StaticSignals;
