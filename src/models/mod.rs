//! Data models: candles, snapshots, signals, positions and trades.

mod candle;
mod market;
mod position;
mod signal;
mod trade;

pub use candle::{validate_series, Candle};
pub use market::MarketSnapshot;
pub use position::{Entry, FundingPayment, Position, PositionState, StopMode};
pub use signal::{to_price, AiAssessment, Direction, Signal, SizingMode, StrategyId};
pub use trade::{ExitReason, TradeRecord};

#[cfg(test)]
pub(crate) use market::fixtures;
#[cfg(test)]
pub(crate) use signal::AiDirection;
