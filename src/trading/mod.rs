//! Decision core: regime, entry strategies, analyst arbitration, sizing
//! and the position lifecycle.

mod arbiter;
mod config;
mod performance;
mod position_manager;
mod position_sizer;
mod signals;
mod trend;

pub use arbiter::{
    AiArbiter, AiTriggerState, ShadowLedger, ShadowOutcome, ShadowTrade, TriggerReason,
};
pub use config::{EngineConfig, IndicatorConfig, MarginMode, RuntimeConfig};
pub use performance::{DynamicParams, InterpolatedPolicy, PerformancePolicy, StaticPolicy};
pub use position_manager::{DefensiveTrigger, PositionManager, StopMove};
pub use position_sizer::RiskSizer;
pub use signals::{BreakoutState, SignalGenerator};
pub use trend::{Trend, TrendClassifier, TrendState};

#[cfg(test)]
pub(crate) use config::ArbiterConfig;
