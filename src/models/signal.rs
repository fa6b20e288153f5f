//! Candidate entries and externally supplied assessments.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Side of a position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Whether `candidate` protects the position better than `current`.
    pub fn is_tighter(&self, candidate: Decimal, current: Decimal) -> bool {
        match self {
            Direction::Long => candidate > current,
            Direction::Short => candidate < current,
        }
    }
}

/// Which strategy produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyId {
    Pullback,
    Breakout,
    Ranging,
    Ai,
}

impl StrategyId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyId::Pullback => "pullback",
            StrategyId::Breakout => "breakout",
            StrategyId::Ranging => "ranging",
            StrategyId::Ai => "ai",
        }
    }
}

/// How the order quantity is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    /// Risk a fixed share of equity between entry and stop
    RiskPercent,
    /// Spend a configured notional regardless of stop distance
    FixedNotional,
}

/// A candidate entry, consumed within the cycle that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub strategy: StrategyId,
    pub direction: Direction,
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Option<Decimal>,
    pub sizing: SizingMode,
    /// 0-100, only set for analyst signals
    pub confidence: Option<f64>,
    /// Open time of the bar the signal was computed on
    pub bar_time: DateTime<Utc>,
}

impl Signal {
    /// Stop below entry for longs (above for shorts), target on the other side.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.entry <= Decimal::ZERO || self.stop <= Decimal::ZERO {
            return Err(ValidationError::Signal(format!(
                "{} signal has non-positive prices",
                self.strategy.as_str()
            )));
        }
        if !self.direction.is_tighter(self.entry, self.stop) {
            return Err(ValidationError::Signal(format!(
                "{} stop {} is on the wrong side of entry {}",
                self.strategy.as_str(),
                self.stop,
                self.entry
            )));
        }
        if let Some(target) = self.target {
            if !self.direction.is_tighter(target, self.entry) {
                return Err(ValidationError::Signal(format!(
                    "{} target {} is on the wrong side of entry {}",
                    self.strategy.as_str(),
                    target,
                    self.entry
                )));
            }
        }
        Ok(())
    }

    /// Distance between entry and stop per unit.
    pub fn risk_per_unit(&self) -> Decimal {
        (self.entry - self.stop).abs()
    }

    /// Reward over risk, when a target is known.
    pub fn reward_risk(&self) -> Option<Decimal> {
        let risk = self.risk_per_unit();
        if risk.is_zero() {
            return None;
        }
        self.target.map(|t| (t - self.entry).abs() / risk)
    }
}

/// Directional call from the analyst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiDirection {
    Long,
    Short,
    Neutral,
}

/// Structured output of the external analyst.
///
/// Field aliases accept the `signal`/`reason`/`suggested_*` shape the analyst
/// process writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiAssessment {
    #[serde(alias = "signal")]
    pub direction: AiDirection,

    /// 0-100
    #[serde(default)]
    pub confidence: f64,

    #[serde(default, alias = "suggested_entry_price")]
    pub entry: Option<Decimal>,

    #[serde(default, alias = "suggested_stop_loss")]
    pub stop: Option<Decimal>,

    #[serde(default, alias = "suggested_take_profit")]
    pub target: Option<Decimal>,

    #[serde(default, alias = "reason")]
    pub rationale: String,

    /// When the analyst produced it
    #[serde(default = "Utc::now")]
    pub produced_at: DateTime<Utc>,
}

impl AiAssessment {
    pub fn neutral(rationale: impl Into<String>) -> Self {
        Self {
            direction: AiDirection::Neutral,
            confidence: 0.0,
            entry: None,
            stop: None,
            target: None,
            rationale: rationale.into(),
            produced_at: Utc::now(),
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        match self.direction {
            AiDirection::Long => Some(Direction::Long),
            AiDirection::Short => Some(Direction::Short),
            AiDirection::Neutral => None,
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.direction == AiDirection::Neutral
    }
}

/// Convert an indicator-space price into a decimal price.
pub fn to_price(value: f64) -> Option<Decimal> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    Decimal::from_f64(value).map(|d| d.round_dp(8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_signal(stop: Decimal, target: Option<Decimal>) -> Signal {
        Signal {
            strategy: StrategyId::Pullback,
            direction: Direction::Long,
            entry: dec!(100),
            stop,
            target,
            sizing: SizingMode::RiskPercent,
            confidence: None,
            bar_time: Utc::now(),
        }
    }

    #[test]
    fn test_signal_side_checks() {
        assert!(long_signal(dec!(98), Some(dec!(104))).validate().is_ok());
        assert!(long_signal(dec!(101), None).validate().is_err());
        assert!(long_signal(dec!(98), Some(dec!(99))).validate().is_err());
    }

    #[test]
    fn test_reward_risk() {
        let signal = long_signal(dec!(98), Some(dec!(105)));
        assert_eq!(signal.reward_risk(), Some(dec!(2.5)));
        assert_eq!(long_signal(dec!(98), None).reward_risk(), None);
    }

    #[test]
    fn test_assessment_accepts_analyst_field_names() {
        let json = r#"{
            "signal": "short",
            "reason": "lower highs into resistance",
            "confidence": 72,
            "suggested_entry_price": "101.5",
            "suggested_stop_loss": "103",
            "suggested_take_profit": "97"
        }"#;
        let a: AiAssessment = serde_json::from_str(json).unwrap();
        assert_eq!(a.direction(), Some(Direction::Short));
        assert_eq!(a.entry, Some(dec!(101.5)));
        assert_eq!(a.rationale, "lower highs into resistance");
    }

    #[test]
    fn test_to_price_rejects_nan() {
        assert_eq!(to_price(f64::NAN), None);
        assert_eq!(to_price(-1.0), None);
        assert_eq!(to_price(97.5), Some(dec!(97.5)));
    }
}
