//! Performance feedback: recent trade quality steers the tunable parameters
//! between an aggressive and a defensive set.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::config::PerformanceConfig;
use crate::metrics::TradeStats;
use crate::models::TradeRecord;

/// Parameters recomputed from performance, passed into each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DynamicParams {
    /// Widening of the EMA pullback band, percent of price per side
    pub pullback_zone_pct: f64,
    /// ATR multiple for initial stops, trailing and pyramid re-anchoring
    pub atr_multiplier: f64,
    /// Profit in R that unlocks the next pyramid add
    pub pyramid_trigger_r: f64,
}

impl DynamicParams {
    /// `defensive + (aggressive - defensive) * score`, score clamped to [0, 1].
    pub fn interpolate(defensive: &Self, aggressive: &Self, score: f64) -> Self {
        let s = score.clamp(0.0, 1.0);
        let lerp = |d: f64, a: f64| d + (a - d) * s;
        Self {
            pullback_zone_pct: lerp(defensive.pullback_zone_pct, aggressive.pullback_zone_pct),
            atr_multiplier: lerp(defensive.atr_multiplier, aggressive.atr_multiplier),
            pyramid_trigger_r: lerp(defensive.pyramid_trigger_r, aggressive.pyramid_trigger_r),
        }
    }
}

/// Maps closed-trade history to the parameters used next.
pub trait PerformancePolicy: Send + Sync {
    /// `trades` is oldest first.
    fn params(&self, trades: &[TradeRecord]) -> DynamicParams;
}

/// Fixed parameters regardless of history. Used when performance feedback
/// is disabled.
#[derive(Debug, Clone)]
pub struct StaticPolicy(pub DynamicParams);

impl PerformancePolicy for StaticPolicy {
    fn params(&self, _trades: &[TradeRecord]) -> DynamicParams {
        self.0
    }
}

/// Interpolates between the configured sets by a 0..1 health score.
#[derive(Debug, Clone)]
pub struct InterpolatedPolicy {
    config: PerformanceConfig,
    starting_equity: Decimal,
}

impl InterpolatedPolicy {
    pub fn new(config: PerformanceConfig, starting_equity: Decimal) -> Self {
        Self {
            config,
            starting_equity,
        }
    }

    /// Health score, or `None` when history is too thin to judge.
    pub fn health_score(&self, trades: &[TradeRecord]) -> Option<f64> {
        let start = trades.len().saturating_sub(self.config.lookback_trades);
        let window = &trades[start..];
        if window.len() < self.config.min_trades {
            return None;
        }

        let stats = TradeStats::calculate(window, self.starting_equity);
        if stats.winning_trades == 0 || stats.losing_trades == 0 {
            return None;
        }
        let payoff = stats.payoff_ratio?;

        let payoff_term = sigmoid(2.0 * (payoff - 1.5).clamp(-5.0, 5.0));
        let score = self.config.weight_win_rate * stats.win_rate
            + self.config.weight_payoff * payoff_term
            + self.config.weight_drawdown * (1.0 - stats.max_drawdown);
        Some(score.clamp(0.0, 1.0))
    }
}

impl PerformancePolicy for InterpolatedPolicy {
    fn params(&self, trades: &[TradeRecord]) -> DynamicParams {
        let score = self.health_score(trades).unwrap_or(0.5);
        DynamicParams::interpolate(&self.config.defensive, &self.config.aggressive, score)
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, ExitReason, StrategyId};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn trade(net_pnl: Decimal) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            symbol: "ETHUSDT".to_string(),
            direction: Direction::Short,
            strategy: StrategyId::Breakout,
            entry_price: dec!(2000),
            exit_price: dec!(2000),
            quantity: dec!(0.05),
            gross_pnl: net_pnl,
            fees: Decimal::ZERO,
            funding_fees: Decimal::ZERO,
            net_pnl,
            r_multiple: Decimal::ZERO,
            pyramid_adds: 0,
            partial_closes: 0,
            opened_at: now,
            closed_at: now,
            exit_reason: ExitReason::TakeProfit,
        }
    }

    #[test]
    fn test_midpoint_without_history() {
        let policy = InterpolatedPolicy::new(PerformanceConfig::default(), dec!(1000));
        let params = policy.params(&[trade(dec!(5)), trade(dec!(-3))]);
        assert!((params.atr_multiplier - 2.75).abs() < 1e-9);
        assert!((params.pullback_zone_pct - 0.4).abs() < 1e-9);
        assert!((params.pyramid_trigger_r - 1.15).abs() < 1e-9);
    }

    #[test]
    fn test_strong_history_leans_aggressive() {
        let policy = InterpolatedPolicy::new(PerformanceConfig::default(), dec!(1000));
        let trades: Vec<_> = [30, 30, -10, 30, 30, 30, -10, 30]
            .into_iter()
            .map(|p| trade(Decimal::from(p)))
            .collect();

        let score = policy.health_score(&trades).unwrap();
        assert!(score > 0.5, "score was {score}");
        let params = policy.params(&trades);
        assert!(params.atr_multiplier < 2.75);
        assert!(params.pyramid_trigger_r < 1.15);
    }

    #[test]
    fn test_all_wins_is_not_judged() {
        let policy = InterpolatedPolicy::new(PerformanceConfig::default(), dec!(1000));
        let trades: Vec<_> = (0..6).map(|_| trade(dec!(10))).collect();
        assert_eq!(policy.health_score(&trades), None);
    }

    #[test]
    fn test_interpolation_endpoints() {
        let cfg = PerformanceConfig::default();
        let aggressive = DynamicParams::interpolate(&cfg.defensive, &cfg.aggressive, 1.0);
        assert!((aggressive.pullback_zone_pct - 0.2).abs() < 1e-9);
        assert!((aggressive.atr_multiplier - 2.0).abs() < 1e-9);
        let defensive = DynamicParams::interpolate(&cfg.defensive, &cfg.aggressive, -3.0);
        assert_eq!(defensive, cfg.defensive);
    }

    #[test]
    fn test_static_policy_ignores_history() {
        let fixed = DynamicParams {
            pullback_zone_pct: 0.3,
            atr_multiplier: 3.0,
            pyramid_trigger_r: 1.0,
        };
        let trades: Vec<_> = [30, -10, 30, 30, -10, 30]
            .into_iter()
            .map(|p| trade(Decimal::from(p)))
            .collect();
        assert_eq!(StaticPolicy(fixed).params(&trades), fixed);
    }
}
