//! Merges the external analyst's assessment with the algorithmic signals.
//!
//! The analyst is consulted on a timer or when the latest bar shows an event
//! (EMA cross, RSI boundary breach, fast band breakout, large hourly move).
//! A usable assessment only reaches execution when the tracked analyst score
//! clears the threshold and live trading is armed; otherwise it is followed
//! on paper in the shadow ledger.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::ArbiterConfig;
use crate::indicators;
use crate::models::{
    to_price, AiAssessment, Candle, Direction, MarketSnapshot, Signal, SizingMode, StrategyId,
};

/// Why the analyst is consulted this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Interval,
    EmaCross,
    RsiBoundary,
    BandBreakout,
    HourlyMove,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Interval => "interval",
            TriggerReason::EmaCross => "ema_cross",
            TriggerReason::RsiBoundary => "rsi_boundary",
            TriggerReason::BandBreakout => "band_breakout",
            TriggerReason::HourlyMove => "hourly_move",
        }
    }
}

/// Consultation bookkeeping owned by the symbol loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiTriggerState {
    pub last_consult: Option<DateTime<Utc>>,
    /// Bar of the last consultation; at most one per bar
    pub last_bar: Option<DateTime<Utc>>,
}

/// Outcome of one arbitration.
#[derive(Debug, Clone, Default)]
pub struct Arbitration {
    /// Candidate to size and execute, if any
    pub entry: Option<Signal>,
    /// Analyst signal followed on paper only
    pub shadow: Option<Signal>,
    /// Analyst calls against the open position
    pub opposes_position: bool,
}

#[derive(Debug, Clone)]
pub struct AiArbiter {
    config: ArbiterConfig,
}

impl AiArbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn use_limit_orders(&self) -> bool {
        self.config.use_limit_orders
    }

    /// Single per-cycle predicate replacing timers and event callbacks.
    /// The interval is checked first, then events on the latest bar.
    pub fn should_consult(
        &self,
        state: &AiTriggerState,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> Option<TriggerReason> {
        if !self.config.enabled {
            return None;
        }
        let bar = snapshot.bar_time();
        if state.last_bar == Some(bar) {
            return None;
        }

        let due = state
            .last_consult
            .map_or(true, |last| now - last >= Duration::seconds(self.config.interval_secs));
        if due {
            return Some(TriggerReason::Interval);
        }

        let ind = &snapshot.indicators;
        let i = snapshot.last_index();
        if i == 0 {
            return None;
        }

        let relation = |k: usize| {
            Some(indicators::at(&ind.ema_short, k)? > indicators::at(&ind.ema_long, k)?)
        };
        if let (Some(before), Some(after)) = (relation(i - 1), relation(i)) {
            if before != after {
                return Some(TriggerReason::EmaCross);
            }
        }

        if let (Some(before), Some(after)) = (indicators::at(&ind.rsi, i - 1), indicators::at(&ind.rsi, i)) {
            let upper = self.config.rsi_upper;
            let lower = self.config.rsi_lower;
            if (before <= upper && after > upper) || (before >= lower && after < lower) {
                return Some(TriggerReason::RsiBoundary);
            }
        }

        if fast_band_breakout(snapshot) {
            return Some(TriggerReason::BandBreakout);
        }

        match snapshot.hourly_change_pct() {
            Some(change) if change.abs() >= self.config.hourly_move_pct => Some(TriggerReason::HourlyMove),
            _ => None,
        }
    }

    pub fn mark_consulted(&self, state: &mut AiTriggerState, bar: DateTime<Utc>, now: DateTime<Utc>) {
        state.last_consult = Some(now);
        state.last_bar = Some(bar);
    }

    /// An assessment older than the configured age counts as no assessment.
    pub fn is_fresh(&self, assessment: &AiAssessment, now: DateTime<Utc>) -> bool {
        now - assessment.produced_at <= Duration::seconds(self.config.assessment_max_age_secs)
    }

    /// Decide what, if anything, to open this cycle.
    ///
    /// With a position open nothing new is opened; an opposing assessment
    /// only flags the position for defensive tightening. When flat a usable
    /// analyst signal takes priority over `algorithmic`, but only reaches
    /// execution through the live gate.
    pub fn arbitrate(
        &self,
        assessment: Option<&AiAssessment>,
        position: Option<Direction>,
        algorithmic: Option<Signal>,
        snapshot: &MarketSnapshot,
        score: f64,
        now: DateTime<Utc>,
    ) -> Arbitration {
        let usable = assessment
            .filter(|a| self.config.enabled && !a.is_neutral() && self.is_fresh(a, now));

        if let Some(held) = position {
            let opposes = usable.and_then(|a| a.direction()) == Some(held.opposite());
            if opposes {
                info!(symbol = %snapshot.symbol, held = held.as_str(), "Analyst opposes open position");
            }
            return Arbitration {
                entry: None,
                shadow: None,
                opposes_position: opposes,
            };
        }

        let Some(assessment) = usable else {
            return Arbitration {
                entry: algorithmic,
                ..Default::default()
            };
        };

        let signal = match self.analyst_signal(assessment, snapshot) {
            Ok(signal) => signal,
            Err(reason) => {
                info!(symbol = %snapshot.symbol, reason = %reason, "Analyst signal rejected");
                return Arbitration {
                    entry: algorithmic,
                    ..Default::default()
                };
            }
        };

        if self.config.live_enabled && score > self.config.score_threshold {
            info!(
                symbol = %snapshot.symbol,
                direction = signal.direction.as_str(),
                score,
                "Analyst signal takes priority"
            );
            Arbitration {
                entry: Some(signal),
                ..Default::default()
            }
        } else {
            debug!(
                symbol = %snapshot.symbol,
                score,
                live = self.config.live_enabled,
                "Analyst signal tracked in shadow ledger"
            );
            Arbitration {
                entry: algorithmic,
                shadow: Some(signal),
                opposes_position: false,
            }
        }
    }

    /// Turn an assessment into a signal, applying the confidence and
    /// reward/risk gates.
    pub fn analyst_signal(&self, assessment: &AiAssessment, snapshot: &MarketSnapshot) -> Result<Signal, String> {
        let direction = assessment.direction().ok_or("neutral assessment")?;
        if assessment.confidence < self.config.min_confidence {
            return Err(format!(
                "confidence {:.0} below {:.0}",
                assessment.confidence, self.config.min_confidence
            ));
        }
        let entry = match assessment.entry {
            Some(price) if price > Decimal::ZERO => price,
            _ => to_price(snapshot.price()).ok_or("no usable price")?,
        };
        let stop = assessment.stop.ok_or("assessment has no stop")?;
        let target = assessment.target.ok_or("assessment has no target")?;

        let signal = Signal {
            strategy: StrategyId::Ai,
            direction,
            entry,
            stop,
            target: Some(target),
            sizing: SizingMode::RiskPercent,
            confidence: Some(assessment.confidence),
            bar_time: snapshot.bar_time(),
        };
        signal.validate().map_err(|e| e.to_string())?;

        let reward_risk = signal.reward_risk().ok_or("undefined reward/risk")?;
        if reward_risk < self.config.min_reward_risk {
            return Err(format!(
                "reward/risk {} below {}",
                reward_risk.round_dp(2),
                self.config.min_reward_risk
            ));
        }
        Ok(signal)
    }
}

fn fast_band_breakout(snapshot: &MarketSnapshot) -> bool {
    let candles = &snapshot.fast_candles;
    let bands = &snapshot.fast_bands;
    let n = candles.len();
    if n < 2 {
        return false;
    }
    let outside = |k: usize| match (indicators::at(&bands.upper, k), indicators::at(&bands.lower, k)) {
        (Some(upper), Some(lower)) => candles[k].close > upper || candles[k].close < lower,
        _ => false,
    };
    outside(n - 1) && !outside(n - 2)
}

/// An analyst signal followed on paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowTrade {
    pub symbol: String,
    pub direction: Direction,
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    pub confidence: f64,
    /// Only candles opening after this bar can resolve it
    pub opened_bar: DateTime<Utc>,
}

/// A resolved shadow trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowOutcome {
    pub trade: ShadowTrade,
    pub exit: Decimal,
    /// Signed return fraction
    pub return_pct: f64,
    pub resolved_at: DateTime<Utc>,
    /// Closed flat at its entry after reaching the maximum age
    #[serde(default)]
    pub expired: bool,
}

impl ShadowTrade {
    pub fn from_signal(symbol: &str, signal: &Signal) -> Option<Self> {
        Some(Self {
            symbol: symbol.to_string(),
            direction: signal.direction,
            entry: signal.entry,
            stop: signal.stop,
            target: signal.target?,
            confidence: signal.confidence.unwrap_or_default(),
            opened_bar: signal.bar_time,
        })
    }

    /// Resolve against one candle. A candle touching both levels counts as
    /// stopped out.
    pub fn resolve(&self, candle: &Candle) -> Option<ShadowOutcome> {
        if candle.open_time <= self.opened_bar {
            return None;
        }
        let high = to_price(candle.high)?;
        let low = to_price(candle.low)?;
        let (stop_hit, target_hit) = match self.direction {
            Direction::Long => (low <= self.stop, high >= self.target),
            Direction::Short => (high >= self.stop, low <= self.target),
        };
        let exit = if stop_hit {
            self.stop
        } else if target_hit {
            self.target
        } else {
            return None;
        };

        let change = (exit - self.entry) * self.direction.sign() / self.entry;
        Some(ShadowOutcome {
            trade: self.clone(),
            exit,
            return_pct: change.to_f64().unwrap_or(0.0),
            resolved_at: candle.open_time,
            expired: false,
        })
    }

    /// Scratch outcome for a trade that never reached either level.
    fn expire(&self, at: DateTime<Utc>) -> ShadowOutcome {
        ShadowOutcome {
            trade: self.clone(),
            exit: self.entry,
            return_pct: 0.0,
            resolved_at: at,
            expired: true,
        }
    }
}

/// Open shadow trades of one symbol.
#[derive(Debug, Clone)]
pub struct ShadowLedger {
    open: Vec<ShadowTrade>,
    max_age: Duration,
}

impl ShadowLedger {
    pub fn new(max_age: Duration) -> Self {
        Self {
            open: Vec::new(),
            max_age,
        }
    }

    pub fn record(&mut self, trade: ShadowTrade) {
        info!(
            symbol = %trade.symbol,
            direction = trade.direction.as_str(),
            entry = %trade.entry,
            "Shadow trade opened"
        );
        self.open.push(trade);
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Walk `candles` (ascending) and take out every trade they resolve.
    /// A trade still open once the last candle is `max_age` past its bar
    /// is taken out as a scratch.
    pub fn resolve(&mut self, candles: &[Candle]) -> Vec<ShadowOutcome> {
        let latest = candles.last().map(|c| c.open_time);
        let max_age = self.max_age;
        let mut resolved = Vec::new();
        self.open.retain(|trade| {
            let outcome = candles.iter().find_map(|c| trade.resolve(c)).or_else(|| {
                latest
                    .filter(|&at| at - trade.opened_bar >= max_age)
                    .map(|at| trade.expire(at))
            });
            match outcome {
                Some(outcome) => {
                    resolved.push(outcome);
                    false
                }
                None => true,
            }
        });
        for outcome in &resolved {
            info!(
                symbol = %outcome.trade.symbol,
                exit = %outcome.exit,
                ret = outcome.return_pct,
                expired = outcome.expired,
                "Shadow trade resolved"
            );
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{candles_from, snapshot_from};
    use crate::models::AiDirection;
    use crate::trading::IndicatorConfig;
    use rust_decimal_macros::dec;

    fn flat_snapshot() -> MarketSnapshot {
        let closes: Vec<f64> = (0..80).map(|i| if i % 2 == 0 { 100.0 } else { 100.2 }).collect();
        snapshot_from(candles_from(&closes, 0.1, 100.0), &IndicatorConfig::default())
    }

    fn arbiter(live: bool) -> AiArbiter {
        AiArbiter::new(ArbiterConfig {
            live_enabled: live,
            ..Default::default()
        })
    }

    fn assessment(direction: AiDirection, now: DateTime<Utc>) -> AiAssessment {
        AiAssessment {
            direction,
            confidence: 75.0,
            entry: Some(dec!(100)),
            stop: Some(if direction == AiDirection::Short { dec!(102) } else { dec!(98) }),
            target: Some(if direction == AiDirection::Short { dec!(94) } else { dec!(106) }),
            rationale: "test".to_string(),
            produced_at: now,
        }
    }

    fn algorithmic(snap: &MarketSnapshot) -> Signal {
        Signal {
            strategy: StrategyId::Ranging,
            direction: Direction::Short,
            entry: dec!(100.2),
            stop: dec!(100.8),
            target: Some(dec!(100.1)),
            sizing: SizingMode::FixedNotional,
            confidence: None,
            bar_time: snap.bar_time(),
        }
    }

    #[test]
    fn test_neutral_leaves_algorithmic_untouched() {
        let snap = flat_snapshot();
        let now = snap.taken_at;
        let neutral = AiAssessment::neutral("no view");
        let out = arbiter(true).arbitrate(Some(&neutral), None, Some(algorithmic(&snap)), &snap, 90.0, now);
        assert_eq!(out.entry.unwrap().strategy, StrategyId::Ranging);
        assert!(out.shadow.is_none());

        let out = arbiter(true).arbitrate(None, None, Some(algorithmic(&snap)), &snap, 90.0, now);
        assert_eq!(out.entry.unwrap().strategy, StrategyId::Ranging);
    }

    #[test]
    fn test_live_gate_requires_score_and_flag() {
        let snap = flat_snapshot();
        let now = snap.taken_at;
        let a = assessment(AiDirection::Long, now);

        let out = arbiter(true).arbitrate(Some(&a), None, Some(algorithmic(&snap)), &snap, 70.0, now);
        assert_eq!(out.entry.unwrap().strategy, StrategyId::Ai);
        assert!(out.shadow.is_none());

        // Score too low: shadow only, algorithmic proceeds
        let out = arbiter(true).arbitrate(Some(&a), None, Some(algorithmic(&snap)), &snap, 60.0, now);
        assert_eq!(out.entry.unwrap().strategy, StrategyId::Ranging);
        assert_eq!(out.shadow.unwrap().strategy, StrategyId::Ai);

        // Live trading not armed
        let out = arbiter(false).arbitrate(Some(&a), None, None, &snap, 99.0, now);
        assert!(out.entry.is_none());
        assert!(out.shadow.is_some());
    }

    #[test]
    fn test_gates_reject_weak_assessments() {
        let snap = flat_snapshot();
        let now = snap.taken_at;
        let arb = arbiter(true);

        let mut poor_reward = assessment(AiDirection::Long, now);
        poor_reward.target = Some(dec!(102));
        assert!(arb.analyst_signal(&poor_reward, &snap).is_err());

        let mut unsure = assessment(AiDirection::Long, now);
        unsure.confidence = 40.0;
        assert!(arb.analyst_signal(&unsure, &snap).is_err());

        let mut no_stop = assessment(AiDirection::Long, now);
        no_stop.stop = None;
        assert!(arb.analyst_signal(&no_stop, &snap).is_err());

        // Stale assessments are ignored entirely
        let stale = assessment(AiDirection::Long, now - Duration::hours(2));
        let out = arb.arbitrate(Some(&stale), None, None, &snap, 99.0, now);
        assert!(out.entry.is_none() && out.shadow.is_none());
    }

    #[test]
    fn test_opposing_assessment_flags_open_position() {
        let snap = flat_snapshot();
        let now = snap.taken_at;
        let short = assessment(AiDirection::Short, now);

        let out = arbiter(true).arbitrate(Some(&short), Some(Direction::Long), None, &snap, 99.0, now);
        assert!(out.opposes_position);
        assert!(out.entry.is_none());

        let out = arbiter(true).arbitrate(Some(&short), Some(Direction::Short), None, &snap, 99.0, now);
        assert!(!out.opposes_position);
    }

    #[test]
    fn test_consult_once_per_bar() {
        let snap = flat_snapshot();
        let arb = arbiter(false);
        let mut state = AiTriggerState::default();

        assert_eq!(arb.should_consult(&state, &snap, snap.taken_at), Some(TriggerReason::Interval));
        arb.mark_consulted(&mut state, snap.bar_time(), snap.taken_at);
        assert_eq!(arb.should_consult(&state, &snap, snap.taken_at + Duration::hours(1)), None);
    }

    #[test]
    fn test_hourly_move_triggers_between_intervals() {
        let mut closes = vec![100.0; 80];
        closes.extend((1..=12).map(|i| 100.0 + i as f64 * 0.25));
        let snap = snapshot_from(candles_from(&closes, 0.1, 100.0), &IndicatorConfig::default());
        let arb = arbiter(false);
        let state = AiTriggerState {
            last_consult: Some(snap.taken_at - Duration::minutes(5)),
            last_bar: None,
        };
        // 3% over the hour with no EMA cross or RSI breach on the last bar
        assert_eq!(
            arb.should_consult(&state, &snap, snap.taken_at),
            Some(TriggerReason::HourlyMove)
        );
    }

    #[test]
    fn test_shadow_resolution_stop_wins_ties() {
        let snap = flat_snapshot();
        let signal = arbiter(true)
            .analyst_signal(&assessment(AiDirection::Long, snap.taken_at), &snap)
            .unwrap();
        let trade = ShadowTrade::from_signal("BTCUSDT", &signal).unwrap();

        let mut ledger = ShadowLedger::new(Duration::hours(24));
        ledger.record(trade.clone());

        let next = snap.bar_time() + Duration::minutes(5);
        let quiet = Candle {
            open_time: next,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
        };
        assert!(ledger.resolve(&[quiet]).is_empty());
        assert_eq!(ledger.open_count(), 1);

        let wide = Candle {
            open_time: next + Duration::minutes(5),
            high: 107.0,
            low: 97.0,
            ..quiet
        };
        let outcomes = ledger.resolve(&[wide]);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].exit, dec!(98));
        assert!((outcomes[0].return_pct + 0.02).abs() < 1e-9);
        assert_eq!(ledger.open_count(), 0);

        // Same bar as the signal never resolves it
        let same_bar = Candle { open_time: snap.bar_time(), ..wide };
        assert!(trade.resolve(&same_bar).is_none());
    }

    #[test]
    fn test_stale_shadow_trade_expires_as_scratch() {
        let snap = flat_snapshot();
        let signal = arbiter(true)
            .analyst_signal(&assessment(AiDirection::Long, snap.taken_at), &snap)
            .unwrap();
        let trade = ShadowTrade::from_signal("BTCUSDT", &signal).unwrap();
        let mut ledger = ShadowLedger::new(Duration::hours(1));
        ledger.record(trade.clone());

        let quiet = |minutes: i64| Candle {
            open_time: snap.bar_time() + Duration::minutes(minutes),
            open: 100.0,
            high: 100.5,
            low: 99.5,
            close: 100.0,
            volume: 10.0,
        };
        assert!(ledger.resolve(&[quiet(5), quiet(55)]).is_empty());
        assert_eq!(ledger.open_count(), 1);

        let outcomes = ledger.resolve(&[quiet(60)]);
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].expired);
        assert_eq!(outcomes[0].exit, trade.entry);
        assert_eq!(outcomes[0].return_pct, 0.0);
        assert_eq!(outcomes[0].resolved_at, snap.bar_time() + Duration::hours(1));
        assert_eq!(ledger.open_count(), 0);
    }
}
