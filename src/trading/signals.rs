//! Entry strategies: EMA pullback, volatility-squeeze breakout and
//! band-touch mean reversion.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::{
    BreakoutConfig, EngineConfig, PullbackConfig, RangeTarget, RangingConfig, SpikeConfig,
};
use super::performance::DynamicParams;
use super::trend::Trend;
use crate::indicators;
use crate::models::{to_price, Direction, MarketSnapshot, Signal, SizingMode, StrategyId};

/// Breakout bookkeeping carried between cycles by the owning symbol loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakoutState {
    /// Last bar evaluated; each bar is evaluated once
    pub last_bar: Option<DateTime<Utc>>,
    /// No breakout fires on bars opening before this
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Last bar checked for a spike
    #[serde(default)]
    pub spike_bar: Option<DateTime<Utc>>,
    /// Pullback zone widening in force and when it lapses
    #[serde(default)]
    pub aggression: Option<(Aggression, DateTime<Utc>)>,
}

impl BreakoutState {
    /// Level in force at `now`, if any.
    pub fn active_aggression(&self, now: DateTime<Utc>) -> Option<Aggression> {
        self.aggression
            .filter(|(_, until)| now < *until)
            .map(|(level, _)| level)
    }

    /// Arm `level` until `until` unless a stronger level is still active.
    fn arm(&mut self, level: Aggression, now: DateTime<Utc>, until: DateTime<Utc>) -> bool {
        if self.active_aggression(now).is_some_and(|active| active > level) {
            return false;
        }
        self.aggression = Some((level, until));
        true
    }
}

/// Temporary widening of the pullback zone. A spike outranks a breakout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggression {
    Breakout,
    Spike,
}

/// What each strategy produced this cycle.
#[derive(Debug, Clone, Default)]
pub struct SignalSet {
    pub pullback: Option<Signal>,
    pub breakout: Option<Signal>,
    pub ranging: Option<Signal>,
}

impl SignalSet {
    /// Highest-priority candidate: pullback, then breakout, then ranging.
    pub fn best(self) -> Option<Signal> {
        self.pullback.or(self.breakout).or(self.ranging)
    }

    pub fn is_empty(&self) -> bool {
        self.pullback.is_none() && self.breakout.is_none() && self.ranging.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SignalGenerator {
    pullback: PullbackConfig,
    breakout: BreakoutConfig,
    spike: SpikeConfig,
    ranging: RangingConfig,
}

impl SignalGenerator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            pullback: config.pullback.clone(),
            breakout: config.breakout.clone(),
            spike: config.spike.clone(),
            ranging: config.ranging.clone(),
        }
    }

    /// Run every enabled strategy on the latest closed bar. Breakouts and
    /// spikes arm their zone widening before the pullback check, and a
    /// pullback signal consumes whatever widening was in force.
    pub fn evaluate(
        &self,
        snapshot: &MarketSnapshot,
        trend: Trend,
        params: &DynamicParams,
        breakout_state: &mut BreakoutState,
    ) -> SignalSet {
        let now = snapshot.taken_at;
        let breakout = self.breakout(snapshot, breakout_state).and_then(|s| accept(snapshot, s));
        if breakout.is_some() && self.breakout.aggression_enabled {
            let until = now + Duration::seconds(self.breakout.aggression_secs);
            if breakout_state.arm(Aggression::Breakout, now, until) {
                info!(symbol = %snapshot.symbol, until = %until, "Aggressive pullback zone armed");
            }
        }
        self.spike(snapshot, breakout_state);

        let widened = DynamicParams {
            pullback_zone_pct: params.pullback_zone_pct
                * self.zone_multiplier(breakout_state, now),
            ..*params
        };
        let pullback = self.pullback(snapshot, trend, &widened).and_then(|s| accept(snapshot, s));
        if pullback.is_some() {
            breakout_state.aggression = None;
        }

        let set = SignalSet {
            pullback,
            breakout,
            ranging: self.ranging(snapshot, trend).and_then(|s| accept(snapshot, s)),
        };
        for signal in [&set.pullback, &set.breakout, &set.ranging].into_iter().flatten() {
            info!(
                symbol = %snapshot.symbol,
                strategy = signal.strategy.as_str(),
                direction = signal.direction.as_str(),
                entry = %signal.entry,
                stop = %signal.stop,
                "Signal"
            );
        }
        set
    }

    /// Pullback zone multiplier for the aggression in force at `now`.
    pub fn zone_multiplier(&self, state: &BreakoutState, now: DateTime<Utc>) -> f64 {
        match state.active_aggression(now) {
            Some(Aggression::Spike) if self.spike.enabled => self.spike.zone_multiplier,
            Some(Aggression::Breakout) if self.breakout.aggression_enabled => {
                self.breakout.aggressive_zone_multiplier
            }
            _ => 1.0,
        }
    }

    /// Large-bodied, high-volume candle moving with the filter environment.
    /// Arms the spike widening; never a signal by itself. Each bar is
    /// checked once.
    pub fn spike(&self, snapshot: &MarketSnapshot, state: &mut BreakoutState) -> bool {
        if !self.spike.enabled {
            return false;
        }
        let bar_time = snapshot.bar_time();
        if state.spike_bar.is_some_and(|last| bar_time <= last) {
            return false;
        }
        state.spike_bar = Some(bar_time);

        let ind = &snapshot.indicators;
        let i = snapshot.last_index();
        let (Some(candle), Some(atr), Some(volume_avg), Some(filter_ma)) = (
            snapshot.candles.get(i),
            indicators::at(&ind.atr, i),
            i.checked_sub(1).and_then(|p| indicators::at(&ind.volume_avg, p)),
            indicators::last(&snapshot.filter_ma),
        ) else {
            return false;
        };

        let body = (candle.close - candle.open).abs();
        if body < atr * self.spike.body_atr_multiplier {
            return false;
        }
        if candle.volume < volume_avg * self.spike.volume_multiple {
            debug!(symbol = %snapshot.symbol, "Spike body without volume");
            return false;
        }
        let with_filter = (candle.close > candle.open && candle.close > filter_ma)
            || (candle.close < candle.open && candle.close <= filter_ma);
        if !with_filter {
            return false;
        }

        let now = snapshot.taken_at;
        let until = now + Duration::seconds(self.spike.grace_secs);
        let armed = state.arm(Aggression::Spike, now, until);
        if armed {
            warn!(
                symbol = %snapshot.symbol,
                until = %until,
                "Spike detected, widest pullback zone armed"
            );
        }
        armed
    }

    /// Re-entry into the (widened) EMA band after an impulse outside it in
    /// the trend direction, confirmed by RSI turning with the trend.
    pub fn pullback(
        &self,
        snapshot: &MarketSnapshot,
        trend: Trend,
        params: &DynamicParams,
    ) -> Option<Signal> {
        if !self.pullback.enabled {
            return None;
        }
        let direction = trend.direction()?;
        let ind = &snapshot.indicators;
        let candles = &snapshot.candles;
        let i = snapshot.last_index();
        let zone = params.pullback_zone_pct / 100.0;

        let band = |j: usize| -> Option<(f64, f64)> {
            let s = indicators::at(&ind.ema_short, j)?;
            let l = indicators::at(&ind.ema_long, j)?;
            Some((s.min(l) * (1.0 - zone), s.max(l) * (1.0 + zone)))
        };
        let inside = |j: usize| {
            band(j).is_some_and(|(lo, hi)| candles[j].close >= lo && candles[j].close <= hi)
        };
        let beyond = |j: usize| {
            band(j).is_some_and(|(lo, hi)| match direction {
                Direction::Long => candles[j].close > hi,
                Direction::Short => candles[j].close < lo,
            })
        };

        // Bars inside the band, ending at the current bar
        let mut pullback_bars = 0;
        while pullback_bars <= i && inside(i - pullback_bars) {
            pullback_bars += 1;
        }
        if pullback_bars == 0 || pullback_bars > self.pullback.max_pullback_bars {
            return None;
        }

        // Impulse run immediately before the pullback
        let impulse_end = i + 1 - pullback_bars;
        let mut impulse_bars = 0;
        while impulse_bars < impulse_end && beyond(impulse_end - 1 - impulse_bars) {
            impulse_bars += 1;
        }
        if impulse_bars < self.pullback.min_impulse_bars.max(1) {
            return None;
        }

        let rising = direction == Direction::Long;
        if !indicators::is_monotonic_tail(&ind.rsi, self.pullback.rsi_confirm_bars, rising) {
            debug!(symbol = %snapshot.symbol, "Pullback without RSI confirmation");
            return None;
        }

        if self.pullback.volume_filter_enabled {
            let pullback_avg = average_volume(snapshot, impulse_end, i + 1);
            let impulse_avg = average_volume(snapshot, impulse_end - impulse_bars, impulse_end);
            if impulse_avg > 0.0 && pullback_avg / impulse_avg > self.pullback.max_volume_ratio {
                debug!(
                    symbol = %snapshot.symbol,
                    ratio = pullback_avg / impulse_avg,
                    "Pullback suppressed by volume"
                );
                return None;
            }
        }

        let close = candles[i].close;
        let atr = indicators::at(&ind.atr, i)?;
        let offset = atr * params.atr_multiplier;
        let stop = match direction {
            Direction::Long => close - offset,
            Direction::Short => close + offset,
        };

        Some(Signal {
            strategy: StrategyId::Pullback,
            direction,
            entry: to_price(close)?,
            stop: to_price(stop)?,
            target: None,
            sizing: SizingMode::RiskPercent,
            confidence: None,
            bar_time: candles[i].open_time,
        })
    }

    /// Whether band width at `s` sits at or below the configured percentile
    /// of the lookback window ending at `s`.
    pub fn is_squeeze(&self, widths: &[f64], s: usize) -> bool {
        let lookback = self.breakout.squeeze_lookback.max(1);
        if s + 1 < lookback {
            return false;
        }
        let Some(width) = indicators::at(widths, s) else {
            return false;
        };
        let window = &widths[s + 1 - lookback..=s];
        indicators::percentile(window, self.breakout.squeeze_percentile)
            .is_some_and(|threshold| width <= threshold)
    }

    /// First close outside the band after a squeeze, with volume and RSI
    /// confirmation. Fires at most once per bar and respects the cooldown.
    pub fn breakout(&self, snapshot: &MarketSnapshot, state: &mut BreakoutState) -> Option<Signal> {
        if !self.breakout.enabled {
            return None;
        }
        let bar_time = snapshot.bar_time();
        if state.last_bar.is_some_and(|last| bar_time <= last) {
            return None;
        }
        state.last_bar = Some(bar_time);

        if let Some(until) = state.cooldown_until {
            if bar_time < until {
                debug!(symbol = %snapshot.symbol, until = %until, "Breakout cooling down");
                return None;
            }
        }

        let ind = &snapshot.indicators;
        let bands = &ind.bands;
        let candles = &snapshot.candles;
        let i = snapshot.last_index();
        if i == 0 {
            return None;
        }

        let outside = |j: usize| -> Option<Direction> {
            let close = candles[j].close;
            if close > indicators::at(&bands.upper, j)? {
                Some(Direction::Long)
            } else if close < indicators::at(&bands.lower, j)? {
                Some(Direction::Short)
            } else {
                None
            }
        };

        let direction = outside(i)?;

        // Latest squeeze bar, with every close since then inside the band
        let oldest = i.saturating_sub(self.breakout.squeeze_max_age_bars.max(1));
        let mut squeeze_at = None;
        for s in (oldest..i).rev() {
            if self.is_squeeze(&bands.width, s) {
                squeeze_at = Some(s);
                break;
            }
            if outside(s).is_some() {
                return None;
            }
        }
        let squeeze = squeeze_at?;

        let volume_avg = indicators::at(&ind.volume_avg, i - 1)?;
        if candles[i].volume <= self.breakout.volume_multiple * volume_avg {
            debug!(symbol = %snapshot.symbol, "Breakout without volume");
            return None;
        }

        let rsi = indicators::at(&ind.rsi, i)?;
        let rsi_ok = match direction {
            Direction::Long => rsi > self.breakout.rsi_threshold,
            Direction::Short => rsi < 100.0 - self.breakout.rsi_threshold,
        };
        if !rsi_ok {
            debug!(symbol = %snapshot.symbol, rsi, "Breakout without RSI");
            return None;
        }

        state.cooldown_until = Some(bar_time + Duration::seconds(self.breakout.cooldown_secs));
        debug!(
            symbol = %snapshot.symbol,
            squeeze_bar = %candles[squeeze].open_time,
            "Squeeze released"
        );

        let entry = to_price(candles[i].close)?;
        let trail = self.breakout.trail_percent / Decimal::ONE_HUNDRED;
        let stop = match direction {
            Direction::Long => entry * (Decimal::ONE - trail),
            Direction::Short => entry * (Decimal::ONE + trail),
        };

        Some(Signal {
            strategy: StrategyId::Breakout,
            direction,
            entry,
            stop: stop.round_dp(8),
            target: None,
            sizing: SizingMode::FixedNotional,
            confidence: None,
            bar_time,
        })
    }

    /// Fade a touch of the outer band in a sideways, low-ADX market.
    pub fn ranging(&self, snapshot: &MarketSnapshot, trend: Trend) -> Option<Signal> {
        if !self.ranging.enabled || trend != Trend::Sideways {
            return None;
        }
        let ind = &snapshot.indicators;
        let i = snapshot.last_index();
        let adx = indicators::at(&ind.adx, i)?;
        if adx >= self.ranging.adx_max {
            return None;
        }

        let candle = snapshot.candles.get(i)?;
        let upper = indicators::at(&ind.bands.upper, i)?;
        let lower = indicators::at(&ind.bands.lower, i)?;
        let middle = indicators::at(&ind.bands.middle, i)?;
        let atr = indicators::at(&ind.atr, i)?;

        let direction = match (candle.high >= upper, candle.low <= lower) {
            (true, false) => Direction::Short,
            (false, true) => Direction::Long,
            _ => return None,
        };

        let offset = atr * self.ranging.atr_stop_multiplier;
        let (stop, target) = match direction {
            Direction::Short => (
                candle.close + offset,
                match self.ranging.target {
                    RangeTarget::Middle => middle,
                    RangeTarget::Opposite => lower,
                },
            ),
            Direction::Long => (
                candle.close - offset,
                match self.ranging.target {
                    RangeTarget::Middle => middle,
                    RangeTarget::Opposite => upper,
                },
            ),
        };

        Some(Signal {
            strategy: StrategyId::Ranging,
            direction,
            entry: to_price(candle.close)?,
            stop: to_price(stop)?,
            target: Some(to_price(target)?),
            sizing: SizingMode::FixedNotional,
            confidence: None,
            bar_time: candle.open_time,
        })
    }
}

/// Keep only structurally valid signals.
fn accept(snapshot: &MarketSnapshot, signal: Signal) -> Option<Signal> {
    match signal.validate() {
        Ok(()) => Some(signal),
        Err(e) => {
            debug!(symbol = %snapshot.symbol, error = %e, "Signal discarded");
            None
        }
    }
}

/// Mean volume of candles in `[from, to)`.
fn average_volume(snapshot: &MarketSnapshot, from: usize, to: usize) -> f64 {
    let slice = &snapshot.candles[from.min(to)..to];
    if slice.is_empty() {
        return 0.0;
    }
    slice.iter().map(|c| c.volume).sum::<f64>() / slice.len() as f64
}
