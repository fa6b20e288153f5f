//! Market regime classification with hysteresis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::TrendConfig;
use crate::indicators;
use crate::models::{Direction, MarketSnapshot};

/// Market regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    #[default]
    Sideways,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Up => "uptrend",
            Trend::Down => "downtrend",
            Trend::Sideways => "sideways",
        }
    }

    /// Direction a trend-following entry would take.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Trend::Up => Some(Direction::Long),
            Trend::Down => Some(Direction::Short),
            Trend::Sideways => None,
        }
    }
}

/// Held regime plus the hysteresis counter. Owned by one symbol loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendState {
    pub trend: Trend,
    /// Consecutive bars whose raw regime disagreed with `trend`
    pub mismatch_count: u32,
    /// Last bar counted, so one bar is never counted twice
    pub last_bar: Option<DateTime<Utc>>,
}

impl TrendState {
    /// Feed the raw regime of `bar`. Returns true when the held regime flipped.
    ///
    /// The first observation is adopted directly. Afterwards a disagreeing
    /// bar increments the counter, an agreeing bar resets it, and the held
    /// regime only changes once the counter reaches `grace_period`.
    pub fn observe(&mut self, raw: Trend, bar: DateTime<Utc>, grace_period: u32) -> bool {
        let Some(last) = self.last_bar else {
            self.trend = raw;
            self.mismatch_count = 0;
            self.last_bar = Some(bar);
            return false;
        };
        if bar <= last {
            return false;
        }
        self.last_bar = Some(bar);

        if raw == self.trend {
            self.mismatch_count = 0;
            return false;
        }

        self.mismatch_count += 1;
        if self.mismatch_count >= grace_period.max(1) {
            self.trend = raw;
            self.mismatch_count = 0;
            return true;
        }
        false
    }
}

/// Classifies the regime of a snapshot.
#[derive(Debug, Clone)]
pub struct TrendClassifier {
    config: TrendConfig,
}

impl TrendClassifier {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    /// Regime of the latest bar without hysteresis.
    ///
    /// Up when the short EMA leads the long EMA by more than an ADX-scaled
    /// ATR fraction of price and the filter MA is rising; down mirrored.
    pub fn raw_trend(&self, snapshot: &MarketSnapshot) -> Trend {
        let ind = &snapshot.indicators;
        let (Some(ema_s), Some(ema_l), Some(atr)) = (
            indicators::last(&ind.ema_short),
            indicators::last(&ind.ema_long),
            indicators::last(&ind.atr),
        ) else {
            return Trend::Sideways;
        };
        let Some(price) = snapshot.last_candle().map(|c| c.close) else {
            return Trend::Sideways;
        };
        if ema_l <= 0.0 || price <= 0.0 {
            return Trend::Sideways;
        }

        let multiplier = match indicators::last(&ind.adx) {
            Some(adx) if adx > self.config.adx_strong => self.config.atr_multiplier_strong,
            Some(adx) if adx < self.config.adx_weak => self.config.atr_multiplier_weak,
            _ => 1.0,
        };
        let diff = (ema_s - ema_l) / ema_l;
        let threshold = atr / price * multiplier;

        let slope = self.filter_slope(snapshot);
        debug!(
            symbol = %snapshot.symbol,
            diff,
            threshold,
            slope = ?slope,
            "Trend inputs"
        );

        match slope {
            Some(s) if diff > threshold && s > 0.0 => Trend::Up,
            Some(s) if diff < -threshold && s < 0.0 => Trend::Down,
            _ => Trend::Sideways,
        }
    }

    /// Change of the filter MA over the configured number of bars.
    fn filter_slope(&self, snapshot: &MarketSnapshot) -> Option<f64> {
        let ma = &snapshot.filter_ma;
        let last = ma.len().checked_sub(1)?;
        let earlier = last.checked_sub(self.config.filter_slope_bars)?;
        Some(indicators::at(ma, last)? - indicators::at(ma, earlier)?)
    }

    /// Update `state` from the latest bar and return the held regime.
    pub fn classify(&self, snapshot: &MarketSnapshot, state: &mut TrendState) -> Trend {
        let raw = self.raw_trend(snapshot);
        let previous = state.trend;
        if state.observe(raw, snapshot.bar_time(), self.config.grace_period) {
            info!(
                symbol = %snapshot.symbol,
                from = previous.as_str(),
                to = state.trend.as_str(),
                "Trend changed"
            );
        } else if raw != state.trend {
            debug!(
                symbol = %snapshot.symbol,
                held = state.trend.as_str(),
                raw = raw.as_str(),
                mismatches = state.mismatch_count,
                "Trend held through grace period"
            );
        }
        state.trend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{candles_from, snapshot_from};
    use crate::trading::IndicatorConfig;
    use chrono::{Duration, TimeZone};

    fn bar(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::minutes(5 * i)
    }

    #[test]
    fn test_single_opposing_bar_does_not_flip() {
        let mut state = TrendState::default();
        state.observe(Trend::Up, bar(0), 2);
        assert_eq!(state.trend, Trend::Up);

        assert!(!state.observe(Trend::Down, bar(1), 2));
        assert_eq!(state.trend, Trend::Up);
        // Agreeing bar resets the counter
        assert!(!state.observe(Trend::Up, bar(2), 2));
        assert_eq!(state.mismatch_count, 0);

        assert!(!state.observe(Trend::Down, bar(3), 2));
        assert!(state.observe(Trend::Down, bar(4), 2));
        assert_eq!(state.trend, Trend::Down);
    }

    #[test]
    fn test_same_bar_counted_once() {
        let mut state = TrendState::default();
        state.observe(Trend::Up, bar(0), 2);
        state.observe(Trend::Sideways, bar(1), 2);
        state.observe(Trend::Sideways, bar(1), 2);
        state.observe(Trend::Sideways, bar(1), 2);
        assert_eq!(state.trend, Trend::Up);
        assert_eq!(state.mismatch_count, 1);
    }

    #[test]
    fn test_steady_rise_is_uptrend() {
        let config = IndicatorConfig::default();
        let closes: Vec<f64> = (0..150).map(|i| 100.0 + i as f64 * 0.5).collect();
        let snap = snapshot_from(candles_from(&closes, 0.2, 10.0), &config);

        let classifier = TrendClassifier::new(TrendConfig::default());
        assert_eq!(classifier.raw_trend(&snap), Trend::Up);

        let falling: Vec<f64> = (0..150).map(|i| 200.0 - i as f64 * 0.5).collect();
        let snap = snapshot_from(candles_from(&falling, 0.2, 10.0), &config);
        assert_eq!(classifier.raw_trend(&snap), Trend::Down);
    }

    #[test]
    fn test_flat_market_is_sideways() {
        let config = IndicatorConfig::default();
        let closes: Vec<f64> = (0..150)
            .map(|i| if i % 2 == 0 { 100.0 } else { 100.4 })
            .collect();
        let snap = snapshot_from(candles_from(&closes, 0.3, 10.0), &config);

        let classifier = TrendClassifier::new(TrendConfig::default());
        let mut state = TrendState::default();
        assert_eq!(classifier.classify(&snap, &mut state), Trend::Sideways);
    }
}
