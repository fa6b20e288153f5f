//! Technical indicators over closed candles.
//!
//! Every series is aligned with its input: index `i` is the value as of the
//! close of candle `i`, `NaN` while the indicator is warming up.

use statrs::statistics::{Data, OrderStatistics, Statistics};

use crate::models::Candle;
use crate::trading::IndicatorConfig;

/// Simple moving average.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    for i in (period - 1)..values.len() {
        out[i] = values[i + 1 - period..=i].iter().mean();
    }
    out
}

/// Exponential moving average seeded with the SMA of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut prev = values[..period].iter().mean();
    out[period - 1] = prev;
    for i in period..values.len() {
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        out[i] = prev;
    }
    out
}

/// Wilder smoothing (alpha = 1/period), seeded with the mean of the first
/// `period` finite values. Leading `NaN`s are skipped.
pub fn wilder_smooth(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 {
        return out;
    }
    let Some(start) = values.iter().position(|v| v.is_finite()) else {
        return out;
    };
    let seed_end = start + period;
    if seed_end > n || values[start..seed_end].iter().any(|v| !v.is_finite()) {
        return out;
    }

    let mut prev = values[start..seed_end].iter().mean();
    out[seed_end - 1] = prev;
    for i in seed_end..n {
        if values[i].is_finite() {
            prev += (values[i] - prev) / period as f64;
        }
        out[i] = prev;
    }
    out
}

/// True range; the first bar has no previous close and uses high - low.
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .enumerate()
        .map(|(i, c)| {
            if i == 0 {
                c.high - c.low
            } else {
                let prev_close = candles[i - 1].close;
                (c.high - c.low)
                    .max((c.high - prev_close).abs())
                    .max((c.low - prev_close).abs())
            }
        })
        .collect()
}

/// Average true range (Wilder).
pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    wilder_smooth(&true_range(candles), period)
}

/// Relative strength index (Wilder).
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![f64::NAN; n];
    if n < 2 {
        return out;
    }

    let mut gains = vec![f64::NAN; n];
    let mut losses = vec![f64::NAN; n];
    for i in 1..n {
        let delta = closes[i] - closes[i - 1];
        gains[i] = delta.max(0.0);
        losses[i] = (-delta).max(0.0);
    }

    let avg_gain = wilder_smooth(&gains, period);
    let avg_loss = wilder_smooth(&losses, period);
    for i in 0..n {
        let (g, l) = (avg_gain[i], avg_loss[i]);
        if !g.is_finite() || !l.is_finite() {
            continue;
        }
        out[i] = if l == 0.0 {
            if g == 0.0 {
                50.0
            } else {
                100.0
            }
        } else {
            100.0 - 100.0 / (1.0 + g / l)
        };
    }
    out
}

/// Average directional index (Wilder).
pub fn adx(candles: &[Candle], period: usize) -> Vec<f64> {
    let n = candles.len();
    if n < 2 {
        return vec![f64::NAN; n];
    }

    let mut plus_dm = vec![f64::NAN; n];
    let mut minus_dm = vec![f64::NAN; n];
    for i in 1..n {
        let up = candles[i].high - candles[i - 1].high;
        let down = candles[i - 1].low - candles[i].low;
        plus_dm[i] = if up > down && up > 0.0 { up } else { 0.0 };
        minus_dm[i] = if down > up && down > 0.0 { down } else { 0.0 };
    }

    // TR aligned with the DM series (first bar has no previous bar)
    let mut tr = true_range(candles);
    tr[0] = f64::NAN;

    let smooth_tr = wilder_smooth(&tr, period);
    let smooth_plus = wilder_smooth(&plus_dm, period);
    let smooth_minus = wilder_smooth(&minus_dm, period);

    let mut dx = vec![f64::NAN; n];
    for i in 0..n {
        if !smooth_tr[i].is_finite() || smooth_tr[i] == 0.0 {
            continue;
        }
        let plus_di = 100.0 * smooth_plus[i] / smooth_tr[i];
        let minus_di = 100.0 * smooth_minus[i] / smooth_tr[i];
        let sum = plus_di + minus_di;
        dx[i] = if sum == 0.0 {
            0.0
        } else {
            100.0 * (plus_di - minus_di).abs() / sum
        };
    }

    wilder_smooth(&dx, period)
}

/// Bollinger bands with relative width `(upper - lower) / middle`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
    pub width: Vec<f64>,
}

pub fn bollinger(closes: &[f64], period: usize, std_devs: f64) -> Bands {
    let n = closes.len();
    let mut bands = Bands {
        upper: vec![f64::NAN; n],
        middle: vec![f64::NAN; n],
        lower: vec![f64::NAN; n],
        width: vec![f64::NAN; n],
    };
    if period < 2 || n < period {
        return bands;
    }

    for i in (period - 1)..n {
        let window = &closes[i + 1 - period..=i];
        let mid = window.iter().mean();
        let sd = window.iter().population_std_dev();
        bands.middle[i] = mid;
        bands.upper[i] = mid + std_devs * sd;
        bands.lower[i] = mid - std_devs * sd;
        if mid != 0.0 {
            bands.width[i] = (bands.upper[i] - bands.lower[i]) / mid;
        }
    }
    bands
}

/// `p`-th percentile (0-100) of the finite values.
pub fn percentile(values: &[f64], p: usize) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    let mut data = Data::new(finite);
    Some(data.percentile(p.min(100)))
}

/// Highest high over the last `lookback` candles.
pub fn highest_high(candles: &[Candle], lookback: usize) -> Option<f64> {
    let start = candles.len().saturating_sub(lookback);
    candles[start..].iter().map(|c| c.high).reduce(f64::max)
}

/// Lowest low over the last `lookback` candles.
pub fn lowest_low(candles: &[Candle], lookback: usize) -> Option<f64> {
    let start = candles.len().saturating_sub(lookback);
    candles[start..].iter().map(|c| c.low).reduce(f64::min)
}

/// Finite value at `i`.
pub fn at(series: &[f64], i: usize) -> Option<f64> {
    series.get(i).copied().filter(|v| v.is_finite())
}

/// Finite last value.
pub fn last(series: &[f64]) -> Option<f64> {
    series.last().copied().filter(|v| v.is_finite())
}

/// Whether the last `count` steps of `series` all move in one direction.
pub fn is_monotonic_tail(series: &[f64], count: usize, rising: bool) -> bool {
    let n = series.len();
    if count == 0 || n < count + 1 {
        return false;
    }
    (n - count..n).all(|i| match (at(series, i - 1), at(series, i)) {
        (Some(prev), Some(cur)) => {
            if rising {
                cur > prev
            } else {
                cur < prev
            }
        }
        _ => false,
    })
}

/// Every indicator the strategies read, computed once per snapshot.
#[derive(Debug, Clone, Default)]
pub struct Indicators {
    pub ema_short: Vec<f64>,
    pub ema_long: Vec<f64>,
    pub rsi: Vec<f64>,
    pub atr: Vec<f64>,
    pub atr_fast: Vec<f64>,
    pub atr_slow: Vec<f64>,
    pub adx: Vec<f64>,
    pub bands: Bands,
    pub volume_avg: Vec<f64>,
}

impl Indicators {
    pub fn compute(candles: &[Candle], config: &IndicatorConfig) -> Self {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

        Self {
            ema_short: ema(&closes, config.ema_short),
            ema_long: ema(&closes, config.ema_long),
            rsi: rsi(&closes, config.rsi),
            atr: atr(candles, config.atr),
            atr_fast: atr(candles, config.atr_fast),
            atr_slow: atr(candles, config.atr_slow),
            adx: adx(candles, config.adx),
            bands: bollinger(&closes, config.bollinger_period, config.bollinger_std),
            volume_avg: sma(&volumes, config.volume_period),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars(closes: &[f64], range: f64) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                open_time: start + Duration::minutes(5 * i as i64),
                open: c,
                high: c + range,
                low: c - range,
                close: c,
                volume: 100.0,
            })
            .collect()
    }

    #[test]
    fn test_sma_and_ema_warmup() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let s = sma(&values, 3);
        assert!(s[1].is_nan());
        assert_eq!(s[2], 2.0);
        assert_eq!(s[4], 4.0);

        let e = ema(&[5.0; 10], 4);
        assert!(e[2].is_nan());
        assert!((e[9] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert_eq!(last(&rsi(&rising, 14)), Some(100.0));

        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let value = last(&rsi(&falling, 14)).unwrap();
        assert!(value.abs() < 1e-9);

        let flat = vec![100.0; 30];
        assert_eq!(last(&rsi(&flat, 14)), Some(50.0));
    }

    #[test]
    fn test_atr_constant_range() {
        let candles = bars(&[100.0; 40], 1.0);
        let value = last(&atr(&candles, 14)).unwrap();
        assert!((value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_adx_strong_in_steady_trend() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + 2.0 * i as f64).collect();
        let candles = bars(&closes, 1.0);
        let value = last(&adx(&candles, 14)).unwrap();
        assert!(value > 50.0, "adx was {value}");
    }

    #[test]
    fn test_bollinger_flat_series_has_zero_width() {
        let bands = bollinger(&[50.0; 25], 20, 2.0);
        assert_eq!(last(&bands.middle), Some(50.0));
        assert_eq!(last(&bands.width), Some(0.0));
        assert!(bands.upper[18].is_nan());
    }

    #[test]
    fn test_percentile_and_extremes() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let p25 = percentile(&values, 25).unwrap();
        assert!(p25 > 24.0 && p25 < 27.0);
        assert_eq!(percentile(&[f64::NAN], 25), None);

        let candles = bars(&[10.0, 12.0, 11.0], 0.5);
        assert_eq!(highest_high(&candles, 2), Some(12.5));
        assert_eq!(lowest_low(&candles, 3), Some(9.5));
    }

    #[test]
    fn test_monotonic_tail() {
        let series = [f64::NAN, 40.0, 42.0, 45.0];
        assert!(is_monotonic_tail(&series, 2, true));
        assert!(!is_monotonic_tail(&series, 3, true));
        assert!(!is_monotonic_tail(&series, 2, false));
    }
}
