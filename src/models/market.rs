//! Per-cycle market snapshot.

use chrono::{DateTime, Duration, Utc};

use super::candle::{validate_series, Candle};
use crate::error::ValidationError;
use crate::indicators::{self, Bands, Indicators};
use crate::trading::IndicatorConfig;

/// Candles and derived indicators for one symbol, immutable for the cycle.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub taken_at: DateTime<Utc>,

    /// Closed candles on the signal timeframe
    pub candles: Vec<Candle>,
    pub indicators: Indicators,

    /// Moving average of the filter timeframe closes
    pub filter_ma: Vec<f64>,

    /// Closed candles on the fast timeframe (may be empty)
    pub fast_candles: Vec<Candle>,
    pub fast_bands: Bands,
}

impl MarketSnapshot {
    pub fn new(
        symbol: impl Into<String>,
        taken_at: DateTime<Utc>,
        candles: Vec<Candle>,
        filter_candles: Vec<Candle>,
        fast_candles: Vec<Candle>,
        config: &IndicatorConfig,
    ) -> Result<Self, ValidationError> {
        validate_series(&candles)?;
        validate_series(&filter_candles)?;
        validate_series(&fast_candles)?;

        let needed = config.min_history();
        if candles.len() < needed {
            return Err(ValidationError::InsufficientHistory {
                needed,
                got: candles.len(),
            });
        }
        if filter_candles.len() < config.filter_ma + 1 {
            return Err(ValidationError::InsufficientHistory {
                needed: config.filter_ma + 1,
                got: filter_candles.len(),
            });
        }

        let indicators = Indicators::compute(&candles, config);
        let filter_closes: Vec<f64> = filter_candles.iter().map(|c| c.close).collect();
        let filter_ma = indicators::sma(&filter_closes, config.filter_ma);
        let fast_closes: Vec<f64> = fast_candles.iter().map(|c| c.close).collect();
        let fast_bands =
            indicators::bollinger(&fast_closes, config.bollinger_period, config.bollinger_std);

        Ok(Self {
            symbol: symbol.into(),
            taken_at,
            candles,
            indicators,
            filter_ma,
            fast_candles,
            fast_bands,
        })
    }

    /// Index of the most recent closed signal candle.
    pub fn last_index(&self) -> usize {
        self.candles.len().saturating_sub(1)
    }

    pub fn last_candle(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Open time of the most recent closed signal candle.
    pub fn bar_time(&self) -> DateTime<Utc> {
        self.candles
            .last()
            .map(|c| c.open_time)
            .unwrap_or(self.taken_at)
    }

    /// Latest known price: last fast close, else last signal close.
    pub fn price(&self) -> f64 {
        self.fast_candles
            .last()
            .or(self.candles.last())
            .map(|c| c.close)
            .unwrap_or(f64::NAN)
    }

    /// Percent change of the last close over roughly one hour.
    pub fn hourly_change_pct(&self) -> Option<f64> {
        let last = self.candles.last()?;
        let cutoff = last.open_time - Duration::hours(1);
        let base = self.candles.iter().rev().find(|c| c.open_time <= cutoff)?;
        if base.close <= 0.0 {
            return None;
        }
        Some((last.close - base.close) / base.close * 100.0)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_rejects_short_history() {
        let config = IndicatorConfig::default();
        let candles = candles_from(&[100.0; 20], 1.0, 10.0);
        let err = MarketSnapshot::new(
            "BTCUSDT",
            Utc::now(),
            candles.clone(),
            candles,
            Vec::new(),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InsufficientHistory { .. }));
    }

    #[test]
    fn test_price_and_hourly_change() {
        let config = IndicatorConfig::default();
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + i as f64 * 0.1).collect();
        let snap = snapshot_from(candles_from(&closes, 0.5, 10.0), &config);

        assert_eq!(snap.price(), *closes.last().unwrap());
        // Twelve 5m bars back
        let change = snap.hourly_change_pct().unwrap();
        let expected = (closes[119] - closes[107]) / closes[107] * 100.0;
        assert!((change - expected).abs() < 1e-9);
    }
}
