//! OHLCV candles as delivered by the market-data port.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// One closed bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Base-asset volume
    pub volume: f64,
}

impl Candle {
    /// Finite, positive prices with a high/low range that contains open and close.
    pub fn is_well_formed(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite() && *p > 0.0)
            && self.volume.is_finite()
            && self.volume >= 0.0
            && self.high >= self.low
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
    }

    /// Absolute body size.
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Check a series is well formed and strictly ascending.
///
/// Gaps between bars are allowed; exchanges skip bars during maintenance.
pub fn validate_series(candles: &[Candle]) -> Result<(), ValidationError> {
    for (i, candle) in candles.iter().enumerate() {
        if !candle.is_well_formed() {
            return Err(ValidationError::MalformedCandle(candle.open_time));
        }
        if i > 0 && candle.open_time <= candles[i - 1].open_time {
            return Err(ValidationError::OutOfOrder(candle.open_time));
        }
    }
    Ok(())
}
