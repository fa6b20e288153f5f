//! Public kline client for Binance USD-M futures.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use super::ports::MarketDataPort;
use crate::error::PortError;
use crate::models::{validate_series, Candle};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Exchange cap on klines per request
const MAX_LIMIT: usize = 1500;

/// Read-only market data over HTTP.
pub struct MarketClient {
    client: Client,
    base_url: String,
}

impl MarketClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MarketDataPort for MarketClient {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, PortError> {
        // One extra for the still-forming candle that gets dropped
        let request_limit = (limit + 1).min(MAX_LIMIT);
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, timeframe, request_limit
        );
        debug!(url = %url, "Fetching klines");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let payload: Value = response.json().await?;
        let mut candles = parse_klines(&payload, Utc::now())?;
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        validate_series(&candles)?;
        Ok(candles)
    }
}

fn classify_status(status: StatusCode, body: &str) -> PortError {
    let msg = format!("{} - {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        PortError::Network(msg)
    } else {
        PortError::ExchangeRejected(msg)
    }
}

/// Decode the array-of-arrays kline payload, dropping any candle that has
/// not closed by `now`.
///
/// Row layout: `[open_time_ms, "open", "high", "low", "close", "volume",
/// close_time_ms, ...]`.
pub fn parse_klines(payload: &Value, now: DateTime<Utc>) -> Result<Vec<Candle>, PortError> {
    let rows = payload
        .as_array()
        .ok_or_else(|| PortError::Protocol("klines payload is not an array".to_string()))?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let fields = row
            .as_array()
            .filter(|f| f.len() >= 7)
            .ok_or_else(|| PortError::Protocol(format!("malformed kline row: {}", row)))?;

        let close_time = timestamp(&fields[6])?;
        if close_time > now {
            continue;
        }
        candles.push(Candle {
            open_time: timestamp(&fields[0])?,
            open: number(&fields[1])?,
            high: number(&fields[2])?,
            low: number(&fields[3])?,
            close: number(&fields[4])?,
            volume: number(&fields[5])?,
        });
    }
    Ok(candles)
}

fn timestamp(value: &Value) -> Result<DateTime<Utc>, PortError> {
    value
        .as_i64()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| PortError::Protocol(format!("bad timestamp: {}", value)))
}

/// Prices arrive as strings; accept plain numbers too.
fn number(value: &Value) -> Result<f64, PortError> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
    .ok_or_else(|| PortError::Protocol(format!("bad number: {}", value)))
}
