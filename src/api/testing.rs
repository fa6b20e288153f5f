//! Scripted port implementations for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use super::ports::{
    AnalysisContext, AnalystPort, EventKind, ExchangePosition, ExecutionPort, MarketDataPort,
    NotificationPort, OrderRequest, OrderStatus,
};
use crate::error::PortError;
use crate::models::{AiAssessment, Candle, FundingPayment};
use crate::trading::MarginMode;

/// Serves fixed candle series per timeframe; `advance` appends bars.
#[derive(Default)]
pub struct ScriptedMarket {
    series: Mutex<HashMap<String, Vec<Candle>>>,
    failures: Mutex<u32>,
}

impl ScriptedMarket {
    pub fn with(timeframe: &str, candles: Vec<Candle>) -> Self {
        let market = Self::default();
        market.set(timeframe, candles);
        market
    }

    pub fn set(&self, timeframe: &str, candles: Vec<Candle>) {
        self.series.lock().unwrap().insert(timeframe.to_string(), candles);
    }

    /// Append a bar 5 minutes after the last one on `timeframe`.
    pub fn push_close(&self, timeframe: &str, open: f64, close: f64, volume: f64) {
        let mut series = self.series.lock().unwrap();
        let bars = series.entry(timeframe.to_string()).or_default();
        let Some(last) = bars.last().copied() else {
            return;
        };
        bars.push(Candle {
            open_time: last.open_time + Duration::minutes(5),
            open,
            high: open.max(close) + 0.05,
            low: open.min(close) - 0.05,
            close,
            volume,
        });
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock().unwrap() = n;
    }
}

#[async_trait]
impl MarketDataPort for ScriptedMarket {
    async fn get_candles(
        &self,
        _symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, PortError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(PortError::Network("scripted outage".to_string()));
            }
        }
        let series = self.series.lock().unwrap();
        let bars = series.get(timeframe).cloned().unwrap_or_default();
        let start = bars.len().saturating_sub(limit);
        Ok(bars[start..].to_vec())
    }
}

/// Returns a fixed assessment, or fails when none is set.
#[derive(Default)]
pub struct ScriptedAnalyst {
    pub assessment: Mutex<Option<AiAssessment>>,
    pub calls: Mutex<u32>,
}

#[async_trait]
impl AnalystPort for ScriptedAnalyst {
    async fn analyze(&self, _context: &AnalysisContext) -> Result<AiAssessment, PortError> {
        *self.calls.lock().unwrap() += 1;
        self.assessment
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PortError::Analyst("scripted failure".to_string()))
    }
}

/// Records every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<(EventKind, String)>>,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }
}

#[async_trait]
impl NotificationPort for RecordingNotifier {
    async fn notify(&self, kind: EventKind, payload: &str) {
        self.events.lock().unwrap().push((kind, payload.to_string()));
    }
}

/// Wraps a real execution port and distorts it: opening fills can be
/// repriced and reduce-only orders can be made to fail transiently.
pub struct ScriptedExecution {
    inner: Arc<dyn ExecutionPort>,
    pub opening_price: Mutex<Option<Decimal>>,
    pub reduce_only_down: Mutex<bool>,
}

impl ScriptedExecution {
    pub fn new(inner: Arc<dyn ExecutionPort>) -> Self {
        Self {
            inner,
            opening_price: Mutex::new(None),
            reduce_only_down: Mutex::new(false),
        }
    }
}

#[async_trait]
impl ExecutionPort for ScriptedExecution {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderStatus, PortError> {
        if request.reduce_only && *self.reduce_only_down.lock().unwrap() {
            return Err(PortError::Network("scripted outage".to_string()));
        }
        let status = self.inner.place_order(request).await?;
        let repriced = *self.opening_price.lock().unwrap();
        Ok(match (status, repriced) {
            (OrderStatus::Filled(mut fill), Some(price)) if !request.reduce_only => {
                fill.price = price;
                OrderStatus::Filled(fill)
            }
            (status, _) => status,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), PortError> {
        self.inner.cancel_order(symbol, order_id).await
    }

    async fn order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, PortError> {
        self.inner.order_status(symbol, order_id).await
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, PortError> {
        self.inner.get_position(symbol).await
    }

    async fn get_equity(&self) -> Result<Decimal, PortError> {
        self.inner.get_equity().await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), PortError> {
        self.inner.set_leverage(symbol, leverage).await
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), PortError> {
        self.inner.set_margin_mode(symbol, mode).await
    }

    async fn funding_fees(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FundingPayment>, PortError> {
        self.inner.funding_fees(symbol, since).await
    }
}
