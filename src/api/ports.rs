//! Boundaries between the decision loop and the outside world.
//!
//! The loop only sees these traits; live and paper execution, HTTP or
//! scripted market data and SQLite or in-memory storage are interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::PortError;
use crate::models::{AiAssessment, Candle, Direction, FundingPayment, Position, TradeRecord};
use crate::trading::{MarginMode, ShadowOutcome, Trend};

/// Ordered OHLCV source. Candles come back ascending and closed; gaps are
/// possible.
#[async_trait]
pub trait MarketDataPort: Send + Sync {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, PortError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Side that increases exposure in `direction`.
    pub fn opening(direction: Direction) -> Self {
        match direction {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Side that reduces exposure in `direction`.
    pub fn closing(direction: Direction) -> Self {
        Self::opening(direction.opposite())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderKind {
    Market,
    Limit(Decimal),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub kind: OrderKind,
    pub reduce_only: bool,
    /// Latest price the loop saw when deciding
    pub reference_price: Decimal,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, quantity: Decimal, reference_price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            quantity,
            kind: OrderKind::Market,
            reduce_only: false,
            reference_price,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderStatus {
    Filled(Fill),
    /// Resting on the book
    Pending { order_id: String, price: Decimal },
    Cancelled,
}

/// Net position as the exchange reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

/// Order routing and account state.
#[async_trait]
pub trait ExecutionPort: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderStatus, PortError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), PortError>;
    async fn order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, PortError>;
    async fn get_position(&self, symbol: &str) -> Result<Option<ExchangePosition>, PortError>;
    async fn get_equity(&self) -> Result<Decimal, PortError>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), PortError>;
    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), PortError>;
    /// Funding settled on `symbol` after `since`, oldest first.
    async fn funding_fees(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FundingPayment>, PortError>;
}

/// What the analyst is told about the market.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisContext {
    pub symbol: String,
    pub price: Decimal,
    pub trend: Trend,
    pub rsi: Option<f64>,
    pub adx: Option<f64>,
    pub atr: Option<f64>,
    pub hourly_change_pct: Option<f64>,
    pub position: Option<Direction>,
    /// What prompted the consultation
    pub trigger: &'static str,
    pub at: DateTime<Utc>,
}

/// External macro/AI view. A failure is treated as a neutral call.
#[async_trait]
pub trait AnalystPort: Send + Sync {
    async fn analyze(&self, context: &AnalysisContext) -> Result<AiAssessment, PortError>;
}

/// A resolved analyst trade, live or shadow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiOutcome {
    pub symbol: String,
    pub direction: Direction,
    pub return_pct: f64,
    pub live: bool,
    pub resolved_at: DateTime<Utc>,
}

impl From<&ShadowOutcome> for AiOutcome {
    fn from(o: &ShadowOutcome) -> Self {
        Self {
            symbol: o.trade.symbol.clone(),
            direction: o.trade.direction,
            return_pct: o.return_pct,
            live: false,
            resolved_at: o.resolved_at,
        }
    }
}

/// Durable state.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    /// `Err(PortError::Corrupt)` when a stored position fails validation.
    async fn load_position(&self, symbol: &str) -> Result<Option<Position>, PortError>;
    async fn save_position(&self, position: &Position) -> Result<(), PortError>;
    async fn delete_position(&self, symbol: &str) -> Result<(), PortError>;
    async fn append_trade(&self, trade: &TradeRecord) -> Result<(), PortError>;
    /// Most recent `limit` trades, oldest first.
    async fn recent_trades(&self, symbol: Option<&str>, limit: usize) -> Result<Vec<TradeRecord>, PortError>;
    async fn load_performance_score(&self) -> Result<Option<f64>, PortError>;
    async fn save_performance_score(&self, score: f64) -> Result<(), PortError>;
    async fn append_ai_outcome(&self, outcome: &AiOutcome) -> Result<(), PortError>;
    /// Most recent `limit` outcomes, oldest first.
    async fn recent_ai_outcomes(&self, limit: usize) -> Result<Vec<AiOutcome>, PortError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PositionOpened,
    PositionClosed,
    PyramidAdd,
    PartialClose,
    StopTightened,
    SizingAdjusted,
    OrderRejected,
    StateCorrupted,
    AnalystDegraded,
    CycleSkipped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PositionOpened => "position_opened",
            EventKind::PositionClosed => "position_closed",
            EventKind::PyramidAdd => "pyramid_add",
            EventKind::PartialClose => "partial_close",
            EventKind::StopTightened => "stop_tightened",
            EventKind::SizingAdjusted => "sizing_adjusted",
            EventKind::OrderRejected => "order_rejected",
            EventKind::StateCorrupted => "state_corrupted",
            EventKind::AnalystDegraded => "analyst_degraded",
            EventKind::CycleSkipped => "cycle_skipped",
        }
    }
}

/// Fire-and-forget operator notifications. Implementations swallow and log
/// their own failures.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn notify(&self, kind: EventKind, payload: &str);
}
