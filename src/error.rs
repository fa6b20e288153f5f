//! Typed failures that cross the port boundary.
//!
//! Application plumbing (startup, CLI) stays on `anyhow`; anything the
//! decision loop has to branch on is one of these.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure reported by one of the external ports.
#[derive(Debug, Error)]
pub enum PortError {
    /// Timeouts, connection resets, 5xx and rate-limit responses. Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// The exchange refused the request (invalid quantity, price, symbol).
    #[error("exchange rejected request: {0}")]
    ExchangeRejected(String),

    /// The counterparty answered with something we could not decode.
    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Persisted state exists but fails validation.
    #[error("persisted state is corrupt: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The analyst produced nothing usable. Treated as a neutral assessment.
    #[error("analyst unavailable: {0}")]
    Analyst(String),
}

impl PortError {
    /// Whether a bounded retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<sqlx::Error> for PortError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for PortError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Protocol(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Input that cannot be used for a decision.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("malformed candle at {0}")]
    MalformedCandle(DateTime<Utc>),

    #[error("candles out of order at {0}")]
    OutOfOrder(DateTime<Utc>),

    #[error("not enough history: need {needed} candles, got {got}")]
    InsufficientHistory { needed: usize, got: usize },

    #[error("invalid signal: {0}")]
    Signal(String),

    #[error("invalid position: {0}")]
    Position(String),
}
