//! Closed-trade records.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::signal::{Direction, StrategyId};

/// Why a position was fully closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    /// Operator or reconciliation driven
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::Manual => "manual",
        }
    }
}

/// Immutable snapshot of a closed position. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub direction: Direction,
    pub strategy: StrategyId,

    /// Average entry price over all fills
    pub entry_price: Decimal,

    /// Quantity-weighted exit price including partial closes
    pub exit_price: Decimal,

    /// Total quantity closed over the life of the position
    pub quantity: Decimal,

    pub gross_pnl: Decimal,
    /// Trading commissions
    pub fees: Decimal,
    /// Net funding paid while held; negative when funding was received
    #[serde(default)]
    pub funding_fees: Decimal,
    /// Gross PnL minus commissions and funding
    pub net_pnl: Decimal,

    /// Net PnL over the R held at close
    pub r_multiple: Decimal,

    pub pyramid_adds: u32,
    pub partial_closes: u32,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub exit_reason: ExitReason,
}

impl TradeRecord {
    pub fn duration(&self) -> Duration {
        self.closed_at - self.opened_at
    }

    pub fn is_win(&self) -> bool {
        self.net_pnl > Decimal::ZERO
    }

    /// Net PnL relative to entry notional.
    pub fn return_pct(&self) -> Decimal {
        let notional = self.entry_price * self.quantity;
        if notional.is_zero() {
            return Decimal::ZERO;
        }
        self.net_pnl / notional
    }
}
