//! Open position owned by a single symbol loop.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::signal::{Direction, StrategyId};
use crate::error::ValidationError;

/// One fill that built the position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// One funding settlement on a held position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingPayment {
    /// Positive when paid, negative when received
    pub amount: Decimal,
    pub settled_at: DateTime<Utc>,
}

/// Lifecycle state while the position exists.
///
/// FLAT is the absence of a position; CLOSED is its conversion into a
/// `TradeRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Open,
    PartiallyClosed,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Open => "OPEN",
            PositionState::PartiallyClosed => "PARTIALLY_CLOSED",
        }
    }
}

/// Which trailing algorithm maintains the stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Price minus ATR times a volatility-adjusted multiplier
    AdaptiveAtr,
    /// Lookback extreme minus ATR; entered once and never left
    Chandelier,
    /// Percent off the favorable extreme (breakout trades)
    PercentTrail,
}

/// A leveraged position with its risk bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    pub strategy: StrategyId,
    pub entries: Vec<Entry>,
    pub stop: Decimal,
    pub take_profit: Option<Decimal>,

    /// |first entry - initial stop|, fixed for the life of the position
    pub risk_per_unit: Decimal,

    /// R in quote currency: risk_per_unit x quantity
    pub initial_risk: Decimal,

    pub pyramid_count: u32,
    pub state: PositionState,
    pub stop_mode: StopMode,

    /// Highest high (long) or lowest low (short) seen while open
    pub favorable_extreme: Decimal,

    pub last_stop_update: Option<DateTime<Utc>>,
    pub opened_at: DateTime<Utc>,

    /// Quantity of the most recent fill that increased the position
    pub last_add_quantity: Decimal,

    /// Gross PnL realized by partial closes
    #[serde(default)]
    pub realized_pnl: Decimal,
    /// Fees realized by partial closes: their exit fees plus their share of
    /// entry fees
    #[serde(default)]
    pub exit_fees: Decimal,
    #[serde(default)]
    pub closed_quantity: Decimal,
    /// Sum of price x quantity over partial closes
    #[serde(default)]
    pub exit_notional: Decimal,
    #[serde(default)]
    pub partial_closes: u32,

    /// Net funding paid while open; negative when received
    #[serde(default)]
    pub funding_fees: Decimal,
    /// Settlement time of the latest funding payment counted
    #[serde(default)]
    pub funding_synced_to: Option<DateTime<Utc>>,

    // Guards for one-shot transitions
    #[serde(default)]
    pub exhaustion_armed: bool,
    #[serde(default)]
    pub exhaustion_fired: bool,
    #[serde(default)]
    pub divergence_bars: u32,
    #[serde(default)]
    pub last_divergence_bar: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_reversal_bar: Option<DateTime<Utc>>,
}

impl Position {
    /// Open a position from its first fill.
    pub fn new(
        symbol: String,
        direction: Direction,
        strategy: StrategyId,
        first: Entry,
        stop: Decimal,
        take_profit: Option<Decimal>,
        stop_mode: StopMode,
    ) -> Self {
        let risk_per_unit = (first.price - stop).abs();
        Self {
            symbol,
            direction,
            strategy,
            stop,
            take_profit,
            risk_per_unit,
            initial_risk: risk_per_unit * first.quantity,
            pyramid_count: 0,
            state: PositionState::Open,
            stop_mode,
            favorable_extreme: first.price,
            last_stop_update: None,
            opened_at: first.timestamp,
            last_add_quantity: first.quantity,
            realized_pnl: Decimal::ZERO,
            exit_fees: Decimal::ZERO,
            closed_quantity: Decimal::ZERO,
            exit_notional: Decimal::ZERO,
            partial_closes: 0,
            funding_fees: Decimal::ZERO,
            funding_synced_to: None,
            exhaustion_armed: false,
            exhaustion_fired: false,
            divergence_bars: 0,
            last_divergence_bar: None,
            last_reversal_bar: None,
            entries: vec![first],
        }
    }

    /// Total open quantity.
    pub fn quantity(&self) -> Decimal {
        self.entries.iter().map(|e| e.quantity).sum()
    }

    /// Quantity-weighted average entry price.
    pub fn average_price(&self) -> Decimal {
        let qty = self.quantity();
        if qty.is_zero() {
            return Decimal::ZERO;
        }
        self.entries.iter().map(|e| e.price * e.quantity).sum::<Decimal>() / qty
    }

    pub fn first_entry_price(&self) -> Decimal {
        self.entries.first().map(|e| e.price).unwrap_or(Decimal::ZERO)
    }

    pub fn entry_fees(&self) -> Decimal {
        self.entries.iter().map(|e| e.fee).sum()
    }

    /// Price at which closing the whole position recovers the entry fees.
    pub fn breakeven_price(&self) -> Decimal {
        let qty = self.quantity();
        if qty.is_zero() {
            return Decimal::ZERO;
        }
        let notional: Decimal = self.entries.iter().map(|e| e.price * e.quantity).sum();
        match self.direction {
            Direction::Long => (notional + self.entry_fees()) / qty,
            Direction::Short => (notional - self.entry_fees()) / qty,
        }
    }

    /// Fold funding payments settled after the last sync into the
    /// position; returns the amount added.
    pub fn add_funding(&mut self, payments: &[FundingPayment]) -> Decimal {
        let from = self.funding_synced_to.unwrap_or(self.opened_at);
        let mut added = Decimal::ZERO;
        for payment in payments.iter().filter(|p| p.settled_at > from) {
            added += payment.amount;
            self.funding_synced_to = self.funding_synced_to.max(Some(payment.settled_at));
        }
        self.funding_fees += added;
        added
    }

    /// Mark-to-market PnL of the open quantity.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.average_price()) * self.quantity() * self.direction.sign()
    }

    /// Favorable move per unit, measured from the first entry.
    pub fn profit_per_unit(&self, price: Decimal) -> Decimal {
        (price - self.first_entry_price()) * self.direction.sign()
    }

    /// Favorable move expressed in multiples of the initial risk per unit.
    pub fn profit_multiple(&self, price: Decimal) -> Decimal {
        if self.risk_per_unit.is_zero() {
            return Decimal::ZERO;
        }
        self.profit_per_unit(price) / self.risk_per_unit
    }

    pub fn notional(&self, price: Decimal) -> Decimal {
        self.quantity() * price
    }

    /// Margin locked by the position at its entry prices.
    pub fn required_margin(&self, leverage: u32) -> Decimal {
        if leverage == 0 {
            return self.notional(self.average_price());
        }
        self.notional(self.average_price()) / Decimal::from(leverage)
    }

    /// Track the favorable extreme; returns true when it moved.
    pub fn mark_extreme(&mut self, high: Decimal, low: Decimal) -> bool {
        let candidate = match self.direction {
            Direction::Long => high,
            Direction::Short => low,
        };
        if self.direction.is_tighter(candidate, self.favorable_extreme) {
            self.favorable_extreme = candidate;
            true
        } else {
            false
        }
    }

    /// Move the stop to `candidate` only if that tightens it and leaves it on
    /// the protective side of `price`.
    pub fn ratchet_stop(&mut self, candidate: Decimal, price: Decimal, now: DateTime<Utc>) -> bool {
        if candidate <= Decimal::ZERO {
            return false;
        }
        if !self.direction.is_tighter(candidate, self.stop) {
            return false;
        }
        if !self.direction.is_tighter(price, candidate) {
            return false;
        }
        self.stop = candidate;
        self.last_stop_update = Some(now);
        true
    }

    /// Whether the stop is already at or beyond `level`.
    pub fn stop_at_or_past(&self, level: Decimal) -> bool {
        !self.direction.is_tighter(level, self.stop)
    }

    /// Shrink every entry by `remaining / current` after a partial close.
    pub fn scale_entries(&mut self, ratio: Decimal) {
        for entry in &mut self.entries {
            entry.quantity *= ratio;
            entry.fee *= ratio;
        }
        self.initial_risk *= ratio;
        self.last_add_quantity *= ratio;
    }

    /// Structural checks applied to anything restored from storage.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fail = |msg: String| Err(ValidationError::Position(msg));

        if self.symbol.is_empty() {
            return fail("empty symbol".into());
        }
        if self.entries.is_empty() {
            return fail("no entries".into());
        }
        if self
            .entries
            .iter()
            .any(|e| e.price <= Decimal::ZERO || e.quantity <= Decimal::ZERO || e.fee < Decimal::ZERO)
        {
            return fail("entry with non-positive price or quantity".into());
        }
        if self.stop <= Decimal::ZERO {
            return fail(format!("stop {} is not positive", self.stop));
        }
        if self.risk_per_unit <= Decimal::ZERO || self.initial_risk <= Decimal::ZERO {
            return fail("risk unit is not positive".into());
        }
        if self.pyramid_count as usize + 1 != self.entries.len() {
            return fail(format!(
                "pyramid count {} does not match {} entries",
                self.pyramid_count,
                self.entries.len()
            ));
        }
        if let Some(tp) = self.take_profit {
            if tp <= Decimal::ZERO {
                return fail(format!("take profit {} is not positive", tp));
            }
        }
        if self.state == PositionState::Open && self.partial_closes > 0 {
            return fail("open position records partial closes".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position() -> Position {
        Position::new(
            "BTCUSDT".to_string(),
            Direction::Long,
            StrategyId::Pullback,
            Entry {
                price: dec!(100),
                quantity: dec!(5),
                fee: dec!(0.25),
                timestamp: Utc::now(),
            },
            dec!(98),
            None,
            StopMode::AdaptiveAtr,
        )
    }

    #[test]
    fn test_risk_unit_fixed_at_first_entry() {
        let pos = long_position();
        assert_eq!(pos.risk_per_unit, dec!(2));
        assert_eq!(pos.initial_risk, dec!(10));
        assert_eq!(pos.profit_multiple(dec!(104)), dec!(2));
    }

    #[test]
    fn test_average_and_breakeven() {
        let mut pos = long_position();
        pos.entries.push(Entry {
            price: dec!(110),
            quantity: dec!(5),
            fee: dec!(0.25),
            timestamp: Utc::now(),
        });
        pos.pyramid_count = 1;

        assert_eq!(pos.quantity(), dec!(10));
        assert_eq!(pos.average_price(), dec!(105));
        // (1050 + 0.5) / 10
        assert_eq!(pos.breakeven_price(), dec!(105.05));
        assert_eq!(pos.unrealized_pnl(dec!(107)), dec!(20));
    }

    #[test]
    fn test_ratchet_never_loosens() {
        let mut pos = long_position();
        let now = Utc::now();

        assert!(pos.ratchet_stop(dec!(99), dec!(103), now));
        assert!(!pos.ratchet_stop(dec!(98.5), dec!(103), now));
        // Above the market would be an immediate stop-out
        assert!(!pos.ratchet_stop(dec!(104), dec!(103), now));
        assert_eq!(pos.stop, dec!(99));
    }

    #[test]
    fn test_short_ratchet_moves_down_only() {
        let mut pos = long_position();
        pos.direction = Direction::Short;
        pos.stop = dec!(102);
        let now = Utc::now();

        assert!(pos.ratchet_stop(dec!(101), dec!(97), now));
        assert!(!pos.ratchet_stop(dec!(101.5), dec!(97), now));
        assert_eq!(pos.stop, dec!(101));
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut pos = long_position();
        pos.entries.push(Entry {
            price: dec!(104.37),
            quantity: dec!(3.75),
            fee: dec!(0.19),
            timestamp: Utc::now(),
        });
        pos.pyramid_count = 1;
        pos.stop = dec!(101.125);
        pos.state = PositionState::Open;

        let json = serde_json::to_string(&pos).unwrap();
        let restored: Position = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.average_price(), pos.average_price());
        assert_eq!(restored.quantity(), pos.quantity());
        assert_eq!(restored.stop, pos.stop);
        assert_eq!(restored.pyramid_count, pos.pyramid_count);
        assert_eq!(restored.state, pos.state);
        assert_eq!(restored, pos);
    }

    #[test]
    fn test_validate_rejects_inconsistent_state() {
        let mut pos = long_position();
        assert!(pos.validate().is_ok());

        pos.pyramid_count = 2;
        assert!(pos.validate().is_err());

        let mut pos = long_position();
        pos.entries.clear();
        assert!(pos.validate().is_err());
    }

    #[test]
    fn test_funding_counted_once() {
        let mut pos = long_position();
        let opened = pos.opened_at;
        let payment = |hours: i64, amount: Decimal| FundingPayment {
            amount,
            settled_at: opened + chrono::Duration::hours(hours),
        };
        // Settled before the position existed
        let payments = vec![payment(-1, dec!(9)), payment(2, dec!(0.05)), payment(10, dec!(-0.02))];

        assert_eq!(pos.add_funding(&payments), dec!(0.03));
        assert_eq!(pos.funding_synced_to, Some(opened + chrono::Duration::hours(10)));
        // Same history again
        assert_eq!(pos.add_funding(&payments), Decimal::ZERO);
        assert_eq!(pos.funding_fees, dec!(0.03));
    }

    #[test]
    fn test_scale_entries_preserves_r_proportionally() {
        let mut pos = long_position();
        pos.scale_entries(dec!(0.5));
        assert_eq!(pos.quantity(), dec!(2.5));
        assert_eq!(pos.initial_risk, dec!(5));
        assert_eq!(pos.average_price(), dec!(100));
    }
}
