//! Position lifecycle.
//!
//! FLAT -> OPEN on an accepted signal, OPEN -> OPEN on pyramid adds and stop
//! maintenance, OPEN -> PARTIALLY_CLOSED on a partial take-profit, and
//! OPEN/PARTIALLY_CLOSED -> CLOSED (a `TradeRecord`) on stop, target or a
//! manual close. Every stop change goes through `Position::ratchet_stop`, so
//! a stop never loosens.
//!
//! Nothing here talks to the exchange: the caller executes and only applies
//! a transition once its fill is known.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::config::{AccountConfig, EngineConfig, PartialTakeProfitConfig, PyramidConfig, StopConfig};
use super::performance::DynamicParams;
use super::trend::Trend;
use crate::error::ValidationError;
use crate::indicators;
use crate::models::{
    Direction, Entry, ExitReason, MarketSnapshot, Position, PositionState, Signal, StopMode,
    StrategyId, TradeRecord,
};

/// What moved a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Trailing(StopMode),
    Pyramid,
    Exhaustion,
    Defensive(DefensiveTrigger),
    PartialClose,
}

/// A stop change that was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct StopMove {
    pub from: Decimal,
    pub to: Decimal,
    pub reason: StopReason,
}

/// Adverse condition that tightens the stop without closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefensiveTrigger {
    ReversalCandle,
    TrendDivergence,
    OpposingAnalyst,
}

impl DefensiveTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefensiveTrigger::ReversalCandle => "reversal_candle",
            DefensiveTrigger::TrendDivergence => "trend_divergence",
            DefensiveTrigger::OpposingAnalyst => "opposing_analyst",
        }
    }
}

/// A defensive trigger and the stop change it caused, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct DefensiveAction {
    pub trigger: DefensiveTrigger,
    pub moved: Option<StopMove>,
}

#[derive(Debug, Clone)]
pub struct PositionManager {
    account: AccountConfig,
    pyramid: PyramidConfig,
    stops: StopConfig,
    partial: PartialTakeProfitConfig,
    breakout_trail_pct: Decimal,
}

impl PositionManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            account: config.account.clone(),
            pyramid: config.pyramid.clone(),
            stops: config.stops.clone(),
            partial: config.partial_tp.clone(),
            breakout_trail_pct: config.breakout.trail_percent,
        }
    }

    /// Stop for a new position.
    ///
    /// Algorithmic signals carry their own stop. Analyst signals use the
    /// ATR stop unless the analyst's stop is stricter.
    pub fn initial_stop(&self, signal: &Signal, atr: f64, params: &DynamicParams) -> Option<Decimal> {
        if signal.strategy != StrategyId::Ai {
            return Some(signal.stop);
        }
        let offset = to_decimal(atr * params.atr_multiplier)?;
        let atr_stop = match signal.direction {
            Direction::Long => signal.entry - offset,
            Direction::Short => signal.entry + offset,
        };
        let analyst_usable = signal.stop > Decimal::ZERO
            && signal.direction.is_tighter(signal.entry, signal.stop);
        if analyst_usable && signal.direction.is_tighter(signal.stop, atr_stop) {
            Some(signal.stop)
        } else if atr_stop > Decimal::ZERO {
            Some(atr_stop)
        } else {
            None
        }
    }

    /// FLAT -> OPEN from the entry fill.
    pub fn open(
        &self,
        symbol: &str,
        signal: &Signal,
        fill: Entry,
        stop: Decimal,
    ) -> Result<Position, ValidationError> {
        if !signal.direction.is_tighter(fill.price, stop) {
            return Err(ValidationError::Position(format!(
                "stop {} is not protective for a {} filled at {}",
                stop,
                signal.direction.as_str(),
                fill.price
            )));
        }
        let mode = match signal.strategy {
            StrategyId::Breakout => StopMode::PercentTrail,
            _ => StopMode::AdaptiveAtr,
        };
        let position = Position::new(
            symbol.to_string(),
            signal.direction,
            signal.strategy,
            fill,
            stop,
            signal.target,
            mode,
        );
        position.validate()?;

        info!(
            symbol,
            strategy = signal.strategy.as_str(),
            direction = signal.direction.as_str(),
            price = %position.average_price(),
            qty = %position.quantity(),
            stop = %position.stop,
            r = %position.initial_risk,
            "Position opened"
        );
        Ok(position)
    }

    /// Whether `price` has crossed the stop or the target. Stop wins.
    pub fn exit_trigger(&self, position: &Position, price: Decimal) -> Option<ExitReason> {
        let stop_hit = match position.direction {
            Direction::Long => price <= position.stop,
            Direction::Short => price >= position.stop,
        };
        if stop_hit {
            return Some(ExitReason::StopLoss);
        }
        let target_hit = position.take_profit.is_some_and(|tp| match position.direction {
            Direction::Long => price >= tp,
            Direction::Short => price <= tp,
        });
        target_hit.then_some(ExitReason::TakeProfit)
    }

    /// Desired quantity for the next pyramid add, before sizing constraints.
    pub fn plan_pyramid(
        &self,
        position: &Position,
        price: Decimal,
        trend: Trend,
        params: &DynamicParams,
    ) -> Option<Decimal> {
        if !self.pyramid.enabled
            || position.state != PositionState::Open
            || position.pyramid_count >= self.pyramid.max_adds
        {
            return None;
        }
        if self.pyramid.require_trend && trend.direction() != Some(position.direction) {
            return None;
        }

        // Each further add needs a further multiple of R
        let trigger = to_decimal(params.pyramid_trigger_r)? * Decimal::from(position.pyramid_count + 1);
        if position.profit_multiple(price) < trigger {
            return None;
        }
        Some(position.last_add_quantity * self.pyramid.add_ratio)
    }

    /// OPEN -> OPEN (pyramid) from the add fill.
    ///
    /// R is re-derived for the new quantity and the stop is re-anchored to
    /// the tighter of breakeven and the ATR stop, through the ratchet.
    pub fn apply_pyramid(
        &self,
        position: &mut Position,
        fill: Entry,
        atr: f64,
        params: &DynamicParams,
    ) -> Result<Option<StopMove>, ValidationError> {
        if position.pyramid_count >= self.pyramid.max_adds {
            return Err(ValidationError::Position(format!(
                "pyramid limit {} reached",
                self.pyramid.max_adds
            )));
        }

        let price = fill.price;
        let now = fill.timestamp;
        position.last_add_quantity = fill.quantity;
        position.entries.push(fill);
        position.pyramid_count += 1;
        position.initial_risk = position.risk_per_unit * position.quantity();

        info!(
            symbol = %position.symbol,
            adds = position.pyramid_count,
            avg = %position.average_price(),
            qty = %position.quantity(),
            "Pyramid add"
        );

        let Some(offset) = to_decimal(atr * params.atr_multiplier) else {
            return Ok(None);
        };
        let breakeven = position.breakeven_price();
        let candidate = match position.direction {
            Direction::Long => breakeven.max(price - offset),
            Direction::Short => breakeven.min(price + offset),
        };
        Ok(self.ratchet(position, candidate, price, now, StopReason::Pyramid))
    }

    /// Trailing stop maintenance for one cycle.
    pub fn update_stop(
        &self,
        position: &mut Position,
        snapshot: &MarketSnapshot,
        params: &DynamicParams,
        now: DateTime<Utc>,
    ) -> Option<StopMove> {
        let candle = snapshot.last_candle()?;
        if let (Some(high), Some(low)) = (to_decimal(candle.high), to_decimal(candle.low)) {
            position.mark_extreme(high, low);
        }
        let price = to_decimal(snapshot.price())?;
        let profit_r = position.profit_multiple(price);

        // Permanent switch, decided before any rate limiting
        if self.stops.chandelier_enabled
            && position.stop_mode == StopMode::AdaptiveAtr
            && profit_r >= self.stops.chandelier_activation_r
        {
            position.stop_mode = StopMode::Chandelier;
            info!(symbol = %position.symbol, profit_r = %profit_r.round_dp(2), "Chandelier exit engaged");
        }

        if let Some(last) = position.last_stop_update {
            if now - last < Duration::seconds(self.stops.min_update_secs) {
                return None;
            }
        }

        let i = snapshot.last_index();
        let ind = &snapshot.indicators;
        let atr = indicators::at(&ind.atr, i)?;
        if atr / snapshot.price() * 100.0 < self.stops.volatility_floor_pct {
            debug!(symbol = %position.symbol, "Trailing paused: volatility below floor");
            return None;
        }

        let candidate = match position.stop_mode {
            StopMode::AdaptiveAtr => {
                if profit_r < self.stops.trail_activation_r {
                    return None;
                }
                let offset = to_decimal(atr * self.adaptive_multiplier(snapshot, params))?;
                match position.direction {
                    Direction::Long => price - offset,
                    Direction::Short => price + offset,
                }
            }
            StopMode::Chandelier => {
                let offset = to_decimal(atr * self.stops.chandelier_atr_multiplier)?;
                let period = self.stops.chandelier_period;
                match position.direction {
                    Direction::Long => {
                        to_decimal(indicators::highest_high(&snapshot.candles, period)?)? - offset
                    }
                    Direction::Short => {
                        to_decimal(indicators::lowest_low(&snapshot.candles, period)?)? + offset
                    }
                }
            }
            StopMode::PercentTrail => {
                let trail = self.breakout_trail_pct / Decimal::ONE_HUNDRED;
                match position.direction {
                    Direction::Long => position.favorable_extreme * (Decimal::ONE - trail),
                    Direction::Short => position.favorable_extreme * (Decimal::ONE + trail),
                }
            }
        };

        let mode = position.stop_mode;
        self.ratchet(position, candidate.round_dp(8), price, now, StopReason::Trailing(mode))
    }

    /// Base ATR multiple scaled by short-over-long ATR.
    fn adaptive_multiplier(&self, snapshot: &MarketSnapshot, params: &DynamicParams) -> f64 {
        let ind = &snapshot.indicators;
        let scale = match (indicators::last(&ind.atr_fast), indicators::last(&ind.atr_slow)) {
            (Some(fast), Some(slow)) if slow > 0.0 => (1.0
                + (fast / slow - 1.0) * self.stops.adaptive_factor)
                .clamp(self.stops.adaptive_min_scale, self.stops.adaptive_max_scale),
            _ => 1.0,
        };
        params.atr_multiplier * scale
    }

    /// ADX exhaustion: once ADX has exceeded the threshold and then fallen
    /// for the configured bars, move the stop to breakeven a single time.
    ///
    /// Returns true on the cycle the exhaustion is first detected.
    pub fn check_exhaustion(
        &self,
        position: &mut Position,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> bool {
        if position.exhaustion_fired {
            return false;
        }
        let adx = &snapshot.indicators.adx;
        let bars = self.stops.exhaustion_falling_bars;
        let start = adx.len().saturating_sub(bars + 1);
        if adx[start..]
            .iter()
            .any(|v| v.is_finite() && *v > self.stops.exhaustion_adx)
        {
            position.exhaustion_armed = true;
        }
        if !position.exhaustion_armed || !indicators::is_monotonic_tail(adx, bars, false) {
            return false;
        }

        let breakeven = position.breakeven_price();
        if position.stop_at_or_past(breakeven) {
            position.exhaustion_fired = true;
            return true;
        }
        let Some(price) = to_decimal(snapshot.price()) else {
            return false;
        };
        match self.ratchet(position, breakeven, price, now, StopReason::Exhaustion) {
            Some(_) => {
                position.exhaustion_fired = true;
                true
            }
            // Not yet beyond breakeven; retried next cycle
            None => false,
        }
    }

    /// Reversal candle, sustained trend divergence or an opposing analyst
    /// call. Each occurrence fires once; the stop only moves if the
    /// defensive level is tighter than the current stop.
    pub fn check_defensive(
        &self,
        position: &mut Position,
        snapshot: &MarketSnapshot,
        trend: Trend,
        analyst_opposes: bool,
        now: DateTime<Utc>,
    ) -> Option<DefensiveAction> {
        let i = snapshot.last_index();
        let candle = snapshot.last_candle()?;
        let bar = candle.open_time;
        let ind = &snapshot.indicators;
        let atr = indicators::at(&ind.atr, i)?;

        let divergence = self.track_divergence(position, trend, bar);
        // A qualifying candle is consumed even when another trigger wins
        let reversal =
            position.last_reversal_bar != Some(bar) && self.is_reversal_candle(position, snapshot);
        if reversal {
            position.last_reversal_bar = Some(bar);
        }

        let trigger = if analyst_opposes {
            Some(DefensiveTrigger::OpposingAnalyst)
        } else if reversal {
            Some(DefensiveTrigger::ReversalCandle)
        } else if divergence {
            Some(DefensiveTrigger::TrendDivergence)
        } else {
            None
        }?;

        let price = to_decimal(snapshot.price())?;
        let offset = to_decimal(atr * self.stops.defensive_atr_multiplier)?;
        let level = match position.direction {
            Direction::Long => price - offset,
            Direction::Short => price + offset,
        };

        let moved = if position.stop_at_or_past(level) {
            debug!(
                symbol = %position.symbol,
                trigger = trigger.as_str(),
                "Stop already at or past defensive level"
            );
            None
        } else {
            self.ratchet(position, level.round_dp(8), price, now, StopReason::Defensive(trigger))
        };

        if moved.is_some() {
            warn!(symbol = %position.symbol, trigger = trigger.as_str(), stop = %position.stop, "Defensive stop");
        }
        Some(DefensiveAction { trigger, moved })
    }

    /// Counts bars where the held trend disagrees with the position.
    /// Returns true when the count reaches the limit, then starts over.
    fn track_divergence(&self, position: &mut Position, trend: Trend, bar: DateTime<Utc>) -> bool {
        if position.last_divergence_bar.is_some_and(|last| bar <= last) {
            return false;
        }
        position.last_divergence_bar = Some(bar);

        if trend.direction() == Some(position.direction) {
            position.divergence_bars = 0;
            return false;
        }
        position.divergence_bars += 1;
        if position.divergence_bars >= self.stops.divergence_bars.max(1) {
            position.divergence_bars = 0;
            return true;
        }
        false
    }

    fn is_reversal_candle(&self, position: &Position, snapshot: &MarketSnapshot) -> bool {
        let i = snapshot.last_index();
        let Some(candle) = snapshot.last_candle() else {
            return false;
        };
        let ind = &snapshot.indicators;
        let (Some(atr), Some(avg_volume)) = (
            indicators::at(&ind.atr, i),
            i.checked_sub(1).and_then(|p| indicators::at(&ind.volume_avg, p)),
        ) else {
            return false;
        };

        let against = match position.direction {
            Direction::Long => candle.is_bearish(),
            Direction::Short => candle.is_bullish(),
        };
        against
            && candle.body() >= self.stops.reversal_body_atr * atr
            && candle.volume >= self.stops.reversal_volume_multiple * avg_volume
    }

    /// Quantity to close on a divergence or exhaustion event while in profit.
    pub fn plan_partial_close(&self, position: &Position, price: Decimal, event: bool) -> Option<Decimal> {
        if !self.partial.enabled || !event || position.partial_closes >= self.partial.max_partials {
            return None;
        }
        if position.unrealized_pnl(price) <= Decimal::ZERO {
            return None;
        }
        let quantity = position.quantity();
        let step = self.account.quantity_step;
        let close = if step > Decimal::ZERO {
            (quantity * self.partial.fraction / step).floor() * step
        } else {
            quantity * self.partial.fraction
        };
        (close > Decimal::ZERO && close < quantity).then_some(close)
    }

    /// OPEN -> PARTIALLY_CLOSED from the reduce fill. The remaining entries
    /// and R shrink proportionally; the stop moves to breakeven if tighter.
    pub fn apply_partial_close(
        &self,
        position: &mut Position,
        price: Decimal,
        quantity: Decimal,
        fee: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<StopMove>, ValidationError> {
        let total = position.quantity();
        if quantity <= Decimal::ZERO || quantity >= total {
            return Err(ValidationError::Position(format!(
                "partial close of {} from {}",
                quantity, total
            )));
        }

        let gross = (price - position.average_price()) * quantity * position.direction.sign();
        let entry_fee_share = position.entry_fees() * quantity / total;

        position.realized_pnl += gross;
        position.exit_fees += fee + entry_fee_share;
        position.closed_quantity += quantity;
        position.exit_notional += price * quantity;
        position.scale_entries((total - quantity) / total);
        position.partial_closes += 1;
        position.state = PositionState::PartiallyClosed;

        info!(
            symbol = %position.symbol,
            qty = %quantity,
            price = %price,
            pnl = %gross.round_dp(4),
            remaining = %position.quantity(),
            "Partial close"
        );

        let breakeven = position.breakeven_price();
        Ok(self.ratchet(position, breakeven, price, now, StopReason::PartialClose))
    }

    /// OPEN/PARTIALLY_CLOSED -> CLOSED: turn the position into its record.
    pub fn close(
        &self,
        position: Position,
        price: Decimal,
        fee: Decimal,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> TradeRecord {
        let open_qty = position.quantity();
        let final_gross = (price - position.average_price()) * open_qty * position.direction.sign();
        let gross_pnl = position.realized_pnl + final_gross;
        let fees = position.exit_fees + position.entry_fees() + fee;
        let net_pnl = gross_pnl - fees - position.funding_fees;

        let quantity = position.closed_quantity + open_qty;
        let exit_price = if quantity.is_zero() {
            price
        } else {
            (position.exit_notional + price * open_qty) / quantity
        };
        let full_risk = position.risk_per_unit * quantity;
        let r_multiple = if full_risk.is_zero() {
            Decimal::ZERO
        } else {
            net_pnl / full_risk
        };

        let record = TradeRecord {
            symbol: position.symbol.clone(),
            direction: position.direction,
            strategy: position.strategy,
            entry_price: position.average_price(),
            exit_price,
            quantity,
            gross_pnl,
            fees,
            funding_fees: position.funding_fees,
            net_pnl,
            r_multiple: r_multiple.round_dp(4),
            pyramid_adds: position.pyramid_count,
            partial_closes: position.partial_closes,
            opened_at: position.opened_at,
            closed_at: now,
            exit_reason: reason,
        };

        info!(
            symbol = %record.symbol,
            reason = reason.as_str(),
            exit = %price,
            pnl = %record.net_pnl.round_dp(4),
            r = %record.r_multiple,
            "Position closed"
        );
        record
    }

    fn ratchet(
        &self,
        position: &mut Position,
        candidate: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
        reason: StopReason,
    ) -> Option<StopMove> {
        let from = position.stop;
        if !position.ratchet_stop(candidate, price, now) {
            return None;
        }
        debug!(symbol = %position.symbol, from = %from, to = %position.stop, reason = ?reason, "Stop moved");
        Some(StopMove {
            from,
            to: position.stop,
            reason,
        })
    }
}

fn to_decimal(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value).map(|d| d.round_dp(8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{candles_from, snapshot_from};
    use crate::models::{Candle, FundingPayment, SizingMode};
    use crate::trading::IndicatorConfig;
    use rust_decimal_macros::dec;

    fn params() -> DynamicParams {
        DynamicParams {
            pullback_zone_pct: 0.4,
            atr_multiplier: 2.0,
            pyramid_trigger_r: 1.0,
        }
    }

    fn manager() -> PositionManager {
        PositionManager::new(&EngineConfig::default())
    }

    fn snapshot(candles: Vec<Candle>) -> MarketSnapshot {
        snapshot_from(candles, &IndicatorConfig::default())
    }

    fn position(direction: Direction, price: Decimal, stop: Decimal, at: DateTime<Utc>) -> Position {
        Position::new(
            "BTCUSDT".to_string(),
            direction,
            StrategyId::Pullback,
            Entry {
                price,
                quantity: dec!(5),
                fee: dec!(0.25),
                timestamp: at,
            },
            stop,
            None,
            StopMode::AdaptiveAtr,
        )
    }

    /// 60 flat bars at 100 followed by `tail`.
    fn path(tail: &[f64]) -> Vec<Candle> {
        let mut closes = vec![100.0; 60];
        closes.extend_from_slice(tail);
        candles_from(&closes, 0.1, 100.0)
    }

    #[test]
    fn test_stop_is_monotonic_for_longs_and_shorts() {
        let pm = manager();
        let mut tail = Vec::new();
        tail.extend((1..=20).map(|i| 100.0 + i as f64 * 0.5));
        tail.extend((1..=10).map(|i| 110.0 - i as f64 * 0.7));
        tail.extend((1..=15).map(|i| 103.0 + i as f64 * 0.6));
        let candles = path(&tail);

        let mut long = position(Direction::Long, dec!(100), dec!(98), candles[59].open_time);
        let mut previous = long.stop;
        for end in 61..=candles.len() {
            let snap = snapshot(candles[..end].to_vec());
            pm.update_stop(&mut long, &snap, &params(), snap.taken_at);
            assert!(long.stop >= previous, "long stop loosened at bar {end}");
            previous = long.stop;
        }
        assert!(long.stop > dec!(98));

        let mirrored: Vec<f64> = tail.iter().map(|c| 200.0 - c).collect();
        let candles = path(&mirrored);
        let mut short = position(Direction::Short, dec!(100), dec!(102), candles[59].open_time);
        let mut previous = short.stop;
        for end in 61..=candles.len() {
            let snap = snapshot(candles[..end].to_vec());
            pm.update_stop(&mut short, &snap, &params(), snap.taken_at);
            assert!(short.stop <= previous, "short stop loosened at bar {end}");
            previous = short.stop;
        }
        assert!(short.stop < dec!(102));
    }

    #[test]
    fn test_chandelier_switch_is_permanent() {
        let pm = manager();
        let tail: Vec<f64> = (1..=20).map(|i| 100.0 + i as f64 * 0.2).collect();
        let candles = path(&tail);
        let mut pos = position(Direction::Long, dec!(100), dec!(98), candles[59].open_time);

        // Close at 104: 2R
        let snap = snapshot(candles.clone());
        pm.update_stop(&mut pos, &snap, &params(), snap.taken_at);
        assert_eq!(pos.stop_mode, StopMode::Chandelier);

        let mut retrace = candles;
        let last = retrace[retrace.len() - 1];
        for (k, close) in [102.5, 101.0].into_iter().enumerate() {
            let mut bar = last;
            bar.open_time = last.open_time + Duration::minutes(5 * (k as i64 + 1));
            bar.open = close;
            bar.close = close;
            bar.high = close + 0.1;
            bar.low = close - 0.1;
            retrace.push(bar);
            let snap = snapshot(retrace.clone());
            pm.update_stop(&mut pos, &snap, &params(), snap.taken_at);
            assert_eq!(pos.stop_mode, StopMode::Chandelier);
        }
    }

    fn with_reversals(count: usize) -> Vec<Candle> {
        let tail: Vec<f64> = (1..=20).map(|i| 100.0 + i as f64 * 0.2).collect();
        let mut candles = path(&tail);
        for k in 0..count {
            let prev = candles[candles.len() - 1];
            let open = prev.close;
            let close = open - 1.0;
            candles.push(Candle {
                open_time: prev.open_time + Duration::minutes(5),
                open,
                high: open + 0.05,
                low: close - 0.05,
                close,
                volume: 300.0 + k as f64,
            });
        }
        candles
    }

    #[test]
    fn test_defensive_reversal_fires_once_per_level() {
        let pm = manager();
        let candles = with_reversals(2);
        let mut pos = position(Direction::Long, dec!(100), dec!(98), candles[59].open_time);

        let first = snapshot(candles[..candles.len() - 1].to_vec());
        let action = pm
            .check_defensive(&mut pos, &first, Trend::Up, false, first.taken_at)
            .unwrap();
        assert_eq!(action.trigger, DefensiveTrigger::ReversalCandle);
        let moved = action.moved.unwrap();
        assert!(moved.to > dec!(102) && moved.to < dec!(103));
        let tightened = pos.stop;

        // Same bar again: no new occurrence
        assert!(pm
            .check_defensive(&mut pos, &first, Trend::Up, false, first.taken_at)
            .is_none());

        // Repeat pattern on the next bar: level is below the stop already
        let second = snapshot(candles);
        let action = pm
            .check_defensive(&mut pos, &second, Trend::Up, false, second.taken_at)
            .unwrap();
        assert!(action.moved.is_none());
        assert_eq!(pos.stop, tightened);
    }

    #[test]
    fn test_reversal_consumed_when_analyst_wins() {
        let pm = manager();
        let candles = with_reversals(1);
        let mut pos = position(Direction::Long, dec!(100), dec!(98), candles[59].open_time);
        let snap = snapshot(candles);

        let action = pm
            .check_defensive(&mut pos, &snap, Trend::Up, true, snap.taken_at)
            .unwrap();
        assert_eq!(action.trigger, DefensiveTrigger::OpposingAnalyst);
        assert_eq!(pos.last_reversal_bar, Some(snap.bar_time()));

        // Next cycle on the same bar: the candle does not fire again
        assert!(pm
            .check_defensive(&mut pos, &snap, Trend::Up, false, snap.taken_at)
            .is_none());
    }

    #[test]
    fn test_divergence_counts_bars() {
        let pm = manager();
        let candles = path(&[100.2, 100.0, 100.1, 99.9, 100.0]);
        let mut pos = position(Direction::Long, dec!(95), dec!(90), candles[59].open_time);

        let mut triggers = Vec::new();
        for end in 62..=candles.len() {
            let snap = snapshot(candles[..end].to_vec());
            triggers.push(pm.check_defensive(&mut pos, &snap, Trend::Down, false, snap.taken_at));
        }
        // divergence_bars = 3: bars 1 and 2 count, bar 3 fires, then restart
        assert!(triggers[0].is_none());
        assert!(triggers[1].is_none());
        assert_eq!(triggers[2].as_ref().unwrap().trigger, DefensiveTrigger::TrendDivergence);
        assert!(triggers[3].is_none());
    }

    #[test]
    fn test_exhaustion_moves_to_breakeven_once() {
        let pm = manager();
        let tail: Vec<f64> = (1..=20).map(|i| 100.0 + i as f64 * 0.2).collect();
        let mut snap = snapshot(path(&tail));
        let n = snap.indicators.adx.len();
        snap.indicators.adx[n - 4..].copy_from_slice(&[45.0, 43.0, 41.0, 39.0]);

        let mut pos = position(Direction::Long, dec!(100), dec!(98), snap.candles[59].open_time);
        assert!(pm.check_exhaustion(&mut pos, &snap, snap.taken_at));
        assert_eq!(pos.stop, pos.breakeven_price());
        assert!(pos.exhaustion_fired);

        let stop = pos.stop;
        assert!(!pm.check_exhaustion(&mut pos, &snap, snap.taken_at));
        assert_eq!(pos.stop, stop);
    }

    #[test]
    fn test_pyramid_plan_and_bound() {
        let pm = manager();
        let now = Utc::now();
        let mut pos = position(Direction::Long, dec!(100), dec!(98), now);

        assert_eq!(pm.plan_pyramid(&pos, dec!(101), Trend::Up, &params()), None);
        assert_eq!(pm.plan_pyramid(&pos, dec!(102.5), Trend::Sideways, &params()), None);
        assert_eq!(
            pm.plan_pyramid(&pos, dec!(102.5), Trend::Up, &params()),
            Some(dec!(3.75))
        );

        for k in 0..2 {
            let fill = Entry {
                price: dec!(103) + Decimal::from(k),
                quantity: dec!(3),
                fee: dec!(0.15),
                timestamp: now,
            };
            pm.apply_pyramid(&mut pos, fill, 0.5, &params()).unwrap();
        }
        assert_eq!(pos.pyramid_count, 2);
        assert_eq!(pos.initial_risk, dec!(2) * dec!(11));
        assert!(pos.stop >= pos.breakeven_price());
        assert_eq!(pm.plan_pyramid(&pos, dec!(120), Trend::Up, &params()), None);

        let extra = Entry {
            price: dec!(106),
            quantity: dec!(1),
            fee: Decimal::ZERO,
            timestamp: now,
        };
        assert!(pm.apply_pyramid(&mut pos, extra, 0.5, &params()).is_err());
        assert_eq!(pos.pyramid_count, 2);
    }

    #[test]
    fn test_partial_close_then_close() {
        let pm = manager();
        let now = Utc::now();
        let mut pos = position(Direction::Long, dec!(100), dec!(98), now);

        assert_eq!(pm.plan_partial_close(&pos, dec!(104), false), None);
        assert_eq!(pm.plan_partial_close(&pos, dec!(99), true), None);
        let qty = pm.plan_partial_close(&pos, dec!(104), true).unwrap();
        assert_eq!(qty, dec!(2.5));

        pm.apply_partial_close(&mut pos, dec!(104), qty, dec!(0.13), now)
            .unwrap();
        assert_eq!(pos.state, PositionState::PartiallyClosed);
        assert_eq!(pos.quantity(), dec!(2.5));
        assert_eq!(pos.initial_risk, dec!(5));
        assert!(pos.stop >= pos.breakeven_price());
        assert_eq!(pm.plan_partial_close(&pos, dec!(105), true), None);

        let record = pm.close(pos, dec!(106), dec!(0.13), ExitReason::TakeProfit, now);
        // 2.5 x 4 + 2.5 x 6 gross, 0.25 entry + 0.26 exit fees
        assert_eq!(record.gross_pnl, dec!(25));
        assert_eq!(record.fees, dec!(0.51));
        assert_eq!(record.net_pnl, dec!(24.49));
        assert_eq!(record.quantity, dec!(5));
        assert_eq!(record.exit_price, dec!(105));
        assert_eq!(record.partial_closes, 1);
    }

    #[test]
    fn test_close_charges_funding() {
        let pm = manager();
        let now = Utc::now();
        let mut pos = position(Direction::Long, dec!(100), dec!(98), now);
        let fees = pos.entry_fees();
        pos.add_funding(&[FundingPayment {
            amount: dec!(0.4),
            settled_at: now + Duration::hours(8),
        }]);

        let record = pm.close(pos, dec!(102), Decimal::ZERO, ExitReason::Manual, now);
        assert_eq!(record.funding_fees, dec!(0.4));
        assert_eq!(record.net_pnl, record.gross_pnl - fees - dec!(0.4));
    }

    #[test]
    fn test_exit_trigger_prefers_stop() {
        let pm = manager();
        let mut pos = position(Direction::Short, dec!(100), dec!(102), Utc::now());
        pos.take_profit = Some(dec!(95));

        assert_eq!(pm.exit_trigger(&pos, dec!(101)), None);
        assert_eq!(pm.exit_trigger(&pos, dec!(102)), Some(ExitReason::StopLoss));
        assert_eq!(pm.exit_trigger(&pos, dec!(94.9)), Some(ExitReason::TakeProfit));
    }

    #[test]
    fn test_initial_stop_takes_stricter_analyst_stop() {
        let pm = manager();
        let mut signal = Signal {
            strategy: StrategyId::Ai,
            direction: Direction::Long,
            entry: dec!(100),
            stop: dec!(99),
            target: Some(dec!(104)),
            sizing: SizingMode::RiskPercent,
            confidence: Some(80.0),
            bar_time: Utc::now(),
        };
        // ATR stop = 100 - 1.0 x 2.0 = 98; analyst 99 is stricter
        assert_eq!(pm.initial_stop(&signal, 1.0, &params()), Some(dec!(99)));

        signal.stop = dec!(97);
        assert_eq!(pm.initial_stop(&signal, 1.0, &params()), Some(dec!(98)));

        signal.strategy = StrategyId::Pullback;
        assert_eq!(pm.initial_stop(&signal, 1.0, &params()), Some(dec!(97)));
    }

    #[test]
    fn test_open_rejects_unprotective_stop() {
        let pm = manager();
        let signal = Signal {
            strategy: StrategyId::Breakout,
            direction: Direction::Long,
            entry: dec!(100),
            stop: dec!(98.5),
            target: None,
            sizing: SizingMode::FixedNotional,
            confidence: None,
            bar_time: Utc::now(),
        };
        let fill = Entry {
            price: dec!(98),
            quantity: dec!(1),
            fee: Decimal::ZERO,
            timestamp: Utc::now(),
        };
        assert!(pm.open("BTCUSDT", &signal, fill.clone(), dec!(98.5)).is_err());

        let fill = Entry { price: dec!(100.1), ..fill };
        let pos = pm.open("BTCUSDT", &signal, fill, dec!(98.5)).unwrap();
        assert_eq!(pos.stop_mode, StopMode::PercentTrail);
    }
}
