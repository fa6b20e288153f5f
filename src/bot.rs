//! Per-symbol decision loop.
//!
//! One `SymbolTrader` per traded symbol owns that symbol's position, trend
//! state and analyst bookkeeping; nothing here is shared between loops.
//! Each cycle:
//! - Fetches candles and equity (retried; nothing is mutated before both succeed)
//! - Classifies the trend and refreshes the dynamic parameters
//! - Resolves shadow trades and resting analyst orders
//! - Consults the analyst when a trigger fires
//! - Manages the open position, or looks for an entry when flat
//! - Persists the position

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{
    AiOutcome, AnalysisContext, AnalystPort, EventKind, ExecutionPort, Fill, MarketDataPort,
    NotificationPort, OrderKind, OrderRequest, OrderStatus, PersistencePort, RetryPolicy, Side,
};
use crate::error::PortError;
use crate::indicators;
use crate::metrics::{update_ai_score, INITIAL_AI_SCORE};
use crate::models::{
    to_price, AiAssessment, Candle, Entry, MarketSnapshot, Position, Signal, StrategyId,
    TradeRecord,
};
use crate::trading::{
    AiArbiter, AiTriggerState, BreakoutState, DefensiveTrigger, DynamicParams, EngineConfig,
    PerformancePolicy, PositionManager, RiskSizer, ShadowLedger, ShadowTrade, SignalGenerator,
    StopMove, Trend, TrendClassifier, TrendState, TriggerReason,
};

/// External collaborators of a loop. Shared by every symbol.
#[derive(Clone)]
pub struct Ports {
    pub market: Arc<dyn MarketDataPort>,
    pub execution: Arc<dyn ExecutionPort>,
    pub analyst: Arc<dyn AnalystPort>,
    pub store: Arc<dyn PersistencePort>,
    pub notifier: Arc<dyn NotificationPort>,
}

/// Resting analyst entry awaiting a fill.
#[derive(Debug, Clone)]
struct PendingEntry {
    order_id: String,
    signal: Signal,
    stop: Decimal,
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub trend: Trend,
    pub consulted: Option<TriggerReason>,
    pub opened: bool,
    pub closed: Option<TradeRecord>,
    pub pyramided: bool,
    pub partially_closed: bool,
    pub stop_moves: Vec<StopMove>,
    pub defensive: Option<DefensiveTrigger>,
}

pub struct SymbolTrader {
    symbol: String,
    config: Arc<EngineConfig>,
    ports: Ports,
    retry: RetryPolicy,

    classifier: TrendClassifier,
    generator: SignalGenerator,
    arbiter: AiArbiter,
    sizer: RiskSizer,
    manager: PositionManager,
    policy: Arc<dyn PerformancePolicy>,

    // Loop-owned state
    position: Option<Position>,
    trend_state: TrendState,
    breakout_state: BreakoutState,
    ai_state: AiTriggerState,
    assessment: Option<AiAssessment>,
    /// `produced_at` of the last assessment that opened, shadowed or
    /// tightened something; an assessment is acted on once
    acted_on: Option<DateTime<Utc>>,
    shadows: ShadowLedger,
    pending: Option<PendingEntry>,
    /// Last successful funding query
    funding_synced_at: Option<DateTime<Utc>>,
    ai_score: f64,
    params: DynamicParams,
}

impl SymbolTrader {
    pub fn new(
        symbol: impl Into<String>,
        config: Arc<EngineConfig>,
        ports: Ports,
        policy: Arc<dyn PerformancePolicy>,
    ) -> Self {
        let params = policy.params(&[]);
        let max_age = ChronoDuration::seconds(config.arbiter.shadow_max_age_secs);
        let shadows = ShadowLedger::new(max_age);
        Self {
            symbol: symbol.into(),
            retry: RetryPolicy::from_config(&config.runtime),
            classifier: TrendClassifier::new(config.trend.clone()),
            generator: SignalGenerator::new(&config),
            arbiter: AiArbiter::new(config.arbiter.clone()),
            sizer: RiskSizer::new(config.account.clone()),
            manager: PositionManager::new(&config),
            config,
            ports,
            policy,
            position: None,
            trend_state: TrendState::default(),
            breakout_state: BreakoutState::default(),
            ai_state: AiTriggerState::default(),
            assessment: None,
            acted_on: None,
            shadows,
            pending: None,
            funding_synced_at: None,
            ai_score: INITIAL_AI_SCORE,
            params,
        }
    }

    #[cfg(test)]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    #[cfg(test)]
    fn trend_state(&self) -> &TrendState {
        &self.trend_state
    }

    /// Configure the exchange and restore persisted state.
    ///
    /// A stored position that fails validation is dropped: the loop starts
    /// FLAT and the operator is told. Its attributes are never guessed.
    pub async fn initialize(&mut self) -> Result<(), PortError> {
        let account = &self.config.account;
        let execution = &self.ports.execution;
        if let Err(e) = execution.set_leverage(&self.symbol, account.leverage).await {
            warn!(symbol = %self.symbol, error = %e, "Failed to set leverage");
        }
        if let Err(e) = execution.set_margin_mode(&self.symbol, account.margin_mode).await {
            warn!(symbol = %self.symbol, error = %e, "Failed to set margin mode");
        }

        match self.ports.store.load_position(&self.symbol).await {
            Ok(Some(position)) => {
                info!(
                    symbol = %self.symbol,
                    direction = position.direction.as_str(),
                    qty = %position.quantity(),
                    stop = %position.stop,
                    "Restored position"
                );
                self.position = Some(position);
            }
            Ok(None) => {}
            Err(PortError::Corrupt(detail)) => {
                error!(symbol = %self.symbol, detail = %detail, "Stored position is corrupt, starting flat");
                self.notify(
                    EventKind::StateCorrupted,
                    format!("{}: stored position discarded ({})", self.symbol, detail),
                )
                .await;
                self.position = None;
            }
            Err(e) => return Err(e),
        }

        match execution.get_position(&self.symbol).await {
            Ok(held) => match (&self.position, held) {
                (Some(_), None) => {
                    warn!(symbol = %self.symbol, "Stored position has no exchange counterpart")
                }
                (None, Some(held)) => warn!(
                    symbol = %self.symbol,
                    qty = %held.quantity,
                    "Exchange position is not tracked by the engine"
                ),
                _ => {}
            },
            Err(e) => warn!(symbol = %self.symbol, error = %e, "Could not read exchange position"),
        }

        self.ai_score = match self.ports.store.load_performance_score().await {
            Ok(score) => score.unwrap_or(INITIAL_AI_SCORE),
            Err(e) => {
                warn!(error = %e, "Failed to load performance score");
                INITIAL_AI_SCORE
            }
        };
        self.refresh_params().await;

        info!(
            symbol = %self.symbol,
            position = self.position.is_some(),
            ai_score = self.ai_score,
            "Symbol loop initialized"
        );
        Ok(())
    }

    /// Cycle until `shutdown` is set, then persist and return.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        info!(symbol = %self.symbol, cycle_secs = self.config.runtime.cycle_secs, "Starting symbol loop");

        let mut ticker = interval(Duration::from_secs(self.config.runtime.cycle_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            match self.run_cycle(Utc::now()).await {
                Ok(report) => debug!(
                    symbol = %self.symbol,
                    trend = report.trend.as_str(),
                    opened = report.opened,
                    closed = report.closed.is_some(),
                    stop_moves = report.stop_moves.len(),
                    "Cycle complete"
                ),
                Err(e) => {
                    error!(symbol = %self.symbol, error = %e, "Cycle skipped");
                    self.notify(EventKind::CycleSkipped, format!("{}: {}", self.symbol, e))
                        .await;
                }
            }
        }

        self.persist().await;
        info!(symbol = %self.symbol, open = self.position().is_some(), "Symbol loop stopped");
    }

    /// One evaluation cycle at `now`.
    ///
    /// Returns `Err` when market data or equity could not be fetched (the
    /// cycle is skipped untouched) or when an order failed after retries.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport, PortError> {
        let snapshot = self.fetch_snapshot(now).await?;
        let equity = self.fetch_equity().await?;
        let price = to_price(snapshot.price())
            .ok_or_else(|| PortError::Protocol(format!("{} has no usable price", self.symbol)))?;

        let trend = self.classifier.classify(&snapshot, &mut self.trend_state);
        let mut report = CycleReport {
            trend,
            ..Default::default()
        };

        self.refresh_params().await;
        self.resolve_shadows(&snapshot).await;
        self.poll_pending(price, &mut report).await?;
        report.consulted = self.consult_analyst(&snapshot, trend, price, now).await;

        let outcome = if self.position.is_some() {
            self.manage_position(&snapshot, trend, price, equity, now, &mut report)
                .await
        } else if self.pending.is_none() {
            self.seek_entry(&snapshot, trend, price, equity, now, &mut report)
                .await
        } else {
            Ok(())
        };

        self.persist().await;
        outcome.map(|_| report)
    }

    // ==================== Inputs ====================

    async fn fetch_snapshot(&self, now: DateTime<Utc>) -> Result<MarketSnapshot, PortError> {
        let config = &self.config;
        let limit = config.runtime.candle_limit;
        let candles = self.fetch_candles(&config.trend.signal_timeframe, limit).await?;
        let filter = self.fetch_candles(&config.trend.filter_timeframe, limit).await?;
        let fast = if self.arbiter.enabled() {
            self.fetch_candles(&config.arbiter.fast_timeframe, limit).await?
        } else {
            Vec::new()
        };
        Ok(MarketSnapshot::new(
            self.symbol.as_str(),
            now,
            candles,
            filter,
            fast,
            &config.indicators,
        )?)
    }

    async fn fetch_candles(&self, timeframe: &str, limit: usize) -> Result<Vec<Candle>, PortError> {
        let market = &self.ports.market;
        let symbol = self.symbol.as_str();
        self.retry
            .run("get_candles", move || market.get_candles(symbol, timeframe, limit))
            .await
    }

    async fn fetch_equity(&self) -> Result<Decimal, PortError> {
        let execution = &self.ports.execution;
        self.retry
            .run("get_equity", move || execution.get_equity())
            .await
    }

    async fn refresh_params(&mut self) {
        let lookback = self.config.performance.lookback_trades;
        match self.ports.store.recent_trades(None, lookback).await {
            Ok(trades) => self.params = self.policy.params(&trades),
            Err(e) => warn!(symbol = %self.symbol, error = %e, "Keeping previous dynamic parameters"),
        }
    }

    // ==================== Analyst ====================

    async fn consult_analyst(
        &mut self,
        snapshot: &MarketSnapshot,
        trend: Trend,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<TriggerReason> {
        let reason = self.arbiter.should_consult(&self.ai_state, snapshot, now)?;

        let i = snapshot.last_index();
        let ind = &snapshot.indicators;
        let context = AnalysisContext {
            symbol: self.symbol.clone(),
            price,
            trend,
            rsi: indicators::at(&ind.rsi, i),
            adx: indicators::at(&ind.adx, i),
            atr: indicators::at(&ind.atr, i),
            hourly_change_pct: snapshot.hourly_change_pct(),
            position: self.position.as_ref().map(|p| p.direction),
            trigger: reason.as_str(),
            at: now,
        };

        let secs = self.config.arbiter.analyst_timeout_secs;
        let answer = match timeout(Duration::from_secs(secs), self.ports.analyst.analyze(&context)).await {
            Ok(answer) => answer,
            Err(_) => Err(PortError::Analyst(format!("no answer within {}s", secs))),
        };
        let assessment = match answer {
            Ok(assessment) => {
                info!(
                    symbol = %self.symbol,
                    trigger = reason.as_str(),
                    direction = ?assessment.direction,
                    confidence = assessment.confidence,
                    "Analyst assessment"
                );
                assessment
            }
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Analyst unavailable, treating as neutral");
                self.notify(EventKind::AnalystDegraded, format!("{}: {}", self.symbol, e))
                    .await;
                AiAssessment::neutral(e.to_string())
            }
        };

        self.assessment = Some(assessment);
        self.arbiter
            .mark_consulted(&mut self.ai_state, snapshot.bar_time(), now);
        Some(reason)
    }

    /// Current assessment unless it was already acted on.
    fn unused_assessment(&self) -> Option<&AiAssessment> {
        self.assessment
            .as_ref()
            .filter(|a| self.acted_on != Some(a.produced_at))
    }

    async fn resolve_shadows(&mut self, snapshot: &MarketSnapshot) {
        for outcome in self.shadows.resolve(&snapshot.candles) {
            self.record_ai_outcome(AiOutcome::from(&outcome)).await;
        }
    }

    /// Store a resolved analyst trade and fold it into the score.
    async fn record_ai_outcome(&mut self, outcome: AiOutcome) {
        let store = &self.ports.store;
        if let Err(e) = store.append_ai_outcome(&outcome).await {
            warn!(symbol = %self.symbol, error = %e, "Failed to store analyst outcome");
            return;
        }

        let arbiter = &self.config.arbiter;
        let outcomes = match store.recent_ai_outcomes(arbiter.score_lookback).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(error = %e, "Failed to load analyst outcomes");
                return;
            }
        };
        // Other loops update the same score
        let previous = match store.load_performance_score().await {
            Ok(Some(score)) => score,
            _ => self.ai_score,
        };
        let returns: Vec<f64> = outcomes.iter().map(|o| o.return_pct).collect();
        let score = update_ai_score(
            previous,
            &returns,
            arbiter.score_min_trades,
            arbiter.score_lookback,
        );
        if let Err(e) = store.save_performance_score(score).await {
            warn!(error = %e, "Failed to save performance score");
        }

        info!(
            symbol = %outcome.symbol,
            live = outcome.live,
            ret = outcome.return_pct,
            score,
            "Analyst score updated"
        );
        self.ai_score = score;
    }

    // ==================== Entries ====================

    async fn seek_entry(
        &mut self,
        snapshot: &MarketSnapshot,
        trend: Trend,
        price: Decimal,
        equity: Decimal,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), PortError> {
        let signals = self.generator.evaluate(
            snapshot,
            trend,
            &self.params,
            &mut self.breakout_state,
        );
        let assessment = self.unused_assessment().cloned();
        let arbitration = self.arbiter.arbitrate(
            assessment.as_ref(),
            None,
            signals.best(),
            snapshot,
            self.ai_score,
            now,
        );

        if let Some(shadow) = arbitration
            .shadow
            .as_ref()
            .and_then(|s| ShadowTrade::from_signal(&self.symbol, s))
        {
            self.shadows.record(shadow);
        }
        let Some(signal) = arbitration.entry else {
            return Ok(());
        };
        if arbitration.shadow.is_some() || signal.strategy == StrategyId::Ai {
            self.acted_on = assessment.map(|a| a.produced_at);
        }

        self.enter(signal, snapshot, price, equity, report).await
    }

    async fn enter(
        &mut self,
        signal: Signal,
        snapshot: &MarketSnapshot,
        price: Decimal,
        equity: Decimal,
        report: &mut CycleReport,
    ) -> Result<(), PortError> {
        let atr = indicators::last(&snapshot.indicators.atr).unwrap_or(f64::NAN);
        let Some(stop) = self.manager.initial_stop(&signal, atr, &self.params) else {
            warn!(symbol = %self.symbol, strategy = signal.strategy.as_str(), "No usable initial stop");
            return Ok(());
        };

        let sized = match self.sizer.size(signal.sizing, signal.entry, stop, equity) {
            Ok(sized) => sized,
            Err(rejection) => {
                info!(
                    symbol = %self.symbol,
                    strategy = signal.strategy.as_str(),
                    reason = %rejection,
                    "Entry rejected by sizer"
                );
                self.notify(
                    EventKind::OrderRejected,
                    format!("{} {} entry: {}", self.symbol, signal.strategy.as_str(), rejection),
                )
                .await;
                return Ok(());
            }
        };
        if !sized.adjustments.is_empty() {
            self.notify(
                EventKind::SizingAdjusted,
                format!("{} qty {}: {:?}", self.symbol, sized.quantity, sized.adjustments),
            )
            .await;
        }

        let resting = signal.strategy == StrategyId::Ai
            && self.arbiter.use_limit_orders()
            && signal.entry != price;
        let request = OrderRequest {
            kind: if resting {
                OrderKind::Limit(signal.entry)
            } else {
                OrderKind::Market
            },
            ..OrderRequest::market(&self.symbol, Side::opening(signal.direction), sized.quantity, price)
        };

        match self.place(&request).await {
            Ok(OrderStatus::Filled(fill)) => self.adopt_fill(&signal, stop, fill, report).await,
            Ok(OrderStatus::Pending { order_id, price }) => {
                info!(symbol = %self.symbol, order_id = %order_id, price = %price, "Entry order resting");
                self.pending = Some(PendingEntry {
                    order_id,
                    signal,
                    stop,
                });
                Ok(())
            }
            Ok(OrderStatus::Cancelled) => {
                warn!(symbol = %self.symbol, "Entry order cancelled on placement");
                Ok(())
            }
            Err(e) => self.order_failed("entry", e).await,
        }
    }

    /// FLAT -> OPEN once the entry is filled. A fill that cannot be
    /// tracked is flattened; if that fails on the network the error is
    /// handed back so the cycle counts as skipped.
    async fn adopt_fill(
        &mut self,
        signal: &Signal,
        stop: Decimal,
        fill: Fill,
        report: &mut CycleReport,
    ) -> Result<(), PortError> {
        let entry = Entry {
            price: fill.price,
            quantity: fill.quantity,
            fee: fill.fee,
            timestamp: fill.timestamp,
        };
        match self.manager.open(&self.symbol, signal, entry, stop) {
            Ok(position) => {
                self.notify(
                    EventKind::PositionOpened,
                    format!(
                        "{} {} {} {} @ {} stop {}",
                        self.symbol,
                        position.strategy.as_str(),
                        position.direction.as_str(),
                        position.quantity(),
                        position.average_price(),
                        position.stop
                    ),
                )
                .await;
                self.position = Some(position);
                report.opened = true;
                Ok(())
            }
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Filled entry is unusable, flattening");
                self.notify(EventKind::OrderRejected, format!("{} entry: {}", self.symbol, e))
                    .await;
                let request = OrderRequest::market(
                    &self.symbol,
                    Side::closing(signal.direction),
                    fill.quantity,
                    fill.price,
                )
                .reduce_only();
                let Err(flatten) = self.execute_market(&request).await else {
                    return Ok(());
                };
                error!(
                    symbol = %self.symbol,
                    qty = %fill.quantity,
                    error = %flatten,
                    "Flatten failed, exchange position is untracked"
                );
                self.notify(
                    EventKind::OrderRejected,
                    format!(
                        "{} flatten failed, {} {} left untracked: {}",
                        self.symbol,
                        fill.quantity,
                        signal.direction.as_str(),
                        flatten
                    ),
                )
                .await;
                if flatten.is_transient() {
                    Err(flatten)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Fill, keep or cancel the resting analyst entry.
    async fn poll_pending(&mut self, price: Decimal, report: &mut CycleReport) -> Result<(), PortError> {
        let Some(pending) = self.pending.clone() else {
            return Ok(());
        };
        let execution = self.ports.execution.clone();
        let status = match execution.order_status(&self.symbol, &pending.order_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Could not poll resting entry");
                return Ok(());
            }
        };

        match status {
            OrderStatus::Filled(fill) => {
                info!(symbol = %self.symbol, order_id = %pending.order_id, "Resting entry filled");
                self.pending = None;
                return self.adopt_fill(&pending.signal, pending.stop, fill, report).await;
            }
            OrderStatus::Pending { price: resting, .. } => {
                if resting.is_zero() {
                    return Ok(());
                }
                let deviation = ((price - resting) / resting).abs() * Decimal::ONE_HUNDRED;
                if deviation <= self.config.arbiter.stale_order_deviation_pct {
                    return Ok(());
                }
                match execution.cancel_order(&self.symbol, &pending.order_id).await {
                    Ok(()) => {
                        info!(
                            symbol = %self.symbol,
                            resting = %resting,
                            price = %price,
                            deviation = %deviation.round_dp(3),
                            "Stale entry order cancelled"
                        );
                        self.pending = None;
                    }
                    // Possibly filled meanwhile; the next poll tells
                    Err(e) => warn!(symbol = %self.symbol, error = %e, "Failed to cancel stale entry"),
                }
            }
            OrderStatus::Cancelled => {
                info!(symbol = %self.symbol, order_id = %pending.order_id, "Resting entry cancelled");
                self.pending = None;
            }
        }
        Ok(())
    }

    // ==================== Open position ====================

    async fn manage_position(
        &mut self,
        snapshot: &MarketSnapshot,
        trend: Trend,
        price: Decimal,
        equity: Decimal,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), PortError> {
        let Some(mut position) = self.position.take() else {
            return Ok(());
        };
        match self
            .maintain(&mut position, snapshot, trend, price, equity, now, report)
            .await
        {
            Ok(Some(record)) => {
                self.finish_trade(&record).await;
                report.closed = Some(record);
                Ok(())
            }
            Ok(None) => {
                self.position = Some(position);
                Ok(())
            }
            Err(e) => {
                self.position = Some(position);
                Err(e)
            }
        }
    }

    /// Exit check, stop maintenance, partial close and pyramiding, in that
    /// order. Returns the record when the position closed.
    #[allow(clippy::too_many_arguments)]
    async fn maintain(
        &mut self,
        position: &mut Position,
        snapshot: &MarketSnapshot,
        trend: Trend,
        price: Decimal,
        equity: Decimal,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<Option<TradeRecord>, PortError> {
        if let Some(reason) = self.manager.exit_trigger(position, price) {
            let request = OrderRequest::market(
                &self.symbol,
                Side::closing(position.direction),
                position.quantity(),
                price,
            )
            .reduce_only();
            let fill = match self.execute_market(&request).await {
                Ok(fill) => fill,
                Err(e) => {
                    // Position kept; the exit is retried next cycle
                    self.order_failed("close", e).await?;
                    return Ok(None);
                }
            };
            self.sync_funding(position, now, true).await;
            let record = self
                .manager
                .close(position.clone(), fill.price, fill.fee, reason, now);
            return Ok(Some(record));
        }

        self.sync_funding(position, now, false).await;
        let opposes = self.analyst_opposes(position, snapshot, now);

        if let Some(moved) = self.manager.update_stop(position, snapshot, &self.params, now) {
            report.stop_moves.push(moved);
        }
        let exhausted = self.manager.check_exhaustion(position, snapshot, now);
        let defensive = self
            .manager
            .check_defensive(position, snapshot, trend, opposes, now);
        if let Some(action) = &defensive {
            report.defensive = Some(action.trigger);
            if let Some(moved) = &action.moved {
                report.stop_moves.push(moved.clone());
                self.notify(
                    EventKind::StopTightened,
                    format!("{} {}: stop {} -> {}", self.symbol, action.trigger.as_str(), moved.from, moved.to),
                )
                .await;
            }
        }

        let event = exhausted
            || defensive
                .as_ref()
                .is_some_and(|a| a.trigger == DefensiveTrigger::TrendDivergence);
        if let Some(quantity) = self.manager.plan_partial_close(position, price, event) {
            self.partial_close(position, quantity, price, now, report).await?;
        }

        if let Some(desired) = self.manager.plan_pyramid(position, price, trend, &self.params) {
            self.pyramid(position, desired, snapshot, price, equity, report)
                .await?;
        }

        Ok(None)
    }

    /// Whether a fresh, not yet acted on assessment opposes `position`.
    fn analyst_opposes(&mut self, position: &Position, snapshot: &MarketSnapshot, now: DateTime<Utc>) -> bool {
        let Some(assessment) = self.unused_assessment() else {
            return false;
        };
        let produced_at = assessment.produced_at;
        let opposes = self
            .arbiter
            .arbitrate(
                Some(assessment),
                Some(position.direction),
                None,
                snapshot,
                self.ai_score,
                now,
            )
            .opposes_position;
        if opposes {
            self.acted_on = Some(produced_at);
        }
        opposes
    }

    /// Fold funding settled since the last sync into `position`. Runs every
    /// `funding_sync_secs`, or immediately when `force` is set. A failed
    /// query leaves the position as it was.
    async fn sync_funding(&mut self, position: &mut Position, now: DateTime<Utc>, force: bool) {
        let runtime = &self.config.runtime;
        if !runtime.funding_sync_enabled {
            return;
        }
        let due = self
            .funding_synced_at
            .map_or(true, |at| now - at >= ChronoDuration::seconds(runtime.funding_sync_secs));
        if !force && !due {
            return;
        }

        let since = position.funding_synced_to.unwrap_or(position.opened_at);
        match self.ports.execution.funding_fees(&self.symbol, since).await {
            Ok(payments) => {
                let added = position.add_funding(&payments);
                self.funding_synced_at = Some(now);
                if !added.is_zero() {
                    info!(
                        symbol = %self.symbol,
                        added = %added,
                        total = %position.funding_fees,
                        "Funding synced"
                    );
                }
            }
            Err(e) => warn!(symbol = %self.symbol, error = %e, "Funding sync failed"),
        }
    }

    async fn partial_close(
        &mut self,
        position: &mut Position,
        quantity: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), PortError> {
        let request = OrderRequest::market(
            &self.symbol,
            Side::closing(position.direction),
            quantity,
            price,
        )
        .reduce_only();
        let fill = match self.execute_market(&request).await {
            Ok(fill) => fill,
            Err(e) => return self.order_failed("partial close", e).await,
        };

        match self
            .manager
            .apply_partial_close(position, fill.price, fill.quantity, fill.fee, now)
        {
            Ok(moved) => {
                report.partially_closed = true;
                report.stop_moves.extend(moved);
                self.notify(
                    EventKind::PartialClose,
                    format!(
                        "{} closed {} @ {}, {} left",
                        self.symbol,
                        fill.quantity,
                        fill.price,
                        position.quantity()
                    ),
                )
                .await;
            }
            Err(e) => error!(symbol = %self.symbol, error = %e, "Partial fill could not be applied"),
        }
        Ok(())
    }

    async fn pyramid(
        &mut self,
        position: &mut Position,
        desired: Decimal,
        snapshot: &MarketSnapshot,
        price: Decimal,
        equity: Decimal,
        report: &mut CycleReport,
    ) -> Result<(), PortError> {
        let held_margin = position.required_margin(self.sizer.leverage());
        let sized = match self.sizer.size_add(desired, price, equity, held_margin) {
            Ok(sized) => sized,
            Err(rejection) => {
                info!(symbol = %self.symbol, reason = %rejection, "Pyramid add rejected by sizer");
                return Ok(());
            }
        };

        let request = OrderRequest::market(
            &self.symbol,
            Side::opening(position.direction),
            sized.quantity,
            price,
        );
        let fill = match self.execute_market(&request).await {
            Ok(fill) => fill,
            Err(e) => return self.order_failed("pyramid add", e).await,
        };

        let entry = Entry {
            price: fill.price,
            quantity: fill.quantity,
            fee: fill.fee,
            timestamp: fill.timestamp,
        };
        let atr = indicators::last(&snapshot.indicators.atr).unwrap_or(f64::NAN);
        match self.manager.apply_pyramid(position, entry, atr, &self.params) {
            Ok(moved) => {
                report.pyramided = true;
                report.stop_moves.extend(moved);
                self.notify(
                    EventKind::PyramidAdd,
                    format!(
                        "{} add {} @ {}, avg {} stop {}",
                        self.symbol,
                        fill.quantity,
                        fill.price,
                        position.average_price().round_dp(4),
                        position.stop
                    ),
                )
                .await;
            }
            Err(e) => error!(symbol = %self.symbol, error = %e, "Pyramid fill could not be applied"),
        }
        Ok(())
    }

    /// CLOSED: archive the record and go FLAT.
    async fn finish_trade(&mut self, record: &TradeRecord) {
        let store = self.ports.store.clone();
        if let Err(e) = store.append_trade(record).await {
            error!(symbol = %self.symbol, error = %e, "Failed to store trade record");
        }
        if let Err(e) = store.delete_position(&self.symbol).await {
            error!(symbol = %self.symbol, error = %e, "Failed to delete closed position");
        }

        if record.strategy == StrategyId::Ai {
            self.record_ai_outcome(AiOutcome {
                symbol: record.symbol.clone(),
                direction: record.direction,
                return_pct: record.return_pct().to_f64().unwrap_or(0.0),
                live: true,
                resolved_at: record.closed_at,
            })
            .await;
        }

        self.notify(
            EventKind::PositionClosed,
            format!(
                "{} {} {} closed ({}) pnl {} R {}",
                self.symbol,
                record.strategy.as_str(),
                record.direction.as_str(),
                record.exit_reason.as_str(),
                record.net_pnl.round_dp(4),
                record.r_multiple
            ),
        )
        .await;
    }

    // ==================== Execution ====================

    async fn place(&self, request: &OrderRequest) -> Result<OrderStatus, PortError> {
        let execution = &self.ports.execution;
        self.retry
            .run("place_order", move || execution.place_order(request))
            .await
    }

    /// Place a market order and require an immediate fill.
    async fn execute_market(&self, request: &OrderRequest) -> Result<Fill, PortError> {
        match self.place(request).await? {
            OrderStatus::Filled(fill) => Ok(fill),
            OrderStatus::Pending { order_id, .. } => {
                if let Err(e) = self.ports.execution.cancel_order(&self.symbol, &order_id).await {
                    warn!(symbol = %self.symbol, order_id = %order_id, error = %e, "Failed to cancel unfilled market order");
                }
                Err(PortError::Protocol(format!("market order {} did not fill", order_id)))
            }
            OrderStatus::Cancelled => Err(PortError::ExchangeRejected(
                "market order cancelled".to_string(),
            )),
        }
    }

    /// Surface a failed order. Rejections are final for this cycle;
    /// exhausted retries are handed back so the cycle counts as skipped.
    async fn order_failed(&self, action: &str, error: PortError) -> Result<(), PortError> {
        warn!(symbol = %self.symbol, action, error = %error, "Order failed");
        match error {
            PortError::Network(_) => Err(error),
            _ => {
                self.notify(
                    EventKind::OrderRejected,
                    format!("{} {}: {}", self.symbol, action, error),
                )
                .await;
                Ok(())
            }
        }
    }

    async fn notify(&self, kind: EventKind, payload: String) {
        self.ports.notifier.notify(kind, &payload).await;
    }

    async fn persist(&self) {
        let Some(position) = &self.position else {
            return;
        };
        if let Err(e) = self.ports.store.save_position(position).await {
            error!(symbol = %self.symbol, error = %e, "Failed to persist position");
        }
    }
}
