//! Engine configuration.
//!
//! Built once at startup (defaults, then an optional JSON file, then CLI/env
//! overrides), validated, and shared read-only behind an `Arc`.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::performance::DynamicParams;

/// Exchange margin mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginMode::Isolated => "isolated",
            MarginMode::Cross => "cross",
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub account: AccountConfig,
    pub indicators: IndicatorConfig,
    pub trend: TrendConfig,
    pub pullback: PullbackConfig,
    pub breakout: BreakoutConfig,
    pub spike: SpikeConfig,
    pub ranging: RangingConfig,
    pub arbiter: ArbiterConfig,
    pub pyramid: PyramidConfig,
    pub stops: StopConfig,
    pub partial_tp: PartialTakeProfitConfig,
    pub performance: PerformanceConfig,
    pub runtime: RuntimeConfig,
}

/// Leverage, risk budget and exchange constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub leverage: u32,
    pub margin_mode: MarginMode,

    /// Share of equity risked between entry and stop (0.015 = 1.5%)
    pub risk_per_trade: Decimal,

    /// Max margin a single position may lock, as a share of equity
    pub max_margin_ratio: Decimal,

    /// Notional spent by fixed-notional strategies (quote currency)
    pub fixed_notional: Decimal,

    /// Exchange minimum order notional
    pub min_notional: Decimal,

    /// Exchange quantity step
    pub quantity_step: Decimal,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            leverage: 5,
            margin_mode: MarginMode::Isolated,
            risk_per_trade: dec!(0.015),    // 1.5% per trade
            max_margin_ratio: dec!(0.20),   // 20% of equity per position
            fixed_notional: dec!(100),
            min_notional: dec!(5),
            quantity_step: dec!(0.001),
        }
    }
}

/// Indicator periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub ema_short: usize,
    pub ema_long: usize,
    /// Moving average on the filter timeframe
    pub filter_ma: usize,
    pub rsi: usize,
    pub atr: usize,
    /// Short/long ATR pair driving the adaptive trail multiplier
    pub atr_fast: usize,
    pub atr_slow: usize,
    pub adx: usize,
    pub bollinger_period: usize,
    pub bollinger_std: f64,
    pub volume_period: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ema_short: 10,
            ema_long: 30,
            filter_ma: 50,
            rsi: 14,
            atr: 14,
            atr_fast: 10,
            atr_slow: 50,
            adx: 14,
            bollinger_period: 20,
            bollinger_std: 2.0,
            volume_period: 20,
        }
    }
}

impl IndicatorConfig {
    /// Closed signal-timeframe candles needed before every series is warm.
    pub fn min_history(&self) -> usize {
        [
            self.ema_long,
            self.atr_slow + 1,
            self.adx * 2 + 1,
            self.bollinger_period,
            self.volume_period + 1,
            self.rsi + 1,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + 2
    }
}

/// Regime classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    pub signal_timeframe: String,
    pub filter_timeframe: String,
    pub adx_strong: f64,
    pub adx_weak: f64,
    /// EMA separation threshold in ATR/price units, by ADX regime
    pub atr_multiplier_strong: f64,
    pub atr_multiplier_weak: f64,
    /// Bars over which the filter MA slope is measured
    pub filter_slope_bars: usize,
    /// Consecutive disagreeing bars before the held trend flips
    pub grace_period: u32,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            signal_timeframe: "5m".to_string(),
            filter_timeframe: "15m".to_string(),
            adx_strong: 25.0,
            adx_weak: 20.0,
            atr_multiplier_strong: 1.5,
            atr_multiplier_weak: 0.7,
            filter_slope_bars: 3,
            grace_period: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PullbackConfig {
    pub enabled: bool,
    /// Consecutive RSI bars moving with the trend
    pub rsi_confirm_bars: usize,
    /// Minimum bars outside the band before the pullback
    pub min_impulse_bars: usize,
    /// Longest pullback (bars inside the band) still considered
    pub max_pullback_bars: usize,
    pub volume_filter_enabled: bool,
    /// Pullback/impulse average volume ratio above which the signal is dropped
    pub max_volume_ratio: f64,
}

impl Default for PullbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rsi_confirm_bars: 2,
            min_impulse_bars: 2,
            max_pullback_bars: 8,
            volume_filter_enabled: true,
            max_volume_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakoutConfig {
    pub enabled: bool,
    /// Bandwidth history used for the squeeze percentile
    pub squeeze_lookback: usize,
    /// Percentile (0-100) at or below which the band is squeezed
    pub squeeze_percentile: usize,
    /// How many bars after a squeeze a breakout may still fire
    pub squeeze_max_age_bars: usize,
    /// Breakout volume over rolling average volume
    pub volume_multiple: f64,
    /// RSI above this for longs, below 100 minus this for shorts
    pub rsi_threshold: f64,
    pub cooldown_secs: i64,
    /// Percent trailing stop used for the whole trade
    pub trail_percent: Decimal,
    /// Widen the pullback zone for a while after a breakout fires
    pub aggression_enabled: bool,
    pub aggression_secs: i64,
    pub aggressive_zone_multiplier: f64,
}

impl Default for BreakoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            squeeze_lookback: 120,
            squeeze_percentile: 25,
            squeeze_max_age_bars: 12,
            volume_multiple: 2.0,
            rsi_threshold: 50.0,
            cooldown_secs: 3600,
            trail_percent: dec!(1.5),
            aggression_enabled: true,
            aggression_secs: 180,
            aggressive_zone_multiplier: 2.0,
        }
    }
}

/// Volatility/volume spike that widens the pullback zone briefly. A spike
/// never opens a position on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeConfig {
    pub enabled: bool,
    /// Candle body over ATR
    pub body_atr_multiplier: f64,
    /// Candle volume over rolling average volume
    pub volume_multiple: f64,
    pub grace_secs: i64,
    pub zone_multiplier: f64,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            body_atr_multiplier: 2.0,
            volume_multiple: 2.5,
            grace_secs: 90,
            zone_multiplier: 3.0,
        }
    }
}

/// Where a ranging trade takes profit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeTarget {
    Middle,
    Opposite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RangingConfig {
    pub enabled: bool,
    pub adx_max: f64,
    pub atr_stop_multiplier: f64,
    pub target: RangeTarget,
}

impl Default for RangingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            adx_max: 20.0,
            atr_stop_multiplier: 1.5,
            target: RangeTarget::Middle,
        }
    }
}

/// Analyst consultation and gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub enabled: bool,
    /// Analyst signals may open live positions
    pub live_enabled: bool,
    pub interval_secs: i64,
    /// Fast timeframe watched for band breakouts
    pub fast_timeframe: String,
    pub rsi_upper: f64,
    pub rsi_lower: f64,
    /// One-hour move (percent) that forces a consultation
    pub hourly_move_pct: f64,
    pub min_reward_risk: Decimal,
    /// Minimum analyst confidence (0-100)
    pub min_confidence: f64,
    /// Historical performance score (0-100) required for live entries
    pub score_threshold: f64,
    /// Rest analyst entries as limit orders
    pub use_limit_orders: bool,
    /// Cancel a resting entry once price drifts this many percent away
    pub stale_order_deviation_pct: Decimal,
    /// Assessments older than this are ignored
    pub assessment_max_age_secs: i64,
    pub score_min_trades: usize,
    pub score_lookback: usize,
    /// Longest wait for one analyst answer
    pub analyst_timeout_secs: u64,
    /// Unresolved shadow trades older than this close flat
    pub shadow_max_age_secs: i64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            live_enabled: false,
            interval_secs: 900,
            fast_timeframe: "1m".to_string(),
            rsi_upper: 70.0,
            rsi_lower: 30.0,
            hourly_move_pct: 2.0,
            min_reward_risk: dec!(1.5),
            min_confidence: 60.0,
            score_threshold: 65.0,
            use_limit_orders: true,
            stale_order_deviation_pct: dec!(0.5),
            assessment_max_age_secs: 900,
            score_min_trades: 10,
            score_lookback: 50,
            analyst_timeout_secs: 30,
            shadow_max_age_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    pub enabled: bool,
    pub max_adds: u32,
    /// Each add is the previous add times this ratio
    pub add_ratio: Decimal,
    /// Only add while the held trend agrees with the position
    pub require_trend: bool,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_adds: 2,
            add_ratio: dec!(0.75),
            require_trend: true,
        }
    }
}

/// Trailing, chandelier, exhaustion and defensive stop behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    /// Minimum seconds between trailing updates
    pub min_update_secs: i64,
    /// ATR/price (percent) below which trailing pauses
    pub volatility_floor_pct: f64,
    /// Trailing starts once profit reaches this many R
    pub trail_activation_r: Decimal,
    /// Weight of (fast ATR / slow ATR - 1) in the adaptive multiplier
    pub adaptive_factor: f64,
    pub adaptive_min_scale: f64,
    pub adaptive_max_scale: f64,
    pub chandelier_enabled: bool,
    pub chandelier_activation_r: Decimal,
    pub chandelier_period: usize,
    pub chandelier_atr_multiplier: f64,
    pub defensive_atr_multiplier: f64,
    /// Consecutive bars of trend disagreement before tightening
    pub divergence_bars: u32,
    /// Reversal candle body in ATRs
    pub reversal_body_atr: f64,
    /// Reversal candle volume over average volume
    pub reversal_volume_multiple: f64,
    pub exhaustion_adx: f64,
    pub exhaustion_falling_bars: usize,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            min_update_secs: 60,
            volatility_floor_pct: 0.05,
            trail_activation_r: dec!(1.0),
            adaptive_factor: 0.5,
            adaptive_min_scale: 0.5,
            adaptive_max_scale: 1.5,
            chandelier_enabled: true,
            chandelier_activation_r: dec!(2.0),
            chandelier_period: 16,
            chandelier_atr_multiplier: 3.0,
            defensive_atr_multiplier: 1.8,
            divergence_bars: 3,
            reversal_body_atr: 1.5,
            reversal_volume_multiple: 2.0,
            exhaustion_adx: 40.0,
            exhaustion_falling_bars: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialTakeProfitConfig {
    pub enabled: bool,
    /// Share of the open quantity closed per trigger
    pub fraction: Decimal,
    pub max_partials: u32,
}

impl Default for PartialTakeProfitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fraction: dec!(0.5),
            max_partials: 1,
        }
    }
}

/// Feedback from closed trades into the dynamic parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub enabled: bool,
    pub min_trades: usize,
    pub lookback_trades: usize,
    pub weight_win_rate: f64,
    pub weight_payoff: f64,
    pub weight_drawdown: f64,
    pub aggressive: DynamicParams,
    pub defensive: DynamicParams,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_trades: 5,
            lookback_trades: 50,
            weight_win_rate: 0.40,
            weight_payoff: 0.25,
            weight_drawdown: 0.35,
            aggressive: DynamicParams {
                pullback_zone_pct: 0.2,
                atr_multiplier: 2.0,
                pyramid_trigger_r: 0.8,
            },
            defensive: DynamicParams {
                pullback_zone_pct: 0.6,
                atr_multiplier: 3.5,
                pyramid_trigger_r: 1.5,
            },
        }
    }
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub symbols: Vec<String>,
    pub cycle_secs: u64,
    /// Signal-timeframe candles fetched per cycle
    pub candle_limit: usize,
    pub market_base_url: String,
    pub retry_initial_ms: u64,
    pub retry_max_interval_ms: u64,
    pub retry_max_elapsed_secs: u64,
    /// Directory the external analyst writes `<SYMBOL>.json` into
    pub analyst_dir: Option<String>,
    /// Pull funding payments of open positions from the exchange
    pub funding_sync_enabled: bool,
    pub funding_sync_secs: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            cycle_secs: 30,
            candle_limit: 300,
            market_base_url: "https://fapi.binance.com".to_string(),
            retry_initial_ms: 500,
            retry_max_interval_ms: 5_000,
            retry_max_elapsed_secs: 20,
            analyst_dir: None,
            funding_sync_enabled: true,
            funding_sync_secs: 3600,
        }
    }
}

impl EngineConfig {
    /// Defaults, overridden by the JSON file at `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        let a = &self.account;
        ensure!(a.leverage >= 1, "leverage must be at least 1");
        ensure!(
            a.risk_per_trade > Decimal::ZERO && a.risk_per_trade <= dec!(0.1),
            "risk_per_trade must be in (0, 0.1]"
        );
        ensure!(
            a.max_margin_ratio > Decimal::ZERO && a.max_margin_ratio <= Decimal::ONE,
            "max_margin_ratio must be in (0, 1]"
        );
        ensure!(a.quantity_step > Decimal::ZERO, "quantity_step must be positive");
        ensure!(a.min_notional >= Decimal::ZERO, "min_notional must not be negative");
        ensure!(a.fixed_notional > Decimal::ZERO, "fixed_notional must be positive");

        let i = &self.indicators;
        ensure!(
            i.ema_short >= 1 && i.ema_short < i.ema_long,
            "ema_short must be shorter than ema_long"
        );
        ensure!(
            i.atr_fast >= 1 && i.atr_fast < i.atr_slow,
            "atr_fast must be shorter than atr_slow"
        );
        ensure!(i.bollinger_period >= 2, "bollinger_period must be at least 2");

        ensure!(self.trend.grace_period >= 1, "grace_period must be at least 1");
        ensure!(self.trend.filter_slope_bars >= 1, "filter_slope_bars must be at least 1");
        ensure!(self.breakout.squeeze_percentile <= 100, "squeeze_percentile must be <= 100");
        ensure!(
            self.breakout.trail_percent > Decimal::ZERO && self.breakout.trail_percent < dec!(100),
            "breakout trail_percent must be in (0, 100)"
        );
        ensure!(self.pyramid.add_ratio > Decimal::ZERO, "add_ratio must be positive");
        ensure!(
            self.partial_tp.fraction > Decimal::ZERO && self.partial_tp.fraction < Decimal::ONE,
            "partial fraction must be in (0, 1)"
        );
        ensure!(
            self.stops.adaptive_min_scale <= self.stops.adaptive_max_scale,
            "adaptive scale bounds are inverted"
        );
        ensure!(
            self.breakout.aggressive_zone_multiplier >= 1.0 && self.spike.zone_multiplier >= 1.0,
            "pullback zone multipliers must be at least 1"
        );
        ensure!(self.arbiter.shadow_max_age_secs > 0, "shadow_max_age_secs must be positive");
        ensure!(!self.runtime.symbols.is_empty(), "at least one symbol is required");
        ensure!(self.runtime.cycle_secs >= 1, "cycle_secs must be at least 1");
        ensure!(
            self.runtime.candle_limit >= i.min_history() + self.breakout.squeeze_lookback,
            "candle_limit {} cannot cover indicator warm-up plus the squeeze lookback",
            self.runtime.candle_limit
        );
        Ok(())
    }
}
