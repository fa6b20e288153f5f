//! Closed-trade statistics and the analyst performance score.

use std::fmt;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::TradeRecord;

/// Aggregate statistics over a run of closed trades (oldest first).
#[derive(Debug, Clone, Default)]
pub struct TradeStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,

    /// 0.0 to 1.0
    pub win_rate: f64,

    pub avg_win: Decimal,
    /// Absolute value
    pub avg_loss: Decimal,

    /// Average win over average loss; `None` without losses
    pub payoff_ratio: Option<f64>,

    pub profit_factor: f64,
    pub total_pnl: Decimal,
    pub total_fees: Decimal,
    /// Net funding paid; negative when received
    pub total_funding: Decimal,

    /// Peak-to-trough fraction of the equity curve (0.0 to 1.0)
    pub max_drawdown: f64,
    pub max_drawdown_quote: Decimal,

    pub avg_r_multiple: f64,
    /// Per-trade Sharpe on net PnL (not annualized)
    pub sharpe_ratio: f64,
}

impl TradeStats {
    /// Compute statistics with the equity curve starting at `starting_equity`.
    pub fn calculate(trades: &[TradeRecord], starting_equity: Decimal) -> Self {
        let mut stats = Self {
            total_trades: trades.len(),
            ..Default::default()
        };
        if trades.is_empty() {
            return stats;
        }

        let pnls: Vec<Decimal> = trades.iter().map(|t| t.net_pnl).collect();
        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            pnls.iter().partition(|&&p| p > Decimal::ZERO);

        stats.winning_trades = wins.len();
        stats.losing_trades = losses.len();
        stats.win_rate = wins.len() as f64 / pnls.len() as f64;
        stats.total_pnl = pnls.iter().copied().sum();
        stats.total_fees = trades.iter().map(|t| t.fees).sum();
        stats.total_funding = trades.iter().map(|t| t.funding_fees).sum();

        if !wins.is_empty() {
            stats.avg_win = wins.iter().copied().sum::<Decimal>() / Decimal::from(wins.len());
        }
        if !losses.is_empty() {
            stats.avg_loss =
                losses.iter().map(|l| l.abs()).sum::<Decimal>() / Decimal::from(losses.len());
        }
        if stats.avg_loss > Decimal::ZERO {
            stats.payoff_ratio = (stats.avg_win / stats.avg_loss).to_f64();
        }

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();
        if gross_loss > Decimal::ZERO {
            stats.profit_factor =
                gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0);
        }

        let (dd_quote, dd_frac) = max_drawdown(&pnls, starting_equity);
        stats.max_drawdown_quote = dd_quote;
        stats.max_drawdown = dd_frac;

        let r_values: Vec<f64> = trades.iter().filter_map(|t| t.r_multiple.to_f64()).collect();
        if !r_values.is_empty() {
            stats.avg_r_multiple = r_values.iter().mean();
        }

        let returns: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        if returns.len() >= 2 {
            let std_dev = returns.iter().std_dev();
            if std_dev > 0.0 {
                stats.sharpe_ratio = returns.iter().mean() / std_dev;
            }
        }

        stats
    }
}

/// Largest peak-to-trough decline, in quote and as a fraction of the peak.
pub fn max_drawdown(pnls: &[Decimal], starting_equity: Decimal) -> (Decimal, f64) {
    let mut equity = starting_equity;
    let mut peak = starting_equity;
    let mut max_dd = Decimal::ZERO;
    let mut max_dd_frac = 0.0f64;

    for pnl in pnls {
        equity += pnl;
        if equity > peak {
            peak = equity;
        }
        if peak > Decimal::ZERO {
            let dd = peak - equity;
            if dd > max_dd {
                max_dd = dd;
            }
            let frac = dd.to_f64().unwrap_or(0.0) / peak.to_f64().unwrap_or(1.0);
            if frac > max_dd_frac {
                max_dd_frac = frac;
            }
        }
    }

    (max_dd, max_dd_frac.clamp(0.0, 1.0))
}

impl fmt::Display for TradeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:=^50}", " Trade Statistics ")?;
        writeln!(
            f,
            "Trades:         {} ({} W / {} L)",
            self.total_trades, self.winning_trades, self.losing_trades
        )?;
        writeln!(f, "Win rate:       {:.1}%", self.win_rate * 100.0)?;
        writeln!(f, "Avg win/loss:   {:.2} / {:.2}", self.avg_win, self.avg_loss)?;
        match self.payoff_ratio {
            Some(p) => writeln!(f, "Payoff ratio:   {:.2}", p)?,
            None => writeln!(f, "Payoff ratio:   n/a")?,
        }
        writeln!(f, "Profit factor:  {:.2}", self.profit_factor)?;
        writeln!(f, "Avg R:          {:.2}", self.avg_r_multiple)?;
        writeln!(f, "Net PnL:        {:.2}", self.total_pnl)?;
        writeln!(f, "Fees:           {:.2}", self.total_fees)?;
        writeln!(f, "Funding:        {:.2}", self.total_funding)?;
        writeln!(
            f,
            "Max drawdown:   {:.2} ({:.1}%)",
            self.max_drawdown_quote,
            self.max_drawdown * 100.0
        )?;
        writeln!(f, "Sharpe/trade:   {:.2}", self.sharpe_ratio)?;
        write!(f, "{:=^50}", "")
    }
}

/// Initial analyst performance score.
pub const INITIAL_AI_SCORE: f64 = 50.0;

/// Blend the previous analyst score with one computed from resolved outcomes.
///
/// `outcomes` are per-trade return fractions, most recent last. With fewer
/// than `min_trades` the previous score is returned unchanged.
pub fn update_ai_score(previous: f64, outcomes: &[f64], min_trades: usize, lookback: usize) -> f64 {
    let start = outcomes.len().saturating_sub(lookback);
    let window = &outcomes[start..];
    if window.len() < min_trades.max(1) {
        return previous;
    }

    let wins: Vec<f64> = window.iter().copied().filter(|r| *r > 0.0).collect();
    let losses: Vec<f64> = window.iter().copied().filter(|r| *r <= 0.0).collect();
    let win_rate = wins.len() as f64 / window.len() as f64;

    let avg_win = if wins.is_empty() { 0.0 } else { wins.iter().mean() };
    let avg_loss = if losses.is_empty() {
        0.0
    } else {
        losses.iter().map(|l| l.abs()).mean()
    };
    let payoff = if avg_loss > 0.0 { avg_win / avg_loss } else { 5.0 };

    let mean = window.iter().mean();
    let std_dev = if window.len() >= 2 { window.iter().std_dev() } else { 0.0 };
    let consistency = if std_dev > 0.0 {
        (50.0 + 50.0 * mean / std_dev).clamp(0.0, 100.0)
    } else {
        100.0
    };

    let fresh = 0.5 * 100.0 * win_rate + 0.3 * 100.0 * payoff.min(3.0) / 3.0 + 0.2 * consistency;
    (0.8 * previous + 0.2 * fresh).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, ExitReason, StrategyId};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn trade(net_pnl: Decimal) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            strategy: StrategyId::Pullback,
            entry_price: dec!(100),
            exit_price: dec!(100),
            quantity: dec!(1),
            gross_pnl: net_pnl,
            fees: dec!(0.1),
            funding_fees: Decimal::ZERO,
            net_pnl,
            r_multiple: net_pnl / dec!(10),
            pyramid_adds: 0,
            partial_closes: 0,
            opened_at: now,
            closed_at: now,
            exit_reason: ExitReason::StopLoss,
        }
    }

    #[test]
    fn test_win_loss_statistics() {
        let trades: Vec<_> = [dec!(100), dec!(-50), dec!(200), dec!(-30), dec!(150)]
            .into_iter()
            .map(trade)
            .collect();
        let stats = TradeStats::calculate(&trades, dec!(1000));

        assert_eq!(stats.winning_trades, 3);
        assert_eq!(stats.losing_trades, 2);
        assert_eq!(stats.total_pnl, dec!(370));
        assert!((stats.win_rate - 0.6).abs() < 1e-9);
        assert_eq!(stats.avg_win, dec!(150));
        assert_eq!(stats.avg_loss, dec!(40));
        assert!((stats.payoff_ratio.unwrap() - 3.75).abs() < 1e-9);
    }

    #[test]
    fn test_drawdown_on_top_of_starting_equity() {
        // 1000 -> 1100 -> 1150 -> 1070 -> 1050 -> 1150
        let pnls = [dec!(100), dec!(50), dec!(-80), dec!(-20), dec!(100)];
        let (quote, frac) = max_drawdown(&pnls, dec!(1000));
        assert_eq!(quote, dec!(100));
        assert!((frac - 100.0 / 1150.0).abs() < 1e-9);
    }

    #[test]
    fn test_ai_score_needs_history() {
        let outcomes = vec![0.01; 5];
        assert_eq!(update_ai_score(INITIAL_AI_SCORE, &outcomes, 10, 50), INITIAL_AI_SCORE);
    }

    #[test]
    fn test_ai_score_rewards_consistent_winners() {
        // All wins, zero variance: 50 + 30 + 20 = 100 fresh
        let outcomes = vec![0.02; 12];
        let score = update_ai_score(50.0, &outcomes, 10, 50);
        assert!((score - 60.0).abs() < 1e-9);

        let losers = vec![-0.02; 12];
        let score = update_ai_score(50.0, &losers, 10, 50);
        assert!(score < 50.0);
    }
}
