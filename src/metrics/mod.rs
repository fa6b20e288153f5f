//! Performance statistics.

mod calculator;

pub use calculator::{update_ai_score, TradeStats, INITIAL_AI_SCORE};
