//! Analyst adapters.
//!
//! The AI service itself runs out of process; this side only consumes its
//! structured output.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::ports::{AnalysisContext, AnalystPort};
use crate::error::PortError;
use crate::models::AiAssessment;

/// Always neutral. Used when no analyst is configured.
#[derive(Debug, Clone, Default)]
pub struct NeutralAnalyst;

#[async_trait]
impl AnalystPort for NeutralAnalyst {
    async fn analyze(&self, _context: &AnalysisContext) -> Result<AiAssessment, PortError> {
        Ok(AiAssessment::neutral("no analyst configured"))
    }
}

/// Reads `{dir}/{SYMBOL}.json`, written by the external analyst process.
#[derive(Debug, Clone)]
pub struct FileAnalyst {
    dir: PathBuf,
}

impl FileAnalyst {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.json", symbol.to_uppercase()))
    }
}

#[async_trait]
impl AnalystPort for FileAnalyst {
    async fn analyze(&self, context: &AnalysisContext) -> Result<AiAssessment, PortError> {
        let path = self.path_for(&context.symbol);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PortError::Analyst(format!("{}: {}", path.display(), e)))?;

        let assessment: AiAssessment = serde_json::from_str(&raw)
            .map_err(|e| PortError::Analyst(format!("{}: {}", path.display(), e)))?;
        if !(0.0..=100.0).contains(&assessment.confidence) {
            return Err(PortError::Analyst(format!(
                "confidence {} out of range",
                assessment.confidence
            )));
        }

        debug!(
            symbol = %context.symbol,
            direction = ?assessment.direction,
            confidence = assessment.confidence,
            "Analyst assessment read"
        );
        Ok(assessment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AiDirection;
    use crate::trading::Trend;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn context(symbol: &str) -> AnalysisContext {
        AnalysisContext {
            symbol: symbol.to_string(),
            price: dec!(100),
            trend: Trend::Up,
            rsi: Some(55.0),
            adx: Some(28.0),
            atr: Some(1.2),
            hourly_change_pct: Some(0.4),
            position: None,
            trigger: "interval",
            at: Utc::now(),
        }
    }

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("analyst-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_reads_analyst_output_shape() {
        let dir = scratch_dir();
        std::fs::write(
            dir.join("BTCUSDT.json"),
            r#"{"signal":"long","confidence":72,"suggested_entry_price":"100.5",
                "suggested_stop_loss":"98.0","suggested_take_profit":"106","reason":"breakout retest"}"#,
        )
        .unwrap();

        let a = FileAnalyst::new(&dir).analyze(&context("btcusdt")).await.unwrap();
        assert_eq!(a.direction, AiDirection::Long);
        assert_eq!(a.stop, Some(dec!(98.0)));
        assert_eq!(a.rationale, "breakout retest");

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_missing_or_invalid_file_is_an_analyst_error() {
        let dir = scratch_dir();
        let analyst = FileAnalyst::new(&dir);
        assert!(matches!(
            analyst.analyze(&context("ETHUSDT")).await,
            Err(PortError::Analyst(_))
        ));

        std::fs::write(dir.join("ETHUSDT.json"), r#"{"signal":"long","confidence":250}"#).unwrap();
        assert!(matches!(
            analyst.analyze(&context("ETHUSDT")).await,
            Err(PortError::Analyst(_))
        ));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_neutral_analyst() {
        let a = NeutralAnalyst.analyze(&context("BTCUSDT")).await.unwrap();
        assert!(a.is_neutral());
    }
}
