//! SQLite persistence.
//!
//! Stores what the engine needs to resume after a restart:
//! - Open position per symbol (full state as JSON)
//! - Closed trades, append-only
//! - Analyst performance score
//! - Resolved analyst outcomes, live and shadow

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::warn;

use crate::api::{AiOutcome, PersistencePort};
use crate::error::PortError;
use crate::models::{Direction, Position, TradeRecord};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored position row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub symbol: String,
    pub direction: String,
    pub state: String,
    pub state_json: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredOutcome {
    symbol: String,
    direction: String,
    return_pct: f64,
    live: bool,
    resolved_at: DateTime<Utc>,
}

impl Database {
    /// Connect and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Private in-memory database. One connection, since every SQLite
    /// memory connection is its own database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                direction TEXT NOT NULL,
                state TEXT NOT NULL,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                strategy TEXT NOT NULL,
                direction TEXT NOT NULL,
                net_pnl TEXT NOT NULL,
                r_multiple TEXT NOT NULL,
                exit_reason TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL,
                record_json TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS performance (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                score REAL NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ai_outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                return_pct REAL NOT NULL,
                live INTEGER NOT NULL,
                resolved_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Every stored position row, unvalidated. For the status command.
    pub async fn stored_positions(&self) -> Result<Vec<StoredPosition>> {
        sqlx::query_as::<_, StoredPosition>("SELECT * FROM positions ORDER BY symbol")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch positions")
    }

    pub async fn trade_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trades")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn parse_direction(raw: &str) -> Option<Direction> {
    match raw {
        "long" => Some(Direction::Long),
        "short" => Some(Direction::Short),
        _ => None,
    }
}

#[async_trait]
impl PersistencePort for Database {
    async fn load_position(&self, symbol: &str) -> Result<Option<Position>, PortError> {
        let row: Option<StoredPosition> =
            sqlx::query_as("SELECT * FROM positions WHERE symbol = ?")
                .bind(symbol)
                .fetch_optional(&self.pool)
                .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let position: Position = serde_json::from_str(&row.state_json)
            .map_err(|e| PortError::Corrupt(format!("{}: {}", symbol, e)))?;
        position
            .validate()
            .map_err(|e| PortError::Corrupt(format!("{}: {}", symbol, e)))?;
        if position.symbol != symbol {
            return Err(PortError::Corrupt(format!(
                "row {} holds a position for {}",
                symbol, position.symbol
            )));
        }
        Ok(Some(position))
    }

    async fn save_position(&self, position: &Position) -> Result<(), PortError> {
        let json = serde_json::to_string(position).map_err(|e| PortError::Storage(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO positions (symbol, direction, state, state_json, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(symbol) DO UPDATE SET
                direction = excluded.direction,
                state = excluded.state,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&position.symbol)
        .bind(position.direction.as_str())
        .bind(position.state.as_str())
        .bind(json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_position(&self, symbol: &str) -> Result<(), PortError> {
        sqlx::query("DELETE FROM positions WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_trade(&self, trade: &TradeRecord) -> Result<(), PortError> {
        let json = serde_json::to_string(trade).map_err(|e| PortError::Storage(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO trades (
                symbol, strategy, direction, net_pnl, r_multiple,
                exit_reason, opened_at, closed_at, record_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.symbol)
        .bind(trade.strategy.as_str())
        .bind(trade.direction.as_str())
        .bind(trade.net_pnl.to_string())
        .bind(trade.r_multiple.to_string())
        .bind(trade.exit_reason.as_str())
        .bind(trade.opened_at)
        .bind(trade.closed_at)
        .bind(json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_trades(&self, symbol: Option<&str>, limit: usize) -> Result<Vec<TradeRecord>, PortError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, record_json FROM trades WHERE (?1 IS NULL OR symbol = ?1) ORDER BY id DESC LIMIT ?2",
        )
        .bind(symbol)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut trades: Vec<TradeRecord> = rows
            .into_iter()
            .filter_map(|(id, json)| match serde_json::from_str(&json) {
                Ok(trade) => Some(trade),
                Err(e) => {
                    warn!(id, error = %e, "Skipping unreadable trade row");
                    None
                }
            })
            .collect();
        trades.reverse();
        Ok(trades)
    }

    async fn load_performance_score(&self) -> Result<Option<f64>, PortError> {
        let row: Option<(f64,)> = sqlx::query_as("SELECT score FROM performance WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(score,)| score))
    }

    async fn save_performance_score(&self, score: f64) -> Result<(), PortError> {
        sqlx::query(
            r#"
            INSERT INTO performance (id, score, updated_at)
            VALUES (1, ?, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                score = excluded.score,
                updated_at = datetime('now')
            "#,
        )
        .bind(score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_ai_outcome(&self, outcome: &AiOutcome) -> Result<(), PortError> {
        sqlx::query(
            "INSERT INTO ai_outcomes (symbol, direction, return_pct, live, resolved_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&outcome.symbol)
        .bind(outcome.direction.as_str())
        .bind(outcome.return_pct)
        .bind(outcome.live)
        .bind(outcome.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_ai_outcomes(&self, limit: usize) -> Result<Vec<AiOutcome>, PortError> {
        let rows: Vec<StoredOutcome> = sqlx::query_as(
            "SELECT symbol, direction, return_pct, live, resolved_at FROM ai_outcomes ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut outcomes: Vec<AiOutcome> = rows
            .into_iter()
            .filter_map(|r| {
                Some(AiOutcome {
                    direction: parse_direction(&r.direction)?,
                    symbol: r.symbol,
                    return_pct: r.return_pct,
                    live: r.live,
                    resolved_at: r.resolved_at,
                })
            })
            .collect();
        outcomes.reverse();
        Ok(outcomes)
    }
}
