//! SQLite persistence for replication state.
//!
//! Three tables survive restarts:
//! - `position_mappings`: which slave position copies which master ticket
//! - `operation_queue`: durable work for the drain workers, with retry state
//! - `audit_log`: append-only trail of everything the engine did
//!
//! The database runs in WAL mode so readers never block the writer.

mod audit;
mod mappings;
mod queue;

pub use audit::AuditEntry;
pub use mappings::{MappingFilter, NewMapping};
pub use queue::{EnqueueOutcome, NewOperation, OperationFilter};

pub(crate) use audit::log_event;
pub(crate) use mappings::{close_mapping, insert_mapping, mark_mapping_error, reduce_mapping};
pub(crate) use queue::{complete_operation, fail_operation, fail_pending, schedule_retry};

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::error::{CopierError, Result};

/// Database connection pool holding all replication state.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `database_url` and migrate it.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // Every connection to :memory: is a separate database
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        debug!(url = %database_url, "Database ready");
        Ok(db)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_mappings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                master_ticket INTEGER NOT NULL,
                slave_name TEXT NOT NULL,
                slave_ticket INTEGER,
                symbol TEXT NOT NULL,
                master_volume TEXT NOT NULL,
                slave_volume TEXT NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                last_error TEXT,
                created_at TEXT NOT NULL,
                closed_at TEXT,
                UNIQUE(master_ticket, slave_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operation_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_type TEXT NOT NULL,
                master_ticket INTEGER NOT NULL,
                slave_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                next_retry_at INTEGER NOT NULL,
                recovered INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                master_ticket INTEGER,
                slave_name TEXT,
                slave_ticket INTEGER,
                details TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_queue_status_retry ON operation_queue(status, next_retry_at)",
            "CREATE INDEX IF NOT EXISTS idx_queue_slave_status ON operation_queue(slave_name, status)",
            "CREATE INDEX IF NOT EXISTS idx_queue_pair ON operation_queue(master_ticket, slave_name)",
            "CREATE INDEX IF NOT EXISTS idx_mappings_master ON position_mappings(master_ticket)",
            "CREATE INDEX IF NOT EXISTS idx_mappings_slave_status ON position_mappings(slave_name, status)",
            "CREATE INDEX IF NOT EXISTS idx_audit_event ON audit_log(event_type)",
        ];
        for statement in indexes {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Start a transaction. Writes that must land together go through one.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Decimals are stored as TEXT to keep exact lot sizes.
pub(crate) fn parse_decimal(column: &str, value: &str) -> Result<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| CopierError::Consistency(format!("bad decimal in {}: {} ({})", column, value, e)))
}

pub(crate) fn parse_column<T: FromStr<Err = String>>(column: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|e| CopierError::Consistency(format!("bad value in {}: {}", column, e)))
}
