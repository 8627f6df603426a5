// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Watermark persistence.
//!
//! Stores the last **applied** `(op_time, hash)` for each replica in SQLite so
//! a restarted service resumes where it left off and can still detect a
//! rollback against its own history.
//!
//! # Write Semantics
//!
//! Before a batch is committed the applier records an *apply intent*: the
//! position of the batch's last operation. After the commit it saves the
//! watermark. Writes go straight to disk (no debouncing).
//!
//! ```text
//! record_intent(last op) → apply batch → commit → save(last op)
//!                                        (crash here = intent > watermark)
//! ```
//!
//! On restart everything between the watermark and the intent may already be
//! in the backend and is re-applied in reapplying mode.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED (and a starved pool) are [`Retryable`]; every
//! statement runs under [`retry`] with [`RetryConfig::sqlite_busy`].

use crate::error::{ReplicationError, Result};
use crate::fetcher::Watermark;
use crate::oplog::OpTime;
use crate::resilience::{retry, RetryConfig, RetryError, Retryable};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

impl Retryable for sqlx::Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Primary result code lives in the low byte of the extended one
            sqlx::Error::Database(db_err) => db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
            sqlx::Error::PoolTimedOut => true,
            _ => false,
        }
    }
}

/// Run one statement, retrying while the database is contended.
async fn with_busy_retry<T, F, Fut>(operation: &'static str, mut statement: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    retry(&RetryConfig::sqlite_busy(), operation, |attempt| {
        if attempt > 1 {
            crate::metrics::record_watermark_store_retry(operation);
        }
        statement()
    })
    .await
    .map_err(|e| match e {
        RetryError::GiveUp { last, .. } | RetryError::Abort(last) => ReplicationError::WatermarkStore(last),
    })
}

/// Persisted watermark row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkEntry {
    pub replica: String,
    pub watermark: Watermark,
    /// Unix millis of the last save.
    pub updated_at: i64,
}

type WatermarkRow = (String, i64, i64, i64, i64, i64);

fn entry_from_row((replica, term, secs, inc, hash, updated_at): WatermarkRow) -> Result<WatermarkEntry> {
    let secs = u32::try_from(secs).map_err(|_| ReplicationError::Internal(format!("corrupt watermark secs {secs}")))?;
    let inc = u32::try_from(inc).map_err(|_| ReplicationError::Internal(format!("corrupt watermark inc {inc}")))?;
    Ok(WatermarkEntry {
        replica,
        watermark: Watermark::new(OpTime::new(term, secs, inc), hash),
        updated_at,
    })
}

/// Persistent watermark storage backed by SQLite.
pub struct WatermarkStore {
    pool: SqlitePool,
    path: String,
}

impl WatermarkStore {
    /// Open (creating if needed) a store at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&path.as_ref().to_string_lossy(), true).await
    }

    /// Open a private in-memory store (tests).
    pub async fn in_memory() -> Result<Self> {
        Self::open(":memory:", false).await
    }

    /// Open the store described by `config`.
    pub async fn from_config(config: &crate::config::WatermarkConfig) -> Result<Self> {
        Self::open(&config.sqlite_path, config.wal_mode).await
    }

    async fn open(path: &str, wal_mode: bool) -> Result<Self> {
        info!(path, wal_mode, "Initializing watermark store");

        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };
        let journal = if wal_mode && !in_memory {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Memory
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        // Every connection to :memory: is its own database
        let max_connections = if in_memory { 1 } else { 2 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watermarks (
                replica TEXT PRIMARY KEY,
                term INTEGER NOT NULL,
                secs INTEGER NOT NULL,
                inc INTEGER NOT NULL,
                hash INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS apply_intents (
                replica TEXT PRIMARY KEY,
                term INTEGER NOT NULL,
                secs INTEGER NOT NULL,
                inc INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: path.to_string(),
        })
    }

    /// Last saved watermark for `replica`, `None` on first start.
    pub async fn load(&self, replica: &str) -> Result<Option<Watermark>> {
        Ok(self.entry(replica).await?.map(|entry| entry.watermark))
    }

    /// Full row for `replica`, including when it was saved.
    pub async fn entry(&self, replica: &str) -> Result<Option<WatermarkEntry>> {
        let pool = &self.pool;
        let row: Option<WatermarkRow> = with_busy_retry("watermark_load", || async {
            sqlx::query_as(
                "SELECT replica, term, secs, inc, hash, updated_at FROM watermarks WHERE replica = ?",
            )
            .bind(replica)
            .fetch_optional(pool)
            .await
        })
        .await?;

        row.map(entry_from_row).transpose()
    }

    /// Every stored row (diagnostics).
    pub async fn entries(&self) -> Result<Vec<WatermarkEntry>> {
        let pool = &self.pool;
        let rows: Vec<WatermarkRow> = with_busy_retry("watermark_list", || async {
            sqlx::query_as("SELECT replica, term, secs, inc, hash, updated_at FROM watermarks ORDER BY replica")
                .fetch_all(pool)
                .await
        })
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }

    /// Persist the applied watermark for `replica`.
    pub async fn save(&self, replica: &str, watermark: &Watermark) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        let op_time = watermark.op_time;

        let result = with_busy_retry("watermark_save", || async {
            sqlx::query(
                r#"
                INSERT INTO watermarks (replica, term, secs, inc, hash, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(replica) DO UPDATE SET
                    term = excluded.term,
                    secs = excluded.secs,
                    inc = excluded.inc,
                    hash = excluded.hash,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(replica)
            .bind(op_time.term)
            .bind(i64::from(op_time.secs))
            .bind(i64::from(op_time.inc))
            .bind(watermark.hash)
            .bind(now)
            .execute(pool)
            .await
        })
        .await;

        crate::metrics::record_watermark_saved(replica, result.is_ok());
        result?;
        debug!(replica, watermark = %watermark, "Watermark saved");
        Ok(())
    }

    /// Record that operations up to `op_time` are about to be committed.
    pub async fn record_intent(&self, replica: &str, op_time: OpTime) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        with_busy_retry("intent_save", || async {
            sqlx::query(
                r#"
                INSERT INTO apply_intents (replica, term, secs, inc, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(replica) DO UPDATE SET
                    term = excluded.term,
                    secs = excluded.secs,
                    inc = excluded.inc,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(replica)
            .bind(op_time.term)
            .bind(i64::from(op_time.secs))
            .bind(i64::from(op_time.inc))
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        debug!(replica, intent = %op_time, "Apply intent recorded");
        Ok(())
    }

    /// Position of the last batch that was about to be committed, if any.
    pub async fn load_intent(&self, replica: &str) -> Result<Option<OpTime>> {
        let pool = &self.pool;
        let row: Option<(i64, i64, i64)> = with_busy_retry("intent_load", || async {
            sqlx::query_as("SELECT term, secs, inc FROM apply_intents WHERE replica = ?")
                .bind(replica)
                .fetch_optional(pool)
                .await
        })
        .await?;

        row.map(|(term, secs, inc)| {
            let secs = u32::try_from(secs).map_err(|_| ReplicationError::Internal(format!("corrupt intent secs {secs}")))?;
            let inc = u32::try_from(inc).map_err(|_| ReplicationError::Internal(format!("corrupt intent inc {inc}")))?;
            Ok(OpTime::new(term, secs, inc))
        })
        .transpose()
    }

    /// Forget the watermark and apply intent for `replica` (e.g. before a
    /// fresh initial sync).
    pub async fn delete(&self, replica: &str) -> Result<()> {
        let pool = &self.pool;
        with_busy_retry("watermark_delete", || async {
            sqlx::query("DELETE FROM watermarks WHERE replica = ?")
                .bind(replica)
                .execute(pool)
                .await
        })
        .await?;
        with_busy_retry("intent_delete", || async {
            sqlx::query("DELETE FROM apply_intents WHERE replica = ?")
                .bind(replica)
                .execute(pool)
                .await
        })
        .await?;

        info!(replica, "Deleted watermark");
        Ok(())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        with_busy_retry("watermark_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Watermark store closed");
    }
}
