// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared SQLite store for all durable replay state.
//!
//! Checkpoints, pending records, transfer records and queue messages live in
//! one database so admission, leasing and completion can each commit as a
//! single transaction. Several engine instances may point at the same file:
//! every state change is a keyed, transactional update and nothing is cached
//! in process.
//!
//! # Schema
//!
//! ```text
//! replay_checkpoints   (message_type PK, watermark NULL=beginning, updated_at)
//! replay_pending       ((idx, doc_id) PK, state, admitted_at, updated_at)
//! replay_transfers     ((idx, doc_id) PK, transferred_at)
//! replay_queue         (id AUTOINCREMENT, message_type, doc_id, payload,
//!                       enqueued_at, visible_at, deliveries)
//! replay_dead_letters  (id PK, message_type, doc_id, payload, deliveries, dead_at)
//! ```
//!
//! # SQLite Busy Handling
//!
//! Every write transaction starts with a write statement, so it takes the
//! write lock up front and never has to upgrade a read snapshot. Contention
//! is absorbed by the connection `busy_timeout` plus [`execute_with_retry`],
//! which retries SQLITE_BUSY/SQLITE_LOCKED with exponential backoff. If the
//! retries run out the failure surfaces as `TransientStoreFailure`.

use crate::config::StoreConfig;
use crate::error::{ReplayError, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS replay_checkpoints (
        message_type TEXT PRIMARY KEY,
        watermark TEXT,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS replay_pending (
        idx TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        state TEXT NOT NULL,
        admitted_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (idx, doc_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS replay_transfers (
        idx TEXT NOT NULL,
        doc_id TEXT NOT NULL,
        transferred_at INTEGER NOT NULL,
        PRIMARY KEY (idx, doc_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS replay_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_type TEXT NOT NULL,
        doc_id TEXT,
        payload BLOB NOT NULL,
        enqueued_at INTEGER NOT NULL,
        visible_at INTEGER NOT NULL,
        deliveries INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS replay_queue_ready ON replay_queue (message_type, visible_at, id)",
    "CREATE INDEX IF NOT EXISTS replay_queue_doc ON replay_queue (message_type, doc_id)",
    r#"
    CREATE TABLE IF NOT EXISTS replay_dead_letters (
        id INTEGER PRIMARY KEY,
        message_type TEXT NOT NULL,
        doc_id TEXT,
        payload BLOB NOT NULL,
        deliveries INTEGER NOT NULL,
        dead_at INTEGER NOT NULL
    )
    "#,
];

/// Current wall-clock time in milliseconds since the epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6; extended codes (e.g.
            // SQLITE_BUSY_SNAPSHOT = 517) carry the primary code in the low byte
            if let Some(code) = db_err.code().and_then(|c| c.parse::<i32>().ok()) {
                return matches!(code & 0xff, 5 | 6);
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Map a local store error into the replay taxonomy.
///
/// Lock contention that outlived the retries is transient; anything else is
/// a genuine store error.
pub(crate) fn map_store_error(operation: &str, e: sqlx::Error) -> ReplayError {
    if is_sqlite_busy_error(&e) || matches!(e, sqlx::Error::PoolTimedOut) {
        ReplayError::transient(operation, e.to_string())
    } else {
        ReplayError::Store(e)
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Run `f` with busy retries and map the final error into [`ReplayError`].
pub(crate) async fn run<F, Fut, T>(operation_name: &str, f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    execute_with_retry(operation_name, f)
        .await
        .map_err(|e| map_store_error(operation_name, e))
}

/// Handle to the replay database.
///
/// Cloning is cheap: the pool is reference-counted.
#[derive(Clone)]
pub struct ReplayStore {
    pool: SqlitePool,
    path: String,
}

impl ReplayStore {
    /// Open (or create) the replay database described by `config`.
    ///
    /// Creates the schema if it doesn't exist.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Opening replay store");

        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };

        let journal_mode = if config.wal_mode && !in_memory {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplayError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal_mode)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout_duration())
            .create_if_missing(true);

        // Each in-memory connection is its own database, so pin it to one.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM replay_queue")
            .fetch_one(&pool)
            .await?;
        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM replay_pending")
            .fetch_one(&pool)
            .await?;
        if queued > 0 || pending > 0 {
            info!(queued, pending, "Restored replay state from previous run");
        }

        Ok(Self { pool, path })
    }

    /// Connection pool shared by the components.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint_wal(&self) -> Result<()> {
        let pool = &self.pool;

        run("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint_wal().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Replay store closed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Open a fresh file-backed store inside a temp dir.
    pub(crate) async fn temp_store(name: &str) -> (TempDir, ReplayStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            sqlite_path: dir.path().join(name).to_string_lossy().to_string(),
            ..StoreConfig::default()
        };
        let store = ReplayStore::open(&config).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_open_creates_schema() {
        let (_dir, store) = temp_store("schema.db").await;

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name LIKE 'replay_%' ORDER BY name",
        )
        .fetch_all(store.pool())
        .await
        .unwrap();

        assert_eq!(
            tables,
            vec![
                "replay_checkpoints",
                "replay_dead_letters",
                "replay_pending",
                "replay_queue",
                "replay_transfers",
            ]
        );
        store.close().await;
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            sqlite_path: dir.path().join("reopen.db").to_string_lossy().to_string(),
            ..StoreConfig::default()
        };

        let store = ReplayStore::open(&config).await.unwrap();
        store.close().await;

        let store = ReplayStore::open(&config).await.unwrap();
        assert!(store.path().contains("reopen.db"));
        store.close().await;
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = ReplayStore::open(&StoreConfig::in_memory()).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM replay_queue")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
        store.close().await;
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_map_store_error() {
        assert!(matches!(
            map_store_error("op", sqlx::Error::RowNotFound),
            ReplayError::Store(_)
        ));
        assert!(map_store_error("op", sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[test]
    fn test_is_sqlite_busy_error_row_not_found() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
