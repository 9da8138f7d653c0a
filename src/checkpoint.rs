// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for cursor-family message types.
//!
//! Stores the watermark of the last fully applied reference-data batch for
//! each of `badlist`, `safelist` and `workflow`. Watermarks live in the shared
//! replay database so they survive restarts and are visible to every engine
//! instance using the same store.
//!
//! ## Checkpoint Semantics
//!
//! The checkpoint stores the **last successfully applied** watermark. The
//! cursor worker fetches records strictly after it.
//!
//! ```text
//! fetch after w1 → apply batch at destination → advance to w2
//!                  (crash here = refetch batch, idempotent)
//! ```
//!
//! Two write paths exist:
//! - [`CheckpointStore::put`] is the operator override. It sets any value,
//!   including `"*"` which rewinds to [`Watermark::Beginning`].
//! - [`CheckpointStore::advance`] is the worker path. It is a single
//!   compare-and-set statement that only ever moves the watermark forward.

use crate::error::{ReplayError, Result};
use crate::message::{MessageType, SyncMode};
use crate::metrics;
use crate::store::{now_millis, run};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// The wildcard accepted by `put_checkpoint` to replay everything.
pub const REWIND_WILDCARD: &str = "*";

/// Position in a reference-data stream.
///
/// Tokens are opaque strings (usually timestamps) compared lexicographically,
/// which orders ISO-8601 timestamps of a consistent format chronologically.
/// `Beginning` sorts before every token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Watermark {
    /// No prior checkpoint: replay everything.
    Beginning,
    /// Last applied position.
    At(String),
}

impl Watermark {
    /// Lenient conversion: `"*"` and blank strings mean the beginning.
    ///
    /// Operator input goes through [`FromStr`], which rejects blank values.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value == REWIND_WILDCARD {
            Watermark::Beginning
        } else {
            Watermark::At(value.to_string())
        }
    }

    pub fn is_beginning(&self) -> bool {
        matches!(self, Watermark::Beginning)
    }

    /// Token, or `None` for the beginning.
    pub fn token(&self) -> Option<&str> {
        match self {
            Watermark::Beginning => None,
            Watermark::At(token) => Some(token),
        }
    }

    fn from_column(value: Option<String>) -> Self {
        value.map(Watermark::At).unwrap_or(Watermark::Beginning)
    }
}

impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Watermark::Beginning, Watermark::Beginning) => Ordering::Equal,
            (Watermark::Beginning, Watermark::At(_)) => Ordering::Less,
            (Watermark::At(_), Watermark::Beginning) => Ordering::Greater,
            (Watermark::At(a), Watermark::At(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Beginning => f.write_str(REWIND_WILDCARD),
            Watermark::At(token) => f.write_str(token),
        }
    }
}

impl FromStr for Watermark {
    type Err = ReplayError;

    /// Parse an operator override. A blank value is rejected rather than
    /// read as a rewind.
    fn from_str(value: &str) -> Result<Self> {
        if value.trim().is_empty() {
            return Err(ReplayError::InvalidWatermark(value.to_string()));
        }
        Ok(Watermark::parse(value))
    }
}

impl From<String> for Watermark {
    fn from(value: String) -> Self {
        Watermark::parse(&value)
    }
}

impl From<&str> for Watermark {
    fn from(value: &str) -> Self {
        Watermark::parse(value)
    }
}

impl From<Watermark> for String {
    fn from(value: Watermark) -> Self {
        value.to_string()
    }
}

/// Checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub message_type: MessageType,
    pub watermark: Watermark,
    /// Milliseconds since the epoch of the last write, if ever written.
    pub updated_at: Option<i64>,
}

/// Persistent watermark storage backed by SQLite.
#[derive(Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the watermark for a cursor-family type.
    ///
    /// Returns [`Watermark::Beginning`] if no checkpoint exists yet.
    pub async fn get(&self, message_type: MessageType) -> Result<Watermark> {
        Ok(self.get_entry(message_type).await?.watermark)
    }

    /// Get the full checkpoint row (for diagnostics).
    pub async fn get_entry(&self, message_type: MessageType) -> Result<Checkpoint> {
        let message_type = message_type.require(SyncMode::Cursor)?;
        let pool = &self.pool;
        let key = message_type.as_str();

        let row: Option<(Option<String>, i64)> = run("checkpoint_get", || async {
            sqlx::query_as(
                "SELECT watermark, updated_at FROM replay_checkpoints WHERE message_type = ?",
            )
            .bind(key)
            .fetch_optional(pool)
            .await
        })
        .await?;

        Ok(match row {
            Some((watermark, updated_at)) => Checkpoint {
                message_type,
                watermark: Watermark::from_column(watermark),
                updated_at: Some(updated_at),
            },
            None => Checkpoint {
                message_type,
                watermark: Watermark::Beginning,
                updated_at: None,
            },
        })
    }

    /// Set the watermark unconditionally (operator override).
    ///
    /// This is the only path that may move a checkpoint backwards.
    pub async fn put(&self, message_type: MessageType, watermark: &Watermark) -> Result<()> {
        let message_type = message_type.require(SyncMode::Cursor)?;
        let pool = &self.pool;
        let key = message_type.as_str();
        let token = watermark.token();
        let now = now_millis();

        run("checkpoint_put", || async {
            sqlx::query(
                r#"
                INSERT INTO replay_checkpoints (message_type, watermark, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(message_type) DO UPDATE SET
                    watermark = excluded.watermark,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(token)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        info!(message_type = %message_type, watermark = %watermark, "Checkpoint set");
        metrics::record_checkpoint_write(key, "put");
        Ok(())
    }

    /// Move the watermark forward to `watermark` if it is ahead of the stored one.
    ///
    /// Returns `true` if the checkpoint advanced. Advancing to
    /// `Beginning` or to a value at or behind the current one is a no-op.
    pub async fn advance(&self, message_type: MessageType, watermark: &Watermark) -> Result<bool> {
        let message_type = message_type.require(SyncMode::Cursor)?;
        let Some(token) = watermark.token() else {
            return Ok(false);
        };
        let pool = &self.pool;
        let key = message_type.as_str();
        let now = now_millis();

        let result = run("checkpoint_advance", || async {
            sqlx::query(
                r#"
                INSERT INTO replay_checkpoints (message_type, watermark, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(message_type) DO UPDATE SET
                    watermark = excluded.watermark,
                    updated_at = excluded.updated_at
                WHERE replay_checkpoints.watermark IS NULL
                   OR replay_checkpoints.watermark < excluded.watermark
                "#,
            )
            .bind(key)
            .bind(token)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        let advanced = result.rows_affected() > 0;
        if advanced {
            debug!(message_type = %message_type, watermark = %watermark, "Checkpoint advanced");
            metrics::record_checkpoint_write(key, "advance");
        } else {
            debug!(
                message_type = %message_type,
                watermark = %watermark,
                "Checkpoint not advanced (already at or past watermark)"
            );
        }
        Ok(advanced)
    }

    /// All cursor-family checkpoints (for metrics/debugging).
    pub async fn get_all(&self) -> Result<Vec<Checkpoint>> {
        let mut all = Vec::new();
        for message_type in MessageType::cursor_types() {
            all.push(self.get_entry(message_type).await?);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_store;

    #[test]
    fn test_operator_watermark_rejects_blank() {
        for blank in ["", "   ", "\t"] {
            let err = blank.parse::<Watermark>().unwrap_err();
            assert!(matches!(err, ReplayError::InvalidWatermark(_)), "{:?}", blank);
            assert!(!err.is_retryable());
        }
        assert_eq!("*".parse::<Watermark>().unwrap(), Watermark::Beginning);
        assert_eq!(
            " 2024-01-01 ".parse::<Watermark>().unwrap(),
            Watermark::At("2024-01-01".to_string())
        );
    }

    #[test]
    fn test_watermark_parse() {
        assert_eq!(Watermark::parse("*"), Watermark::Beginning);
        assert_eq!(Watermark::parse(""), Watermark::Beginning);
        assert_eq!(
            Watermark::parse(" 2024-01-01 "),
            Watermark::At("2024-01-01".to_string())
        );
        assert_eq!(Watermark::Beginning.to_string(), "*");
    }

    #[test]
    fn test_watermark_ordering() {
        let begin = Watermark::Beginning;
        let a = Watermark::parse("2024-01-01T00:00:00Z");
        let b = Watermark::parse("2024-01-02T00:00:00Z");
        assert!(begin < a);
        assert!(a < b);
        assert_eq!(std::cmp::max(a.clone(), b.clone()), b);
    }

    #[test]
    fn test_watermark_serde_as_string() {
        let json = serde_json::to_string(&Watermark::Beginning).unwrap();
        assert_eq!(json, "\"*\"");
        let parsed: Watermark = serde_json::from_str("\"2024-05-01\"").unwrap();
        assert_eq!(parsed, Watermark::At("2024-05-01".to_string()));
    }

    #[tokio::test]
    async fn test_fresh_store_returns_beginning() {
        let (_dir, store) = temp_store("cp_fresh.db").await;
        let checkpoints = CheckpointStore::new(store.pool().clone());

        assert_eq!(
            checkpoints.get(MessageType::Badlist).await.unwrap(),
            Watermark::Beginning
        );
        let entry = checkpoints.get_entry(MessageType::Badlist).await.unwrap();
        assert!(entry.updated_at.is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_dir, store) = temp_store("cp_put.db").await;
        let checkpoints = CheckpointStore::new(store.pool().clone());

        checkpoints
            .put(MessageType::Badlist, &Watermark::parse("2024-01-01"))
            .await
            .unwrap();
        assert_eq!(
            checkpoints.get(MessageType::Badlist).await.unwrap(),
            Watermark::parse("2024-01-01")
        );

        // Other types are independent
        assert_eq!(
            checkpoints.get(MessageType::Safelist).await.unwrap(),
            Watermark::Beginning
        );
        store.close().await;
    }

    #[tokio::test]
    async fn test_put_wildcard_rewinds() {
        let (_dir, store) = temp_store("cp_rewind.db").await;
        let checkpoints = CheckpointStore::new(store.pool().clone());

        checkpoints
            .put(MessageType::Workflow, &Watermark::parse("2024-06-01"))
            .await
            .unwrap();
        checkpoints
            .put(MessageType::Workflow, &Watermark::parse("*"))
            .await
            .unwrap();

        let entry = checkpoints.get_entry(MessageType::Workflow).await.unwrap();
        assert_eq!(entry.watermark, Watermark::Beginning);
        assert!(entry.updated_at.is_some());
        store.close().await;
    }

    #[tokio::test]
    async fn test_put_rejects_queue_family() {
        let (_dir, store) = temp_store("cp_invalid.db").await;
        let checkpoints = CheckpointStore::new(store.pool().clone());

        let err = checkpoints
            .put(MessageType::Alert, &Watermark::parse("2024-01-01"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::InvalidMessageType { .. }));

        let err = checkpoints.get(MessageType::File).await.unwrap_err();
        assert!(matches!(err, ReplayError::InvalidMessageType { .. }));
        store.close().await;
    }

    #[tokio::test]
    async fn test_advance_is_monotonic() {
        let (_dir, store) = temp_store("cp_advance.db").await;
        let checkpoints = CheckpointStore::new(store.pool().clone());
        let t = MessageType::Safelist;

        assert!(checkpoints.advance(t, &Watermark::parse("2024-01-02")).await.unwrap());
        assert!(!checkpoints.advance(t, &Watermark::parse("2024-01-01")).await.unwrap());
        assert!(!checkpoints.advance(t, &Watermark::parse("2024-01-02")).await.unwrap());
        assert!(!checkpoints.advance(t, &Watermark::Beginning).await.unwrap());
        assert_eq!(checkpoints.get(t).await.unwrap(), Watermark::parse("2024-01-02"));

        assert!(checkpoints.advance(t, &Watermark::parse("2024-01-03")).await.unwrap());
        assert_eq!(checkpoints.get(t).await.unwrap(), Watermark::parse("2024-01-03"));
        store.close().await;
    }

    #[tokio::test]
    async fn test_advance_after_rewind() {
        let (_dir, store) = temp_store("cp_advance_rewind.db").await;
        let checkpoints = CheckpointStore::new(store.pool().clone());
        let t = MessageType::Badlist;

        checkpoints.put(t, &Watermark::parse("2024-09-01")).await.unwrap();
        checkpoints.put(t, &Watermark::Beginning).await.unwrap();

        // A rewound (NULL) checkpoint accepts any token
        assert!(checkpoints.advance(t, &Watermark::parse("2020-01-01")).await.unwrap());
        assert_eq!(checkpoints.get(t).await.unwrap(), Watermark::parse("2020-01-01"));
        store.close().await;
    }

    #[tokio::test]
    async fn test_checkpoint_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::StoreConfig {
            sqlite_path: dir.path().join("cp_persist.db").to_string_lossy().to_string(),
            ..Default::default()
        };

        {
            let store = crate::store::ReplayStore::open(&config).await.unwrap();
            let checkpoints = CheckpointStore::new(store.pool().clone());
            checkpoints
                .put(MessageType::Badlist, &Watermark::parse("2024-03-03"))
                .await
                .unwrap();
            store.close().await;
        }

        {
            let store = crate::store::ReplayStore::open(&config).await.unwrap();
            let checkpoints = CheckpointStore::new(store.pool().clone());
            assert_eq!(
                checkpoints.get(MessageType::Badlist).await.unwrap(),
                Watermark::parse("2024-03-03")
            );
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_get_all_lists_cursor_types() {
        let (_dir, store) = temp_store("cp_all.db").await;
        let checkpoints = CheckpointStore::new(store.pool().clone());
        checkpoints
            .put(MessageType::Safelist, &Watermark::parse("x"))
            .await
            .unwrap();

        let all = checkpoints.get_all().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].message_type, MessageType::Safelist);
        assert_eq!(all[1].watermark, Watermark::parse("x"));
        assert!(all[0].watermark.is_beginning());
        store.close().await;
    }
}
