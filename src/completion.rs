// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Idempotent completion of tracked documents.
//!
//! `set_complete` is the only signal that stops a document from being
//! selected again. It commits three changes as one transaction:
//!
//! 1. insert the TransferRecord (the existing row wins on conflict)
//! 2. drop the PendingRecord, if any
//! 3. drop any queued or leased messages for the document
//!
//! Concurrent completions of the same document serialize on the SQLite
//! write lock. The first inserts the record, the rest observe the conflict
//! and report [`CompletionOutcome::AlreadyComplete`]. All of them succeed.

use crate::error::Result;
use crate::message::Index;
use crate::metrics;
use crate::store::{now_millis, run};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use tracing::debug;

/// Outcome of `set_complete`. Both variants are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// This call created the TransferRecord.
    Completed,
    /// A TransferRecord already existed; nothing changed.
    AlreadyComplete,
}

impl CompletionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionOutcome::Completed => "completed",
            CompletionOutcome::AlreadyComplete => "already_complete",
        }
    }
}

/// Authoritative proof that a document was transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    pub index: Index,
    pub doc_id: String,
    pub transferred_at: DateTime<Utc>,
}

/// Writes and reads TransferRecords.
#[derive(Clone)]
pub struct CompletionTracker {
    pool: SqlitePool,
}

impl CompletionTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mark `(index, doc_id)` as transferred.
    ///
    /// Works whether or not the document was ever admitted.
    pub async fn set_complete(&self, index: Index, doc_id: &str) -> Result<CompletionOutcome> {
        let outcome = run("set_complete", || self.try_complete(index, doc_id)).await?;

        debug!(index = %index, doc_id, outcome = outcome.as_str(), "Completion recorded");
        metrics::record_completion(index.as_str(), outcome.as_str());
        Ok(outcome)
    }

    async fn try_complete(
        &self,
        index: Index,
        doc_id: &str,
    ) -> std::result::Result<CompletionOutcome, sqlx::Error> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO replay_transfers (idx, doc_id, transferred_at)
            VALUES (?, ?, ?)
            ON CONFLICT(idx, doc_id) DO NOTHING
            "#,
        )
        .bind(index.as_str())
        .bind(doc_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM replay_pending WHERE idx = ? AND doc_id = ?")
            .bind(index.as_str())
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM replay_queue WHERE message_type = ? AND doc_id = ?")
            .bind(index.message_type().as_str())
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(if inserted > 0 {
            CompletionOutcome::Completed
        } else {
            CompletionOutcome::AlreadyComplete
        })
    }

    /// The TransferRecord for a document, if it was completed.
    pub async fn transfer_record(
        &self,
        index: Index,
        doc_id: &str,
    ) -> Result<Option<TransferRecord>> {
        let pool = &self.pool;

        let transferred_at: Option<i64> = run("transfer_record", || async {
            sqlx::query_scalar(
                "SELECT transferred_at FROM replay_transfers WHERE idx = ? AND doc_id = ?",
            )
            .bind(index.as_str())
            .bind(doc_id)
            .fetch_optional(pool)
            .await
        })
        .await?;

        Ok(transferred_at.map(|millis| TransferRecord {
            index,
            doc_id: doc_id.to_string(),
            transferred_at: DateTime::from_timestamp_millis(millis).unwrap_or_default(),
        }))
    }

    /// Number of completed documents in `index`.
    pub async fn completed_count(&self, index: Index) -> Result<u64> {
        let pool = &self.pool;
        let count: i64 = run("completed_count", || async {
            sqlx::query_scalar("SELECT COUNT(*) FROM replay_transfers WHERE idx = ?")
                .bind(index.as_str())
                .fetch_one(pool)
                .await
        })
        .await?;
        Ok(count.max(0) as u64)
    }
}
