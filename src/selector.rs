// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk admission of documents into the replication set.
//!
//! `set_bulk_pending` runs a search against the source document store and
//! admits matching documents that are not already tracked. Admission of one
//! document is a single guarded insert:
//!
//! ```text
//! INSERT pending (idx, doc_id)          ─┐
//!   unless a TransferRecord exists       │ one statement,
//!   ON CONFLICT (already pending) skip  ─┘ one outcome per key
//! if inserted: enqueue a queue message   (same transaction)
//! ```
//!
//! Candidates are deduplicated and sorted by document id before admission,
//! so a pass over the same data admits the same documents in the same order
//! regardless of how the document store ordered its results. Repeating a
//! pass admits nothing new; documents beyond `max_docs` wait for a later
//! pass.

use crate::error::Result;
use crate::message::{Index, QueueMessage};
use crate::metrics;
use crate::queue::{encode_payload, insert_message};
use crate::source::{ArtifactStore, DocumentStore, SourceClient};
use crate::store::{now_millis, run};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::fmt;
use tracing::{debug, info};

/// Replication state of a tracked document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    /// Admitted, waiting in the queue.
    Pending,
    /// Leased by a worker.
    InTransit,
    /// Transferred; a TransferRecord exists. Terminal.
    Complete,
}

impl ReplayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayState::Pending => "pending",
            ReplayState::InTransit => "in_transit",
            ReplayState::Complete => "complete",
        }
    }

    fn from_column(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ReplayState::Pending),
            "in_transit" => Some(ReplayState::InTransit),
            "complete" => Some(ReplayState::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for ReplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sort and deduplicate candidate ids into admission order.
fn admission_order(mut candidates: Vec<String>) -> Vec<String> {
    candidates.sort();
    candidates.dedup();
    candidates
}

/// Admits documents into the pending set.
#[derive(Clone)]
pub struct PendingSelector {
    pool: SqlitePool,
    compress_threshold: usize,
}

impl PendingSelector {
    pub fn new(pool: SqlitePool, compress_threshold: usize) -> Self {
        Self {
            pool,
            compress_threshold,
        }
    }

    /// Search the source and admit up to `max_docs` new documents.
    ///
    /// Returns the number of documents newly admitted.
    pub async fn set_bulk_pending<D: DocumentStore, A: ArtifactStore>(
        &self,
        source: &SourceClient<D, A>,
        index: Index,
        query: &str,
        filter_queries: &[String],
        max_docs: usize,
    ) -> Result<usize> {
        if max_docs == 0 {
            return Ok(0);
        }

        let candidates = source.search(index, query, filter_queries).await?;
        let matched = candidates.len();
        let admitted = self.admit(index, candidates, max_docs).await?;

        info!(
            index = %index,
            query,
            filters = filter_queries.len(),
            matched,
            admitted,
            max_docs,
            "Bulk pending pass complete"
        );
        Ok(admitted)
    }

    /// Admit candidates in id order until `max_docs` have been admitted.
    ///
    /// Candidates already Pending, InTransit or Complete are skipped and do
    /// not count towards `max_docs`.
    pub async fn admit(
        &self,
        index: Index,
        candidates: Vec<String>,
        max_docs: usize,
    ) -> Result<usize> {
        if max_docs == 0 || candidates.is_empty() {
            return Ok(0);
        }
        // Admission messages only carry the reference, so they are encoded
        // up front and the transaction body cannot fail on encoding.
        let ordered = admission_order(candidates)
            .into_iter()
            .map(|doc_id| {
                let message = QueueMessage::admitted(index, &doc_id);
                let payload = encode_payload(&message.payload, self.compress_threshold)?;
                Ok((doc_id, payload))
            })
            .collect::<Result<Vec<_>>>()?;

        let admitted = run("bulk_pending", || self.try_admit(index, &ordered, max_docs)).await?;

        for doc_id in &admitted {
            debug!(index = %index, doc_id = %doc_id, "Document admitted");
        }
        metrics::record_admission(index.as_str(), admitted.len());
        for _ in &admitted {
            metrics::record_enqueue(index.as_str(), "admission");
        }
        Ok(admitted.len())
    }

    async fn try_admit(
        &self,
        index: Index,
        ordered: &[(String, Vec<u8>)],
        max_docs: usize,
    ) -> std::result::Result<Vec<String>, sqlx::Error> {
        let now = now_millis();
        let message_type = index.message_type();
        let mut admitted = Vec::new();

        let mut tx = self.pool.begin().await?;

        for (doc_id, payload) in ordered {
            if admitted.len() >= max_docs {
                break;
            }

            let inserted = sqlx::query(
                r#"
                INSERT INTO replay_pending (idx, doc_id, state, admitted_at, updated_at)
                SELECT ?1, ?2, ?3, ?4, ?4
                WHERE NOT EXISTS (
                    SELECT 1 FROM replay_transfers WHERE idx = ?1 AND doc_id = ?2
                )
                ON CONFLICT(idx, doc_id) DO NOTHING
                "#,
            )
            .bind(index.as_str())
            .bind(doc_id)
            .bind(ReplayState::Pending.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 0 {
                continue;
            }

            insert_message(&mut tx, message_type, Some(doc_id), payload, now).await?;
            admitted.push(doc_id.clone());
        }

        tx.commit().await?;
        Ok(admitted)
    }

    /// Current state of a document, or `None` if it is not tracked.
    pub async fn replay_state(&self, index: Index, doc_id: &str) -> Result<Option<ReplayState>> {
        let pool = &self.pool;

        let (complete, state): (bool, Option<String>) = run("replay_state", || async {
            sqlx::query_as(
                r#"
                SELECT
                    EXISTS(SELECT 1 FROM replay_transfers WHERE idx = ?1 AND doc_id = ?2),
                    (SELECT state FROM replay_pending WHERE idx = ?1 AND doc_id = ?2)
                "#,
            )
            .bind(index.as_str())
            .bind(doc_id)
            .fetch_one(pool)
            .await
        })
        .await?;

        if complete {
            return Ok(Some(ReplayState::Complete));
        }
        Ok(state.as_deref().and_then(ReplayState::from_column))
    }

    /// Number of tracked, not yet complete documents in `index`.
    pub async fn pending_count(&self, index: Index) -> Result<u64> {
        let pool = &self.pool;
        let count: i64 = run("pending_count", || async {
            sqlx::query_scalar("SELECT COUNT(*) FROM replay_pending WHERE idx = ?")
                .bind(index.as_str())
                .fetch_one(pool)
                .await
        })
        .await?;
        Ok(count.max(0) as u64)
    }
}
