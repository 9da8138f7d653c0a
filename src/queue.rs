// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable per-type transfer queue.
//!
//! Messages for `alert`, `submission` and `file` wait in `replay_queue` until
//! a worker leases one. A lease hides the message for the visibility window
//! and hands out a [`Receipt`]. The worker then either finishes the message
//! (`set_complete` or [`TransferQueue::ack`]) or gives it back
//! ([`TransferQueue::release`]).
//!
//! # Message Lifecycle
//!
//! ```text
//!  put / admission ──► ready ──lease──► leased ──ack/complete──► (deleted)
//!                        ▲                │
//!                        │  lease expires │ release (backoff)
//!                        └────────────────┘
//!                                         │ deliveries >= max_deliveries
//!                                         ▼
//!                                    dead letter ──requeue──► ready
//! ```
//!
//! Leasing is one `UPDATE ... RETURNING` statement, so two workers polling
//! the same type never receive the same message within one visibility
//! window. Each lease bumps the delivery counter, so a receipt from an
//! expired lease is stale and cannot acknowledge the message after another
//! worker has leased it.
//!
//! # Payload Storage
//!
//! Payloads are stored as JSON. Anything at or above
//! `compress_threshold_bytes` is zstd-compressed and recognized on read by
//! the zstd frame magic. JSON text never starts with that byte sequence.

use crate::config::QueueConfig;
use crate::error::{ReplayError, Result};
use crate::message::{Delivery, MessageType, QueueMessage, Receipt, SyncMode};
use crate::metrics;
use crate::selector::ReplayState;
use crate::store::{now_millis, run};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

const ZSTD_LEVEL: i32 = 3;

/// `(id, doc_id, payload, deliveries)`
type QueueRow = (i64, Option<String>, Vec<u8>, i64);

/// Encode a payload for storage, compressing it at or above `compress_threshold`.
pub fn encode_payload(payload: &serde_json::Value, compress_threshold: usize) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(payload)
        .map_err(|e| ReplayError::Codec(format!("json encode: {}", e)))?;
    if json.len() < compress_threshold {
        return Ok(json);
    }
    zstd::encode_all(&json[..], ZSTD_LEVEL)
        .map_err(|e| ReplayError::Codec(format!("zstd encode: {}", e)))
}

/// Decode a stored payload.
pub fn decode_payload(data: &[u8]) -> Result<serde_json::Value> {
    let json = maybe_decompress(data)?;
    serde_json::from_slice(&json).map_err(|e| ReplayError::Codec(format!("json decode: {}", e)))
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| ReplayError::Codec(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| ReplayError::Codec(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

fn deliveries_from(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Insert an already-encoded message inside the caller's transaction.
pub(crate) async fn insert_message(
    conn: &mut SqliteConnection,
    message_type: MessageType,
    doc_id: Option<&str>,
    payload: &[u8],
    now: i64,
) -> std::result::Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO replay_queue
            (message_type, doc_id, payload, enqueued_at, visible_at, deliveries)
        VALUES (?, ?, ?, ?, ?, 0)
        RETURNING id
        "#,
    )
    .bind(message_type.as_str())
    .bind(doc_id)
    .bind(payload)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
}

/// Move every visible message of `message_type` that has used up its
/// deliveries into the dead-letter table.
///
/// Tracked documents lose their PendingRecord so a later admission pass may
/// pick them up again.
async fn dead_letter_exhausted(
    conn: &mut SqliteConnection,
    message_type: MessageType,
    max_deliveries: u32,
    now: i64,
) -> std::result::Result<Vec<QueueRow>, sqlx::Error> {
    let rows: Vec<QueueRow> = sqlx::query_as(
        r#"
        DELETE FROM replay_queue
        WHERE message_type = ? AND deliveries >= ? AND visible_at <= ?
        RETURNING id, doc_id, payload, deliveries
        "#,
    )
    .bind(message_type.as_str())
    .bind(i64::from(max_deliveries))
    .bind(now)
    .fetch_all(&mut *conn)
    .await?;

    for (id, doc_id, payload, deliveries) in &rows {
        sqlx::query(
            r#"
            INSERT INTO replay_dead_letters (id, message_type, doc_id, payload, deliveries, dead_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(message_type.as_str())
        .bind(doc_id.as_deref())
        .bind(payload)
        .bind(deliveries)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        if let (Some(index), Some(doc_id)) = (message_type.index(), doc_id.as_deref()) {
            sqlx::query("DELETE FROM replay_pending WHERE idx = ? AND doc_id = ?")
                .bind(index.as_str())
                .bind(doc_id)
                .execute(&mut *conn)
                .await?;
        }
    }

    Ok(rows)
}

/// Queue counters for one message type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Visible now and eligible for leasing (or for dead-lettering on the next poll).
    pub ready: u64,
    /// Leased, or released and waiting out their backoff.
    pub in_flight: u64,
    /// In the dead-letter table.
    pub dead: u64,
}

/// A message that exhausted its deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: i64,
    /// Payload is `Null` when the stored bytes could not be decoded.
    pub message: QueueMessage,
    pub deliveries: u32,
    /// Milliseconds since the epoch.
    pub dead_at: i64,
    /// Why the stored payload could not be decoded, if it could not.
    pub decode_error: Option<String>,
}

impl DeadLetter {
    pub fn is_corrupt(&self) -> bool {
        self.decode_error.is_some()
    }
}

/// Result of one sweep over the queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// InTransit records reverted to Pending because their lease expired.
    pub reverted: usize,
    /// Messages moved to the dead-letter table.
    pub dead_lettered: usize,
}

/// Transfer queue backed by the shared replay database.
#[derive(Clone)]
pub struct TransferQueue {
    pool: SqlitePool,
    config: QueueConfig,
}

impl TransferQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Inject a message directly.
    ///
    /// Returns the queue id of the new message.
    pub async fn put(&self, message: &QueueMessage) -> Result<i64> {
        let message_type = message.message_type.require(SyncMode::Queue)?;
        let payload = encode_payload(&message.payload, self.config.compress_threshold_bytes)?;
        let doc_id = message.doc_id.as_deref();

        let id = run("queue_put", || async {
            let mut conn = self.pool.acquire().await?;
            insert_message(&mut conn, message_type, doc_id, &payload, now_millis()).await
        })
        .await?;

        debug!(message_type = %message_type, id, doc_id = ?doc_id, "Message enqueued");
        metrics::record_enqueue(message_type.as_str(), "put");
        Ok(id)
    }

    /// Lease the oldest visible message of `message_type`, if any.
    ///
    /// Non-blocking: returns `Ok(None)` when nothing is visible. Messages
    /// that used up their deliveries are dead-lettered first.
    pub async fn lease(&self, message_type: MessageType) -> Result<Option<Delivery>> {
        let message_type = message_type.require(SyncMode::Queue)?;

        let (leased, dead) = run("queue_lease", || self.try_lease(message_type)).await?;

        if !dead.is_empty() {
            for (id, doc_id, _, deliveries) in &dead {
                warn!(
                    message_type = %message_type,
                    id,
                    doc_id = ?doc_id,
                    deliveries,
                    "Message exhausted its deliveries, moved to dead letters"
                );
            }
            metrics::record_dead_letters(message_type.as_str(), dead.len());
        }

        let Some((id, doc_id, payload, deliveries)) = leased else {
            return Ok(None);
        };

        let receipt = Receipt {
            message_type,
            id,
            delivery: deliveries_from(deliveries),
        };
        metrics::record_lease(message_type.as_str(), receipt.delivery);

        // A corrupt payload stays leased; it reappears after the visibility
        // window and is dead-lettered once it runs out of deliveries.
        let payload = decode_payload(&payload)?;

        debug!(receipt = %receipt, doc_id = ?doc_id, "Message leased");
        Ok(Some(Delivery {
            receipt,
            message: QueueMessage {
                message_type,
                doc_id,
                payload,
            },
        }))
    }

    async fn try_lease(
        &self,
        message_type: MessageType,
    ) -> std::result::Result<(Option<QueueRow>, Vec<QueueRow>), sqlx::Error> {
        let now = now_millis();
        let visible_at = now.saturating_add(millis(self.config.visibility_timeout_duration()));
        let max_deliveries = i64::from(self.config.max_deliveries);

        let mut tx = self.pool.begin().await?;

        let dead =
            dead_letter_exhausted(&mut tx, message_type, self.config.max_deliveries, now).await?;

        let leased: Option<QueueRow> = sqlx::query_as(
            r#"
            UPDATE replay_queue
            SET deliveries = deliveries + 1, visible_at = ?1
            WHERE id = (
                SELECT id FROM replay_queue
                WHERE message_type = ?2 AND visible_at <= ?3 AND deliveries < ?4
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, doc_id, payload, deliveries
            "#,
        )
        .bind(visible_at)
        .bind(message_type.as_str())
        .bind(now)
        .bind(max_deliveries)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((_, Some(doc_id), _, _)) = &leased {
            if let Some(index) = message_type.index() {
                sqlx::query(
                    "UPDATE replay_pending SET state = ?, updated_at = ? \
                     WHERE idx = ? AND doc_id = ?",
                )
                .bind(ReplayState::InTransit.as_str())
                .bind(now)
                .bind(index.as_str())
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok((leased, dead))
    }

    /// Acknowledge a leased message: it is removed for good.
    ///
    /// A tracked document acknowledged without completion loses its
    /// PendingRecord, so it may be admitted again later.
    pub async fn ack(&self, receipt: &Receipt) -> Result<()> {
        let message_type = receipt.message_type.require(SyncMode::Queue)?;

        let found = run("queue_ack", || self.try_ack(receipt)).await?;
        if !found {
            return Err(ReplayError::not_found("receipt", receipt.to_string()));
        }

        debug!(receipt = %receipt, "Message acknowledged");
        metrics::record_ack(message_type.as_str());
        Ok(())
    }

    async fn try_ack(&self, receipt: &Receipt) -> std::result::Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let deleted: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            DELETE FROM replay_queue
            WHERE id = ? AND message_type = ? AND deliveries = ?
            RETURNING doc_id
            "#,
        )
        .bind(receipt.id)
        .bind(receipt.message_type.as_str())
        .bind(i64::from(receipt.delivery))
        .fetch_optional(&mut *tx)
        .await?;

        let Some((doc_id,)) = deleted else {
            return Ok(false);
        };

        if let (Some(index), Some(doc_id)) = (receipt.message_type.index(), doc_id) {
            sqlx::query(
                r#"
                DELETE FROM replay_pending
                WHERE idx = ?1 AND doc_id = ?2
                  AND NOT EXISTS (
                      SELECT 1 FROM replay_queue WHERE message_type = ?1 AND doc_id = ?2
                  )
                "#,
            )
            .bind(index.as_str())
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Give a leased message back after a failed transfer.
    ///
    /// The message becomes visible again after the release backoff and its
    /// PendingRecord returns to Pending. A message on its last delivery goes
    /// straight to the dead-letter table.
    pub async fn release(&self, receipt: &Receipt) -> Result<()> {
        let message_type = receipt.message_type.require(SyncMode::Queue)?;

        let outcome = run("queue_release", || self.try_release(receipt)).await?;
        match outcome {
            None => Err(ReplayError::not_found("receipt", receipt.to_string())),
            Some(dead) if dead > 0 => {
                warn!(
                    receipt = %receipt,
                    max_deliveries = self.config.max_deliveries,
                    "Released message exhausted its deliveries, moved to dead letters"
                );
                metrics::record_release(message_type.as_str());
                metrics::record_dead_letters(message_type.as_str(), dead);
                Ok(())
            }
            Some(_) => {
                debug!(
                    receipt = %receipt,
                    backoff = ?self.config.release_backoff(receipt.delivery),
                    "Message released"
                );
                metrics::record_release(message_type.as_str());
                Ok(())
            }
        }
    }

    /// Returns `None` for a stale receipt, otherwise the number of messages
    /// dead-lettered as a consequence.
    async fn try_release(
        &self,
        receipt: &Receipt,
    ) -> std::result::Result<Option<usize>, sqlx::Error> {
        let now = now_millis();
        let exhausted = receipt.delivery >= self.config.max_deliveries;
        let visible_at = if exhausted {
            now
        } else {
            now.saturating_add(millis(self.config.release_backoff(receipt.delivery)))
        };

        let mut tx = self.pool.begin().await?;

        let updated: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            UPDATE replay_queue SET visible_at = ?
            WHERE id = ? AND message_type = ? AND deliveries = ?
            RETURNING doc_id
            "#,
        )
        .bind(visible_at)
        .bind(receipt.id)
        .bind(receipt.message_type.as_str())
        .bind(i64::from(receipt.delivery))
        .fetch_optional(&mut *tx)
        .await?;

        let Some((doc_id,)) = updated else {
            return Ok(None);
        };

        let dead = if exhausted {
            dead_letter_exhausted(
                &mut tx,
                receipt.message_type,
                self.config.max_deliveries,
                now,
            )
            .await?
            .len()
        } else {
            if let (Some(index), Some(doc_id)) = (receipt.message_type.index(), doc_id) {
                sqlx::query(
                    "UPDATE replay_pending SET state = ?, updated_at = ? \
                     WHERE idx = ? AND doc_id = ?",
                )
                .bind(ReplayState::Pending.as_str())
                .bind(now)
                .bind(index.as_str())
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
            }
            0
        };

        tx.commit().await?;
        Ok(Some(dead))
    }

    /// Revert expired leases and dead-letter exhausted messages for every
    /// queue-family type.
    pub async fn reap_expired(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for message_type in MessageType::queue_types() {
            let (reverted, dead) =
                run("queue_sweep", || self.try_reap(message_type)).await?;

            if !dead.is_empty() {
                warn!(
                    message_type = %message_type,
                    count = dead.len(),
                    "Expired messages exhausted their deliveries, moved to dead letters"
                );
                metrics::record_dead_letters(message_type.as_str(), dead.len());
            }
            if reverted > 0 {
                debug!(
                    message_type = %message_type,
                    reverted,
                    "Expired leases reverted to pending"
                );
            }

            report.reverted += reverted;
            report.dead_lettered += dead.len();
        }

        Ok(report)
    }

    async fn try_reap(
        &self,
        message_type: MessageType,
    ) -> std::result::Result<(usize, Vec<QueueRow>), sqlx::Error> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let dead =
            dead_letter_exhausted(&mut tx, message_type, self.config.max_deliveries, now).await?;

        let reverted = match message_type.index() {
            Some(index) => sqlx::query(
                r#"
                UPDATE replay_pending SET state = ?1, updated_at = ?2
                WHERE idx = ?3 AND state = ?4
                  AND doc_id IN (
                      SELECT doc_id FROM replay_queue
                      WHERE message_type = ?3 AND visible_at <= ?2 AND deliveries > 0
                  )
                "#,
            )
            .bind(ReplayState::Pending.as_str())
            .bind(now)
            .bind(index.as_str())
            .bind(ReplayState::InTransit.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize,
            None => 0,
        };

        tx.commit().await?;
        Ok((reverted, dead))
    }

    /// List dead letters for a type, oldest first.
    pub async fn dead_letters(&self, message_type: MessageType) -> Result<Vec<DeadLetter>> {
        let message_type = message_type.require(SyncMode::Queue)?;
        let pool = &self.pool;

        let rows: Vec<(i64, Option<String>, Vec<u8>, i64, i64)> = run("dead_letters", || async {
            sqlx::query_as(
                r#"
                SELECT id, doc_id, payload, deliveries, dead_at
                FROM replay_dead_letters WHERE message_type = ? ORDER BY id
                "#,
            )
            .bind(message_type.as_str())
            .fetch_all(pool)
            .await
        })
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, doc_id, payload, deliveries, dead_at)| {
                // One undecodable row must not hide the rest of the listing
                let (payload, decode_error) = match decode_payload(&payload) {
                    Ok(payload) => (payload, None),
                    Err(e) => {
                        warn!(
                            message_type = %message_type,
                            id,
                            doc_id = ?doc_id,
                            error = %e,
                            "Dead letter payload cannot be decoded"
                        );
                        (serde_json::Value::Null, Some(e.to_string()))
                    }
                };
                DeadLetter {
                    id,
                    message: QueueMessage {
                        message_type,
                        doc_id,
                        payload,
                    },
                    deliveries: deliveries_from(deliveries),
                    dead_at,
                    decode_error,
                }
            })
            .collect())
    }

    /// Put every dead letter of `message_type` back on the queue with a
    /// fresh delivery count.
    ///
    /// Tracked documents that were completed, or admitted again, in the
    /// meantime are discarded instead. Returns the number of messages requeued.
    pub async fn requeue_dead_letters(&self, message_type: MessageType) -> Result<usize> {
        let message_type = message_type.require(SyncMode::Queue)?;

        let (requeued, superseded) =
            run("dead_letters_requeue", || self.try_requeue(message_type)).await?;

        if requeued > 0 || superseded > 0 {
            info!(
                message_type = %message_type,
                requeued,
                superseded,
                "Dead letters requeued"
            );
            metrics::record_requeued(message_type.as_str(), requeued);
        }
        Ok(requeued)
    }

    /// Returns `(requeued, superseded)`.
    async fn try_requeue(
        &self,
        message_type: MessageType,
    ) -> std::result::Result<(usize, usize), sqlx::Error> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(Option<String>, Vec<u8>)> = sqlx::query_as(
            "DELETE FROM replay_dead_letters WHERE message_type = ? RETURNING doc_id, payload",
        )
        .bind(message_type.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut requeued = 0;
        let mut superseded = 0;
        for (doc_id, payload) in rows {
            if let (Some(index), Some(doc_id)) = (message_type.index(), doc_id.as_deref()) {
                // Same guard as admission: a document already completed, or
                // admitted again since it was dead-lettered, keeps its record.
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
                    superseded += 1;
                    continue;
                }
            }

            insert_message(&mut tx, message_type, doc_id.as_deref(), &payload, now).await?;
            requeued += 1;
        }

        tx.commit().await?;
        Ok((requeued, superseded))
    }

    /// Queue counters for one type. Also updates the depth gauges.
    pub async fn stats(&self, message_type: MessageType) -> Result<QueueStats> {
        let message_type = message_type.require(SyncMode::Queue)?;
        let pool = &self.pool;
        let now = now_millis();

        let (ready, in_flight, dead): (i64, i64, i64) = run("queue_stats", || async {
            sqlx::query_as(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM replay_queue
                        WHERE message_type = ?1 AND visible_at <= ?2),
                    (SELECT COUNT(*) FROM replay_queue
                        WHERE message_type = ?1 AND visible_at > ?2),
                    (SELECT COUNT(*) FROM replay_dead_letters WHERE message_type = ?1)
                "#,
            )
            .bind(message_type.as_str())
            .bind(now)
            .fetch_one(pool)
            .await
        })
        .await?;

        let stats = QueueStats {
            ready: ready.max(0) as u64,
            in_flight: in_flight.max(0) as u64,
            dead: dead.max(0) as u64,
        };
        metrics::set_queue_depth(message_type.as_str(), stats.ready, stats.in_flight, stats.dead);
        Ok(stats)
    }
}
