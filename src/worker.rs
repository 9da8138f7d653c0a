// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reference worker loops.
//!
//! The engine never retries on a caller's behalf. These loops are the
//! caller side: they poll the engine, move data to a destination and report
//! the outcome back, backing off while idle or failing.
//!
//! # Queue family
//!
//! ```text
//! get_message ──→ request / fetch_file ──→ Destination ──→ set_complete (alert, submission)
//!                        │                      │           ack_message  (file, untracked)
//!                        │ gone at source       │ failed
//!                        ↓                      ↓
//!                   ack_message (drop)     release_message
//! ```
//!
//! # Cursor family
//!
//! ```text
//! get_checkpoint ──→ ReferenceSource::records_after ──→ ReferenceSink::apply
//!                                                            │
//!                                              applied ┌─────┴─────┐ failed
//!                                                      ↓           ↓
//!                                     advance_checkpoint   checkpoint untouched
//! ```
//!
//! The checkpoint only moves after the sink has applied the batch, so a crash
//! between the two re-applies the batch on the next round.

use crate::checkpoint::Watermark;
use crate::coordinator::ReplayEngine;
use crate::error::{ReplayError, Result};
use crate::message::{Delivery, Index, MessageType, QueueMessage, SyncMode};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::source::{ArtifactStore, BoxFuture, DocumentStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

// ═══════════════════════════════════════════════════════════════════════════════
// Collaborator traits
// ═══════════════════════════════════════════════════════════════════════════════

/// Receiving side of the queue family (the destination deployment).
pub trait Destination: Send + Sync + 'static {
    /// Store a tracked document.
    fn deliver_document<'a>(
        &'a self,
        index: Index,
        doc_id: &'a str,
        document: &'a Value,
    ) -> BoxFuture<'a, ()>;

    /// Store file content.
    fn deliver_file<'a>(&'a self, sha256: &'a str, content: &'a [u8]) -> BoxFuture<'a, ()>;

    /// Store a message that carries its own payload and no fetchable identity.
    fn deliver_message<'a>(&'a self, message: &'a QueueMessage) -> BoxFuture<'a, ()>;
}

/// One reference-data record at a position in its stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub watermark: Watermark,
    pub payload: Value,
}

impl ReferenceRecord {
    pub fn new(watermark: impl Into<String>, payload: Value) -> Self {
        Self {
            watermark: Watermark::At(watermark.into()),
            payload,
        }
    }
}

/// Source of cursor-family records.
pub trait ReferenceSource: Send + Sync + 'static {
    /// Up to `limit` records positioned strictly after `after`, in watermark order.
    fn records_after<'a>(
        &'a self,
        message_type: MessageType,
        after: &'a Watermark,
        limit: usize,
    ) -> BoxFuture<'a, Vec<ReferenceRecord>>;
}

/// Destination of cursor-family records. Applying a batch twice must be harmless.
pub trait ReferenceSink: Send + Sync + 'static {
    fn apply<'a>(
        &'a self,
        message_type: MessageType,
        records: &'a [ReferenceRecord],
    ) -> BoxFuture<'a, ()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue family
// ═══════════════════════════════════════════════════════════════════════════════

/// What `process_one` did with the message it leased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing was visible.
    Idle,
    /// Delivered and marked complete.
    Completed { index: Index, doc_id: String },
    /// Delivered and acknowledged.
    Acknowledged,
    /// Gone at the source; acknowledged without delivery.
    Dropped,
    /// Transfer failed; the message was released for redelivery.
    Released { reason: String },
}

impl WorkOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkOutcome::Idle => "idle",
            WorkOutcome::Completed { .. } => "completed",
            WorkOutcome::Acknowledged => "acknowledged",
            WorkOutcome::Dropped => "dropped",
            WorkOutcome::Released { .. } => "released",
        }
    }

    /// Whether the loop should back off before polling again.
    fn backs_off(&self) -> bool {
        matches!(self, WorkOutcome::Idle | WorkOutcome::Released { .. })
    }
}

/// Counters returned when a queue worker loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub completed: u64,
    pub acknowledged: u64,
    pub dropped: u64,
    pub released: u64,
    pub errors: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &WorkOutcome) {
        match outcome {
            WorkOutcome::Idle => {}
            WorkOutcome::Completed { .. } => self.completed += 1,
            WorkOutcome::Acknowledged => self.acknowledged += 1,
            WorkOutcome::Dropped => self.dropped += 1,
            WorkOutcome::Released { .. } => self.released += 1,
        }
    }
}

/// Lease one message of `message_type` and carry it to `destination`.
///
/// Transfer failures are reported to the engine with `release_message` and
/// come back as [`WorkOutcome::Released`]. Only failures of the engine's own
/// calls are returned as errors.
pub async fn process_one<D, A, T>(
    engine: &ReplayEngine<D, A>,
    message_type: MessageType,
    destination: &T,
) -> Result<WorkOutcome>
where
    D: DocumentStore,
    A: ArtifactStore,
    T: Destination + ?Sized,
{
    message_type.require(SyncMode::Queue)?;

    let Some(delivery) = engine.get_message(message_type).await? else {
        return Ok(WorkOutcome::Idle);
    };

    if delivery.is_redelivery() {
        debug!(receipt = %delivery.receipt, "Processing redelivered message");
    }

    let outcome = match (delivery.message.tracked_key(), message_type) {
        (Some((index, doc_id)), _) => {
            let doc_id = doc_id.to_string();
            transfer_document(engine, &delivery, index, doc_id, destination).await?
        }
        (None, MessageType::File) if delivery.message.doc_id.is_some() => {
            transfer_file(engine, &delivery, destination).await?
        }
        (None, _) => match destination.deliver_message(&delivery.message).await {
            Ok(()) => {
                engine.ack_message(&delivery.receipt).await?;
                WorkOutcome::Acknowledged
            }
            Err(e) => release(engine, &delivery, e.to_string()).await?,
        },
    };

    metrics::record_worker_outcome(message_type.as_str(), outcome.as_str());
    Ok(outcome)
}

async fn transfer_document<D, A, T>(
    engine: &ReplayEngine<D, A>,
    delivery: &Delivery,
    index: Index,
    doc_id: String,
    destination: &T,
) -> Result<WorkOutcome>
where
    D: DocumentStore,
    A: ArtifactStore,
    T: Destination + ?Sized,
{
    let document = match engine.request(index, &doc_id).await {
        Ok(document) => document,
        Err(e) if e.is_not_found() => {
            warn!(
                index = %index,
                doc_id = %doc_id,
                "Document no longer exists at source, dropping"
            );
            engine.ack_message(&delivery.receipt).await?;
            return Ok(WorkOutcome::Dropped);
        }
        Err(e) if e.is_retryable() => return release(engine, delivery, e.to_string()).await,
        Err(e) => return Err(e),
    };

    if let Err(e) = destination.deliver_document(index, &doc_id, &document).await {
        return release(engine, delivery, e.to_string()).await;
    }

    engine.set_complete(index, &doc_id).await?;
    debug!(index = %index, doc_id = %doc_id, "Document transferred");
    Ok(WorkOutcome::Completed { index, doc_id })
}

async fn transfer_file<D, A, T>(
    engine: &ReplayEngine<D, A>,
    delivery: &Delivery,
    destination: &T,
) -> Result<WorkOutcome>
where
    D: DocumentStore,
    A: ArtifactStore,
    T: Destination + ?Sized,
{
    let sha256 = delivery.message.doc_id.as_deref().unwrap_or_default();

    let content = match engine.fetch_file(sha256).await {
        Ok(content) => content,
        Err(e) if e.is_not_found() => {
            warn!(sha256, "File no longer exists at source, dropping");
            engine.ack_message(&delivery.receipt).await?;
            return Ok(WorkOutcome::Dropped);
        }
        // Integrity failures are released too: a later fetch may succeed,
        // and a persistent mismatch ends in the dead-letter table.
        Err(e @ (ReplayError::TransientStoreFailure { .. } | ReplayError::Integrity { .. })) => {
            return release(engine, delivery, e.to_string()).await
        }
        Err(e) => return Err(e),
    };

    if let Err(e) = destination.deliver_file(sha256, &content).await {
        return release(engine, delivery, e.to_string()).await;
    }

    engine.ack_message(&delivery.receipt).await?;
    debug!(sha256, bytes = content.len(), "File transferred");
    Ok(WorkOutcome::Acknowledged)
}

async fn release<D: DocumentStore, A: ArtifactStore>(
    engine: &ReplayEngine<D, A>,
    delivery: &Delivery,
    reason: String,
) -> Result<WorkOutcome> {
    warn!(receipt = %delivery.receipt, reason = %reason, "Transfer failed, releasing message");
    engine.release_message(&delivery.receipt).await?;
    Ok(WorkOutcome::Released { reason })
}

/// Sleep for `delay`. Returns `true` if shutdown was signalled meanwhile.
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown_rx.borrow(),
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}

/// Whether an error means the engine stopped serving.
fn is_terminal(e: &ReplayError) -> bool {
    matches!(e, ReplayError::Shutdown | ReplayError::InvalidState { .. })
}

/// Run `process_one` until shutdown is signalled or the engine stops.
///
/// Busy rounds poll again immediately. Idle and failed rounds back off along
/// `retry`, resetting once a message goes through.
pub async fn run_queue_worker<D, A, T>(
    engine: &ReplayEngine<D, A>,
    message_type: MessageType,
    destination: &T,
    retry: RetryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> WorkerStats
where
    D: DocumentStore,
    A: ArtifactStore,
    T: Destination + ?Sized,
{
    let span = info_span!("queue_worker", message_type = %message_type);

    async move {
        info!("Starting queue worker");
        let mut stats = WorkerStats::default();
        let mut quiet_rounds = 0usize;

        while !*shutdown_rx.borrow() {
            let backs_off = match process_one(engine, message_type, destination).await {
                Ok(outcome) => {
                    stats.record(&outcome);
                    outcome.backs_off()
                }
                Err(e) if is_terminal(&e) => {
                    info!(error = %e, "Engine not serving, queue worker exiting");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Queue worker round failed");
                    stats.errors += 1;
                    true
                }
            };

            if !backs_off {
                quiet_rounds = 0;
                continue;
            }

            quiet_rounds += 1;
            if !retry.should_retry(quiet_rounds) {
                warn!(
                    rounds = quiet_rounds,
                    "Queue worker giving up after repeated empty or failed rounds"
                );
                break;
            }
            if sleep_or_shutdown(retry.delay_for_attempt(quiet_rounds), &mut shutdown_rx).await {
                break;
            }
        }

        info!(
            completed = stats.completed,
            acknowledged = stats.acknowledged,
            dropped = stats.dropped,
            released = stats.released,
            errors = stats.errors,
            "Queue worker stopped"
        );
        stats
    }
    .instrument(span)
    .await
}

/// Run one queue worker per queue-family type, concurrently, until shutdown.
pub async fn run_queue_workers<D, A, T>(
    engine: &ReplayEngine<D, A>,
    destination: &T,
    retry: RetryConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<(MessageType, WorkerStats)>
where
    D: DocumentStore,
    A: ArtifactStore,
    T: Destination + ?Sized,
{
    let workers = MessageType::queue_types().map(|message_type| {
        let retry = retry.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            let stats =
                run_queue_worker(engine, message_type, destination, retry, shutdown_rx).await;
            (message_type, stats)
        }
    });
    futures::future::join_all(workers).await
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cursor family
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of one `sync_once` round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub message_type: MessageType,
    /// Records applied this round.
    pub applied: usize,
    /// Checkpoint before the round.
    pub from: Watermark,
    /// Checkpoint after the round (equal to `from` when nothing was applied).
    pub to: Watermark,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.applied == 0
    }
}

/// Pull one batch after the checkpoint, apply it, then advance.
///
/// If the sink fails the checkpoint is left where it was and the error is
/// returned as `TransientStoreFailure`.
pub async fn sync_once<D, A, S, K>(
    engine: &ReplayEngine<D, A>,
    message_type: MessageType,
    source: &S,
    sink: &K,
    batch_size: usize,
) -> Result<SyncReport>
where
    D: DocumentStore,
    A: ArtifactStore,
    S: ReferenceSource + ?Sized,
    K: ReferenceSink + ?Sized,
{
    message_type.require(SyncMode::Cursor)?;
    let start = Instant::now();

    let from = engine.get_checkpoint(message_type).await?;

    let mut records = source
        .records_after(message_type, &from, batch_size.max(1))
        .await
        .map_err(|e| ReplayError::transient("reference_fetch", e.0))?;
    // Anything at or behind the checkpoint was already applied
    records.retain(|r| r.watermark > from);

    let Some(highest) = records.iter().map(|r| r.watermark.clone()).max() else {
        metrics::record_cursor_sync(message_type.as_str(), 0, start.elapsed());
        return Ok(SyncReport {
            message_type,
            applied: 0,
            to: from.clone(),
            from,
        });
    };

    sink.apply(message_type, &records)
        .await
        .map_err(|e| ReplayError::transient("reference_apply", e.0))?;

    engine.advance_checkpoint(message_type, &highest).await?;
    let to = engine.get_checkpoint(message_type).await?;

    debug!(
        message_type = %message_type,
        applied = records.len(),
        from = %from,
        to = %to,
        "Reference batch applied"
    );
    metrics::record_cursor_sync(message_type.as_str(), records.len(), start.elapsed());

    Ok(SyncReport {
        message_type,
        applied: records.len(),
        from,
        to,
    })
}

/// Run `sync_once` until shutdown is signalled or the engine stops.
///
/// A full batch means the source is ahead, so the next round starts at once.
/// Short, empty and failed rounds back off along `retry`. Returns the total
/// number of records applied.
pub async fn run_cursor_sync<D, A, S, K>(
    engine: &ReplayEngine<D, A>,
    message_type: MessageType,
    source: &S,
    sink: &K,
    batch_size: usize,
    retry: RetryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> u64
where
    D: DocumentStore,
    A: ArtifactStore,
    S: ReferenceSource + ?Sized,
    K: ReferenceSink + ?Sized,
{
    let span = info_span!("cursor_sync", message_type = %message_type);

    async move {
        info!(batch_size, "Starting cursor sync");
        let mut applied = 0u64;
        let mut quiet_rounds = 0usize;

        while !*shutdown_rx.borrow() {
            let caught_up = match sync_once(engine, message_type, source, sink, batch_size).await {
                Ok(report) => {
                    applied += report.applied as u64;
                    report.applied < batch_size
                }
                Err(e) if is_terminal(&e) => {
                    info!(error = %e, "Engine not serving, cursor sync exiting");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Cursor sync round failed, checkpoint unchanged");
                    true
                }
            };

            if !caught_up {
                quiet_rounds = 0;
                continue;
            }

            quiet_rounds = quiet_rounds.saturating_add(1);
            if !retry.should_retry(quiet_rounds) {
                break;
            }
            if sleep_or_shutdown(retry.delay_for_attempt(quiet_rounds), &mut shutdown_rx).await {
                break;
            }
        }

        info!(applied, "Cursor sync stopped");
        applied
    }
    .instrument(span)
    .await
}
