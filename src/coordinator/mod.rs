// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay engine coordinator.
//!
//! The single entry point that ties together:
//! - Watermarks via [`crate::checkpoint::CheckpointStore`] (cursor family)
//! - Admission via [`crate::selector::PendingSelector`] (queue family)
//! - Leasing via [`crate::queue::TransferQueue`]
//! - Completion via [`crate::completion::CompletionTracker`]
//! - Source access via [`crate::source::SourceClient`]
//!
//! # Routing
//!
//! Every operation names a [`MessageType`]. Cursor-family types
//! (`badlist`, `safelist`, `workflow`) only accept checkpoint operations;
//! queue-family types (`alert`, `submission`, `file`) only accept queue
//! operations. Crossing families fails with `InvalidMessageType` before any
//! state is read or written.
//!
//! # Lifecycle
//!
//! 1. `new()` / `with_sources()`: nothing opened yet
//! 2. `start()`: validates config, opens the replay store, spawns the sweeper
//! 3. operations are served while `Running`
//! 4. `shutdown()`: stops the sweeper, checkpoints the WAL, closes the store
//!
//! The engine holds no replay state in memory. Several engines (in one
//! process or several) may share one store file.

mod sweeper;
mod types;

pub use types::{EngineState, HealthCheck, QueueHealth};

use crate::checkpoint::{Checkpoint, CheckpointStore, Watermark};
use crate::circuit_breaker::SourceCircuit;
use crate::completion::{CompletionOutcome, CompletionTracker, TransferRecord};
use crate::config::ReplayConfig;
use crate::error::{ReplayError, Result};
use crate::message::{Delivery, Index, MessageType, QueueMessage, Receipt, SyncMode};
use crate::metrics;
use crate::queue::{DeadLetter, QueueStats, SweepReport, TransferQueue};
use crate::resilience::RateLimiter;
use crate::selector::{PendingSelector, ReplayState};
use crate::source::{
    ArtifactStore, DocumentStore, MemoryArtifactStore, MemoryDocumentStore, SourceClient,
};
use crate::store::ReplayStore;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time allowed for background tasks to stop during shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Components bound to an open store.
#[derive(Clone)]
struct Components {
    store: ReplayStore,
    checkpoints: CheckpointStore,
    selector: PendingSelector,
    queue: TransferQueue,
    completion: CompletionTracker,
}

impl Components {
    fn new(store: ReplayStore, config: &ReplayConfig) -> Self {
        let pool = store.pool().clone();
        Self {
            checkpoints: CheckpointStore::new(pool.clone()),
            selector: PendingSelector::new(pool.clone(), config.queue.compress_threshold_bytes),
            queue: TransferQueue::new(pool.clone(), config.queue.clone()),
            completion: CompletionTracker::new(pool),
            store,
        }
    }
}

/// Record the error metric for a failed operation and pass the result on.
fn observe<T>(operation: &'static str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        metrics::record_error(operation, e.kind());
    }
    result
}

/// The replay engine.
///
/// Generic over the source collaborators so deployments plug in their own
/// document and artifact stores. The defaults are the in-memory stores.
pub struct ReplayEngine<
    D: DocumentStore = MemoryDocumentStore,
    A: ArtifactStore = MemoryArtifactStore,
> {
    config: ReplayConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Circuit-broken access to the document and artifact stores
    source: SourceClient<D, A>,

    /// Present between `start()` and `shutdown()`
    components: RwLock<Option<Components>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Background task handles
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl ReplayEngine<MemoryDocumentStore, MemoryArtifactStore> {
    /// Create an engine backed by empty in-memory source stores.
    ///
    /// Populate them through [`source()`](Self::source).
    pub fn new(config: ReplayConfig) -> Self {
        Self::with_sources(config, MemoryDocumentStore::new(), MemoryArtifactStore::new())
    }
}

impl<D: DocumentStore, A: ArtifactStore> ReplayEngine<D, A> {
    /// Create an engine over the given source collaborators.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// before issuing operations.
    pub fn with_sources(config: ReplayConfig, documents: D, artifacts: A) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let circuits = SourceCircuit::with_config(config.source.circuit_config());
        let limiter = config.source.rate_limit_config().map(RateLimiter::new);
        let source = SourceClient::new(documents, artifacts, circuits, limiter);

        Self {
            config,
            state_tx,
            state_rx,
            source,
            components: RwLock::new(None),
            shutdown_tx,
            shutdown_rx,
            handles: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// The guarded source collaborators.
    pub fn source(&self) -> &SourceClient<D, A> {
        &self.source
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Open components, or fail if the engine is not serving.
    async fn components(&self) -> Result<Components> {
        match self.state() {
            EngineState::Running => {}
            EngineState::ShuttingDown => return Err(ReplayError::Shutdown),
            other => {
                return Err(ReplayError::InvalidState {
                    expected: "Running".to_string(),
                    actual: other.to_string(),
                })
            }
        }

        self.components
            .read()
            .await
            .clone()
            .ok_or(ReplayError::Shutdown)
    }

    fn require_running(&self) -> Result<()> {
        match self.state() {
            EngineState::Running => Ok(()),
            EngineState::ShuttingDown => Err(ReplayError::Shutdown),
            other => Err(ReplayError::InvalidState {
                expected: "Running".to_string(),
                actual: other.to_string(),
            }),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start the engine.
    ///
    /// 1. Validates configuration
    /// 2. Opens the replay store (creating the schema if needed)
    /// 3. Spawns the lease sweeper
    pub async fn start(&self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplayError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        self.config.validate()?;

        info!(
            instance_id = %self.config.instance_id,
            path = %self.config.store.sqlite_path,
            "Starting replay engine"
        );
        self.set_state(EngineState::Starting);

        let store = match ReplayStore::open(&self.config.store).await {
            Ok(store) => store,
            Err(e) => {
                error!(error = %e, "Failed to open replay store");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        let components = Components::new(store, &self.config);
        let sweeper = sweeper::spawn_sweeper(
            components.queue.clone(),
            self.config.queue.sweep_interval(),
            self.shutdown_rx.clone(),
        );
        self.handles.write().await.push(sweeper);
        *self.components.write().await = Some(components);

        self.set_state(EngineState::Running);
        info!(instance_id = %self.config.instance_id, "Replay engine running");
        Ok(())
    }

    /// Shut the engine down gracefully.
    ///
    /// 1. Signals background tasks to stop and waits for them (with timeout)
    /// 2. Checkpoints the WAL and closes the store
    ///
    /// Safe to call from any state.
    pub async fn shutdown(&self) {
        info!(instance_id = %self.config.instance_id, "Shutting down replay engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        // Close store (includes WAL checkpoint)
        if let Some(components) = self.components.write().await.take() {
            components.store.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!("Replay engine stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Cursor family: checkpoints
    // ═══════════════════════════════════════════════════════════════════════════

    /// Current watermark for a cursor-family type.
    ///
    /// [`Watermark::Beginning`] if none was ever stored.
    pub async fn get_checkpoint(&self, message_type: MessageType) -> Result<Watermark> {
        let result = async {
            message_type.require(SyncMode::Cursor)?;
            self.components().await?.checkpoints.get(message_type).await
        }
        .await;
        observe("get_checkpoint", result)
    }

    /// Full checkpoint row, including its last write time.
    pub async fn checkpoint_entry(&self, message_type: MessageType) -> Result<Checkpoint> {
        let result = async {
            message_type.require(SyncMode::Cursor)?;
            self.components().await?.checkpoints.get_entry(message_type).await
        }
        .await;
        observe("get_checkpoint", result)
    }

    /// Set the watermark unconditionally. `"*"` resets it to the beginning;
    /// a blank value is rejected with `InvalidWatermark`.
    pub async fn put_checkpoint(&self, message_type: MessageType, watermark: &str) -> Result<()> {
        let result = async {
            message_type.require(SyncMode::Cursor)?;
            let watermark: Watermark = watermark.parse()?;
            self.components()
                .await?
                .checkpoints
                .put(message_type, &watermark)
                .await
        }
        .await;
        observe("put_checkpoint", result)
    }

    /// Move the watermark forward only. Returns `true` if it moved.
    pub async fn advance_checkpoint(
        &self,
        message_type: MessageType,
        watermark: &Watermark,
    ) -> Result<bool> {
        let result = async {
            message_type.require(SyncMode::Cursor)?;
            self.components()
                .await?
                .checkpoints
                .advance(message_type, watermark)
                .await
        }
        .await;
        observe("advance_checkpoint", result)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queue family: admission, leasing, completion
    // ═══════════════════════════════════════════════════════════════════════════

    /// Search `index` and admit up to `max_docs` documents not yet tracked.
    ///
    /// Returns the number newly admitted. Repeating the call with the same
    /// arguments admits only documents that were not admitted before.
    pub async fn set_bulk_pending(
        &self,
        index: Index,
        query: &str,
        filter_queries: &[String],
        max_docs: usize,
    ) -> Result<usize> {
        let result = async {
            let components = self.components().await?;
            components
                .selector
                .set_bulk_pending(&self.source, index, query, filter_queries, max_docs)
                .await
        }
        .await;
        observe("set_bulk_pending", result)
    }

    /// Lease the next visible message of a queue-family type.
    ///
    /// Non-blocking: `Ok(None)` when nothing is available.
    pub async fn get_message(&self, message_type: MessageType) -> Result<Option<Delivery>> {
        let result = async {
            message_type.require(SyncMode::Queue)?;
            self.components().await?.queue.lease(message_type).await
        }
        .await;
        observe("get_message", result)
    }

    /// Enqueue a message directly. The document id is taken from the payload.
    pub async fn put_message(&self, message_type: MessageType, payload: Value) -> Result<i64> {
        let result = async {
            message_type.require(SyncMode::Queue)?;
            let message = QueueMessage::new(message_type, payload);
            self.components().await?.queue.put(&message).await
        }
        .await;
        observe("put_message", result)
    }

    /// Acknowledge a leased message without completing a document.
    pub async fn ack_message(&self, receipt: &Receipt) -> Result<()> {
        let result = async { self.components().await?.queue.ack(receipt).await }.await;
        observe("ack_message", result)
    }

    /// Report a failed transfer. The message is redelivered after a backoff.
    pub async fn release_message(&self, receipt: &Receipt) -> Result<()> {
        let result = async { self.components().await?.queue.release(receipt).await }.await;
        observe("release_message", result)
    }

    /// Mark a document as transferred. Safe to repeat.
    pub async fn set_complete(&self, index: Index, doc_id: &str) -> Result<CompletionOutcome> {
        let result = async {
            self.components()
                .await?
                .completion
                .set_complete(index, doc_id)
                .await
        }
        .await;
        observe("set_complete", result)
    }

    /// Tracking state of a document, or `None` if never admitted or completed.
    pub async fn replay_state(&self, index: Index, doc_id: &str) -> Result<Option<ReplayState>> {
        let result = async {
            self.components()
                .await?
                .selector
                .replay_state(index, doc_id)
                .await
        }
        .await;
        observe("replay_state", result)
    }

    /// The TransferRecord of a completed document.
    pub async fn transfer_record(
        &self,
        index: Index,
        doc_id: &str,
    ) -> Result<Option<TransferRecord>> {
        let result = async {
            self.components()
                .await?
                .completion
                .transfer_record(index, doc_id)
                .await
        }
        .await;
        observe("transfer_record", result)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Source access
    // ═══════════════════════════════════════════════════════════════════════════

    /// Fetch a document from the source document store.
    pub async fn request(&self, index: Index, doc_id: &str) -> Result<Value> {
        let result = async {
            self.require_running()?;
            self.source.get(index, doc_id).await
        }
        .await;
        observe("request", result)
    }

    /// Fetch file content and verify it hashes to `sha256`.
    pub async fn fetch_file(&self, sha256: &str) -> Result<Vec<u8>> {
        let result = async {
            self.require_running()?;
            self.source.fetch(sha256).await
        }
        .await;
        observe("fetch_file", result)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Operator surface
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn queue_stats(&self, message_type: MessageType) -> Result<QueueStats> {
        let result = async {
            message_type.require(SyncMode::Queue)?;
            self.components().await?.queue.stats(message_type).await
        }
        .await;
        observe("queue_stats", result)
    }

    pub async fn dead_letters(&self, message_type: MessageType) -> Result<Vec<DeadLetter>> {
        let result = async {
            message_type.require(SyncMode::Queue)?;
            self.components().await?.queue.dead_letters(message_type).await
        }
        .await;
        observe("dead_letters", result)
    }

    /// Put dead letters back on the queue. Returns how many were requeued.
    pub async fn requeue_dead_letters(&self, message_type: MessageType) -> Result<usize> {
        let result = async {
            message_type.require(SyncMode::Queue)?;
            self.components()
                .await?
                .queue
                .requeue_dead_letters(message_type)
                .await
        }
        .await;
        observe("requeue_dead_letters", result)
    }

    /// Run one sweep now instead of waiting for the sweeper.
    pub async fn reap_expired(&self) -> Result<SweepReport> {
        let result = async { self.components().await?.queue.reap_expired().await }.await;
        observe("reap_expired", result)
    }

    /// Health snapshot for monitoring endpoints.
    ///
    /// Contains:
    /// - Engine state and readiness
    /// - Source circuit breaker state
    /// - Per-type queue depth (queried from the store)
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let health = engine.health_check().await;
    ///
    /// // For /ready endpoint
    /// if health.ready {
    ///     HttpResponse::Ok()
    /// } else {
    ///     HttpResponse::ServiceUnavailable()
    /// }
    ///
    /// // For /health endpoint (full diagnostics)
    /// HttpResponse::Ok().json(&health)
    /// ```
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let circuits = self.source.circuits().snapshot();
        let components = self.components.read().await.clone();

        let mut queues = Vec::new();
        let mut store_error = None;
        if let (EngineState::Running, Some(components)) = (state, components) {
            for message_type in MessageType::queue_types() {
                match components.queue.stats(message_type).await {
                    Ok(stats) => queues.push(QueueHealth {
                        message_type,
                        stats,
                    }),
                    Err(e) => {
                        store_error = Some(e.to_string());
                        break;
                    }
                }
            }
        }

        let ready = state == EngineState::Running && store_error.is_none();
        let healthy = ready && !self.source.circuits().any_open();

        HealthCheck {
            state,
            ready,
            healthy,
            instance_id: self.config.instance_id.clone(),
            circuits,
            queues,
            store_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplayError;
    use serde_json::json;

    fn test_config() -> ReplayConfig {
        ReplayConfig::for_testing("replay.test.engine")
    }

    async fn running_engine() -> ReplayEngine {
        let engine = ReplayEngine::new(test_config());
        engine.start().await.unwrap();
        engine
    }

    #[test]
    fn test_engine_initial_state() {
        let engine = ReplayEngine::new(test_config());

        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
        assert_eq!(engine.config().instance_id, "replay.test.engine");
    }

    #[test]
    fn test_engine_state_receiver() {
        let engine = ReplayEngine::new(test_config());
        let state_rx = engine.state_receiver();
        assert_eq!(*state_rx.borrow(), EngineState::Created);
    }

    #[tokio::test]
    async fn test_engine_start_and_shutdown() {
        let engine = ReplayEngine::new(test_config());
        let mut state_rx = engine.state_receiver();

        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(state_rx.has_changed().unwrap());
        assert_eq!(*state_rx.borrow_and_update(), EngineState::Running);

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_engine_start_invalid_state() {
        let engine = running_engine().await;

        let result = engine.start().await;
        if let Err(ReplayError::InvalidState { expected, actual }) = result {
            assert_eq!(expected, "Created");
            assert_eq!(actual, "Running");
        } else {
            panic!("Expected InvalidState error");
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_start_rejects_invalid_config() {
        let mut config = test_config();
        config.instance_id = " ".to_string();
        let engine = ReplayEngine::new(config);

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, ReplayError::Config(_)));
        assert_eq!(engine.state(), EngineState::Created);
    }

    #[tokio::test]
    async fn test_engine_start_fails_on_unopenable_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        // A directory that does not exist cannot hold the database file
        config.store.sqlite_path = dir
            .path()
            .join("missing")
            .join("replay.db")
            .to_string_lossy()
            .to_string();
        let engine = ReplayEngine::new(config);

        assert!(engine.start().await.is_err());
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_engine_shutdown_from_created() {
        let engine = ReplayEngine::new(test_config());
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_operations_before_start_rejected() {
        let engine = ReplayEngine::new(test_config());

        let err = engine.get_checkpoint(MessageType::Badlist).await.unwrap_err();
        assert!(matches!(err, ReplayError::InvalidState { .. }));
        let err = engine.request(Index::Alert, "a1").await.unwrap_err();
        assert!(matches!(err, ReplayError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_rejected() {
        let engine = running_engine().await;
        engine.shutdown().await;

        let err = engine.get_message(MessageType::Alert).await.unwrap_err();
        assert!(matches!(err, ReplayError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_family_routing() {
        let engine = running_engine().await;

        let err = engine.get_checkpoint(MessageType::Alert).await.unwrap_err();
        assert!(matches!(err, ReplayError::InvalidMessageType { .. }));
        let err = engine.put_checkpoint(MessageType::File, "x").await.unwrap_err();
        assert!(matches!(err, ReplayError::InvalidMessageType { .. }));
        let err = engine.get_message(MessageType::Badlist).await.unwrap_err();
        assert!(matches!(err, ReplayError::InvalidMessageType { .. }));
        let err = engine
            .put_message(MessageType::Workflow, json!({"id": "w"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::InvalidMessageType { .. }));
        let err = engine.queue_stats(MessageType::Safelist).await.unwrap_err();
        assert!(matches!(err, ReplayError::InvalidMessageType { .. }));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip_and_reset() {
        let engine = running_engine().await;

        assert_eq!(
            engine.get_checkpoint(MessageType::Badlist).await.unwrap(),
            Watermark::Beginning
        );
        engine
            .put_checkpoint(MessageType::Badlist, "2024-01-01")
            .await
            .unwrap();
        assert_eq!(
            engine.get_checkpoint(MessageType::Badlist).await.unwrap(),
            Watermark::from("2024-01-01")
        );

        engine.put_checkpoint(MessageType::Badlist, "*").await.unwrap();
        assert_eq!(
            engine.get_checkpoint(MessageType::Badlist).await.unwrap(),
            Watermark::Beginning
        );
        assert!(engine
            .checkpoint_entry(MessageType::Badlist)
            .await
            .unwrap()
            .updated_at
            .is_some());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_put_message_then_get_message() {
        let engine = running_engine().await;

        engine
            .put_message(MessageType::File, json!({"sha256": "abc"}))
            .await
            .unwrap();

        let delivery = engine.get_message(MessageType::File).await.unwrap().unwrap();
        assert_eq!(delivery.message.doc_id.as_deref(), Some("abc"));
        assert!(engine.get_message(MessageType::File).await.unwrap().is_none());

        engine.ack_message(&delivery.receipt).await.unwrap();
        let stats = engine.queue_stats(MessageType::File).await.unwrap();
        assert_eq!(stats, QueueStats::default());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_check_reports_queues() {
        let engine = ReplayEngine::new(test_config());
        let health = engine.health_check().await;
        assert!(!health.ready);
        assert!(health.queues.is_empty());

        engine.start().await.unwrap();
        engine
            .put_message(MessageType::Submission, json!({"sid": "s1"}))
            .await
            .unwrap();

        let health = engine.health_check().await;
        assert!(health.ready);
        assert!(health.healthy);
        assert_eq!(health.queues.len(), 3);
        let submission = health
            .queues
            .iter()
            .find(|q| q.message_type == MessageType::Submission)
            .unwrap();
        assert_eq!(submission.stats.ready, 1);

        engine.shutdown().await;
    }
}
