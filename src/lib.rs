// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Replay Engine
//!
//! Replication of analysis data from a source deployment to an independently
//! operated destination deployment, driven by durable checkpoints and queues.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              replay-engine                               │
//! │                                                                          │
//! │  cursor family (badlist, safelist, workflow)                             │
//! │  ┌─────────────────┐                                                     │
//! │  │ CheckpointStore │  get / put / advance watermark                      │
//! │  └─────────────────┘                                                     │
//! │                                                                          │
//! │  queue family (alert, submission, file)                                  │
//! │  ┌─────────────────┐   ┌───────────────┐   ┌───────────────────────┐     │
//! │  │ PendingSelector │──►│ TransferQueue │──►│ CompletionTracker     │     │
//! │  │ (admission)     │   │ (leases)      │   │ (TransferRecords)     │     │
//! │  └─────────────────┘   └───────────────┘   └───────────────────────┘     │
//! │          │                                                               │
//! │          ▼                                                               │
//! │  ┌─────────────────────────────┐        all state in one SQLite store    │
//! │  │ SourceClient (circuit, rate)│        shared by every engine instance  │
//! │  └─────────────────────────────┘                                         │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Families
//!
//! 1. **Cursor family**: small, mutable reference sets. A worker fetches
//!    records after the checkpoint, applies them, then advances it.
//! 2. **Queue family**: large, immutable artifacts. Documents are admitted
//!    by query, leased one at a time, and marked complete once transferred.
//!    A completed document is never admitted again.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replay_engine::{Index, MessageType, ReplayConfig, ReplayEngine};
//!
//! #[tokio::main]
//! async fn main() -> replay_engine::Result<()> {
//!     let engine = ReplayEngine::new(ReplayConfig::default());
//!     engine.start().await?;
//!
//!     let admitted = engine.set_bulk_pending(Index::Alert, "*:*", &[], 100).await?;
//!     if let Some(delivery) = engine.get_message(MessageType::Alert).await? {
//!         // ... transfer the document ...
//!         let doc_id = delivery.message.doc_id.as_deref().unwrap_or("");
//!         engine.set_complete(Index::Alert, doc_id).await?;
//!     }
//!     # let _ = admitted;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod circuit_breaker;
pub mod completion;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod resilience;
pub mod selector;
pub mod source;
pub mod store;
pub mod worker;

// Re-exports for convenience
pub use checkpoint::{Checkpoint, CheckpointStore, Watermark};
pub use circuit_breaker::{
    CircuitBreaker, CircuitConfig, CircuitError, CircuitState, SourceCircuit,
};
pub use completion::{CompletionOutcome, CompletionTracker, TransferRecord};
pub use config::{QueueConfig, ReplayConfig, SourceConfig, StoreConfig, WorkerConfig};
pub use coordinator::{EngineState, HealthCheck, QueueHealth, ReplayEngine};
pub use error::{ReplayError, Result};
pub use message::{Delivery, Index, MessageType, QueueMessage, Receipt, SyncMode};
pub use queue::{DeadLetter, QueueStats, SweepReport, TransferQueue};
pub use selector::{PendingSelector, ReplayState};
pub use source::{
    ArtifactStore, DocumentStore, MemoryArtifactStore, MemoryDocumentStore, SourceClient,
    SourceError,
};
pub use store::ReplayStore;
pub use worker::{Destination, ReferenceRecord, ReferenceSink, ReferenceSource, WorkOutcome};
