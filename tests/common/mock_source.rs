// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure-injecting collaborators.
//!
//! The source stores wrap the in-memory implementations and can be switched
//! down, or told to fail the next N calls. The destination and reference
//! sink record everything they accept so tests can assert exactly-once
//! delivery.

use replay_engine::message::{Index, MessageType, QueueMessage};
use replay_engine::source::{
    ArtifactStore, BoxFuture, DocumentStore, MemoryArtifactStore, MemoryDocumentStore, SourceError,
};
use replay_engine::worker::{Destination, ReferenceRecord, ReferenceSink, ReferenceSource};
use replay_engine::Watermark;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Shared failure switch: permanently down, or fail the next N calls.
#[derive(Default)]
pub struct FailureSwitch {
    down: AtomicBool,
    fail_next: AtomicUsize,
    calls: AtomicUsize,
}

impl FailureSwitch {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Count a call and decide whether it fails.
    fn check(&self, what: &str) -> Result<(), SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(SourceError(format!("{} unreachable", what)));
        }
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SourceError(format!("{} injected failure", what)));
        }
        Ok(())
    }
}

// =============================================================================
// Source stores
// =============================================================================

/// Document store that can be made to fail.
#[derive(Default)]
pub struct FlakyDocumentStore {
    pub inner: MemoryDocumentStore,
    pub failures: FailureSwitch,
}

impl FlakyDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, index: Index, doc_id: &str, document: Value) {
        self.inner.insert(index, doc_id, document);
    }

    /// Insert `count` alerts `alert-000`, `alert-001`, ... with a `kind` field.
    pub fn seed_alerts(&self, count: usize, kind: &str) -> Vec<String> {
        (0..count)
            .map(|i| {
                let id = format!("alert-{:03}", i);
                self.inner.insert(
                    Index::Alert,
                    id.clone(),
                    serde_json::json!({ "alert_id": id, "kind": kind }),
                );
                id
            })
            .collect()
    }
}

impl DocumentStore for FlakyDocumentStore {
    fn search<'a>(
        &'a self,
        index: Index,
        query: &'a str,
        filter_queries: &'a [String],
    ) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.failures.check("document store")?;
            self.inner.search(index, query, filter_queries).await
        })
    }

    fn get<'a>(&'a self, index: Index, doc_id: &'a str) -> BoxFuture<'a, Option<Value>> {
        Box::pin(async move {
            self.failures.check("document store")?;
            self.inner.get(index, doc_id).await
        })
    }
}

/// Artifact store that can be made to fail.
#[derive(Default)]
pub struct FlakyArtifactStore {
    pub inner: MemoryArtifactStore,
    pub failures: FailureSwitch,
}

impl FlakyArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, content: &[u8]) -> String {
        self.inner.insert(content.to_vec())
    }
}

impl ArtifactStore for FlakyArtifactStore {
    fn fetch<'a>(&'a self, sha256: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            self.failures.check("artifact store")?;
            self.inner.fetch(sha256).await
        })
    }
}

// =============================================================================
// Queue family destination
// =============================================================================

/// Destination that records every delivery.
#[derive(Default)]
pub struct RecordingDestination {
    pub failures: FailureSwitch,
    documents: RwLock<Vec<(Index, String)>>,
    files: RwLock<Vec<(String, usize)>>,
    messages: RwLock<Vec<QueueMessage>>,
    delay: Option<Duration>,
}

impl RecordingDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivery sleeps for `delay` first (widens race windows).
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub async fn documents(&self) -> Vec<(Index, String)> {
        self.documents.read().await.clone()
    }

    pub async fn files(&self) -> Vec<(String, usize)> {
        self.files.read().await.clone()
    }

    pub async fn messages(&self) -> Vec<QueueMessage> {
        self.messages.read().await.clone()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Destination for RecordingDestination {
    fn deliver_document<'a>(
        &'a self,
        index: Index,
        doc_id: &'a str,
        _document: &'a Value,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.pause().await;
            self.failures.check("destination")?;
            self.documents.write().await.push((index, doc_id.to_string()));
            Ok(())
        })
    }

    fn deliver_file<'a>(&'a self, sha256: &'a str, content: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.pause().await;
            self.failures.check("destination")?;
            self.files.write().await.push((sha256.to_string(), content.len()));
            Ok(())
        })
    }

    fn deliver_message<'a>(&'a self, message: &'a QueueMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.pause().await;
            self.failures.check("destination")?;
            self.messages.write().await.push(message.clone());
            Ok(())
        })
    }
}

// =============================================================================
// Cursor family doubles
// =============================================================================

/// Reference source holding records per type in watermark order.
#[derive(Default)]
pub struct MemoryReferenceSource {
    pub failures: FailureSwitch,
    records: RwLock<HashMap<MessageType, Vec<ReferenceRecord>>>,
}

impl MemoryReferenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, message_type: MessageType, watermark: &str, payload: Value) {
        let mut records = self.records.write().await;
        let list = records.entry(message_type).or_default();
        list.push(ReferenceRecord::new(watermark, payload));
        list.sort_by(|a, b| a.watermark.cmp(&b.watermark));
    }
}

impl ReferenceSource for MemoryReferenceSource {
    fn records_after<'a>(
        &'a self,
        message_type: MessageType,
        after: &'a Watermark,
        limit: usize,
    ) -> BoxFuture<'a, Vec<ReferenceRecord>> {
        Box::pin(async move {
            self.failures.check("reference source")?;
            Ok(self
                .records
                .read()
                .await
                .get(&message_type)
                .map(|list| {
                    list.iter()
                        .filter(|r| &r.watermark > after)
                        .take(limit)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }
}

/// Reference sink recording every applied batch.
#[derive(Default)]
pub struct RecordingSink {
    pub failures: FailureSwitch,
    batches: RwLock<Vec<(MessageType, Vec<ReferenceRecord>)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn batches(&self) -> Vec<(MessageType, Vec<ReferenceRecord>)> {
        self.batches.read().await.clone()
    }

    /// Every applied watermark, in apply order.
    pub async fn applied_watermarks(&self, message_type: MessageType) -> Vec<String> {
        self.batches
            .read()
            .await
            .iter()
            .filter(|(t, _)| *t == message_type)
            .flat_map(|(_, records)| records.iter().map(|r| r.watermark.to_string()))
            .collect()
    }
}

impl ReferenceSink for RecordingSink {
    fn apply<'a>(
        &'a self,
        message_type: MessageType,
        records: &'a [ReferenceRecord],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.failures.check("reference sink")?;
            self.batches
                .write()
                .await
                .push((message_type, records.to_vec()));
            Ok(())
        })
    }
}
