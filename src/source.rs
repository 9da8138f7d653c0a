// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source deployment collaborators.
//!
//! The engine reads from two external services on the source deployment:
//!
//! - [`DocumentStore`]: search an index and fetch documents by id
//! - [`ArtifactStore`]: fetch file content by sha256
//!
//! Both are traits returning boxed futures, so the host application plugs in
//! its own clients and tests plug in mocks. [`MemoryDocumentStore`] and
//! [`MemoryArtifactStore`] are complete in-process implementations used as
//! defaults.
//!
//! [`SourceClient`] wraps a pair of stores with circuit breakers, an optional
//! rate limiter, latency metrics and artifact integrity checks. Every error
//! it returns is already mapped into [`ReplayError`].
//!
//! # Example
//!
//! ```rust,no_run
//! use replay_engine::source::{DocumentStore, BoxFuture};
//! use replay_engine::Index;
//!
//! struct MyStore;
//!
//! impl DocumentStore for MyStore {
//!     fn search<'a>(
//!         &'a self,
//!         _index: Index,
//!         _query: &'a str,
//!         _filter_queries: &'a [String],
//!     ) -> BoxFuture<'a, Vec<String>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!
//!     fn get<'a>(
//!         &'a self,
//!         _index: Index,
//!         _doc_id: &'a str,
//!     ) -> BoxFuture<'a, Option<serde_json::Value>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//! }
//! ```

use crate::circuit_breaker::{CircuitBreaker, CircuitError, SourceCircuit};
use crate::error::{ReplayError, Result};
use crate::message::Index;
use crate::metrics;
use crate::resilience::RateLimiter;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tracing::warn;

/// Result type for source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = SourceResult<T>> + Send + 'a>>;

/// Failure reported by a source collaborator.
#[derive(Debug, Clone)]
pub struct SourceError(pub String);

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SourceError {}

/// The source deployment's document store.
pub trait DocumentStore: Send + Sync + 'static {
    /// Ids of documents in `index` matching `query` AND every filter query.
    ///
    /// Order is not significant; the selector sorts ids itself.
    fn search<'a>(
        &'a self,
        index: Index,
        query: &'a str,
        filter_queries: &'a [String],
    ) -> BoxFuture<'a, Vec<String>>;

    /// Fetch a document. `Ok(None)` if it does not exist.
    fn get<'a>(&'a self, index: Index, doc_id: &'a str) -> BoxFuture<'a, Option<Value>>;
}

/// The source deployment's file store.
pub trait ArtifactStore: Send + Sync + 'static {
    /// Fetch file content. `Ok(None)` if it does not exist.
    fn fetch<'a>(&'a self, sha256: &'a str) -> BoxFuture<'a, Option<Vec<u8>>>;
}

impl<T: DocumentStore> DocumentStore for Arc<T> {
    fn search<'a>(
        &'a self,
        index: Index,
        query: &'a str,
        filter_queries: &'a [String],
    ) -> BoxFuture<'a, Vec<String>> {
        (**self).search(index, query, filter_queries)
    }

    fn get<'a>(&'a self, index: Index, doc_id: &'a str) -> BoxFuture<'a, Option<Value>> {
        (**self).get(index, doc_id)
    }
}

impl<T: ArtifactStore> ArtifactStore for Arc<T> {
    fn fetch<'a>(&'a self, sha256: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        (**self).fetch(sha256)
    }
}

/// Compute SHA256 content hash as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory document store
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process document store.
///
/// Supports a minimal query syntax:
///
/// | Query | Matches |
/// |-------|---------|
/// | `*`, `*:*` or empty | every document |
/// | `field:value` | documents whose `field` equals `value` |
/// | `field:*` | documents that have `field` |
///
/// `field` may be a dotted path into nested objects (`metadata.source`).
/// Non-string values compare by their JSON text, so `score:100` matches
/// `{"score": 100}`.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<BTreeMap<(Index, String), Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document.
    pub fn insert(&self, index: Index, doc_id: impl Into<String>, document: Value) {
        self.docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((index, doc_id.into()), document);
    }

    /// Remove a document, returning whether it existed.
    pub fn remove(&self, index: Index, doc_id: &str) -> bool {
        self.docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(index, doc_id.to_string()))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matching(&self, index: Index, query: &str, filter_queries: &[String]) -> Vec<String> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        docs.iter()
            .filter(|((doc_index, _), _)| *doc_index == index)
            .filter(|(_, doc)| {
                query_matches(query, doc) && filter_queries.iter().all(|f| query_matches(f, doc))
            })
            .map(|((_, doc_id), _)| doc_id.clone())
            .collect()
    }
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, key| value.get(key))
}

fn query_matches(query: &str, doc: &Value) -> bool {
    let query = query.trim();
    if query.is_empty() || query == "*" || query == "*:*" {
        return true;
    }
    let Some((field, expected)) = query.split_once(':') else {
        // A bare term matches any top-level string value
        return doc
            .as_object()
            .map(|fields| fields.values().any(|v| v.as_str() == Some(query)))
            .unwrap_or(false);
    };
    let expected = expected.trim().trim_matches('"');
    match lookup(doc, field.trim()) {
        None => false,
        Some(_) if expected == "*" => true,
        Some(Value::String(s)) => s == expected,
        Some(Value::Array(items)) => items.iter().any(|item| match item {
            Value::String(s) => s == expected,
            other => other.to_string() == expected,
        }),
        Some(other) => other.to_string() == expected,
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn search<'a>(
        &'a self,
        index: Index,
        query: &'a str,
        filter_queries: &'a [String],
    ) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move { Ok(self.matching(index, query, filter_queries)) })
    }

    fn get<'a>(&'a self, index: Index, doc_id: &'a str) -> BoxFuture<'a, Option<Value>> {
        Box::pin(async move {
            Ok(self
                .docs
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&(index, doc_id.to_string()))
                .cloned())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory artifact store
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process artifact store keyed by sha256.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store content under its own sha256, returning the hash.
    pub fn insert(&self, content: impl Into<Vec<u8>>) -> String {
        let content = content.into();
        let sha256 = sha256_hex(&content);
        self.insert_raw(sha256.clone(), content);
        sha256
    }

    /// Store content under an arbitrary key (no hashing).
    pub fn insert_raw(&self, sha256: impl Into<String>, content: Vec<u8>) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sha256.into().to_ascii_lowercase(), content);
    }

    pub fn len(&self) -> usize {
        self.files.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn fetch<'a>(&'a self, sha256: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            Ok(self
                .files
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&sha256.to_ascii_lowercase())
                .cloned())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceClient: guarded access to both stores
// ═══════════════════════════════════════════════════════════════════════════════

/// Circuit-broken, rate-limited access to the source collaborators.
pub struct SourceClient<D, A> {
    documents: D,
    artifacts: A,
    circuits: SourceCircuit,
    limiter: Option<RateLimiter>,
}

fn source_failure(
    operation: &'static str,
    breaker: &CircuitBreaker,
    err: CircuitError<SourceError>,
) -> ReplayError {
    match err {
        CircuitError::Rejected => ReplayError::transient(
            operation,
            format!("{} circuit open, call rejected", breaker.name()),
        ),
        CircuitError::Inner(e) => ReplayError::transient(operation, e.0),
    }
}

impl<D: DocumentStore, A: ArtifactStore> SourceClient<D, A> {
    pub fn new(
        documents: D,
        artifacts: A,
        circuits: SourceCircuit,
        limiter: Option<RateLimiter>,
    ) -> Self {
        Self {
            documents,
            artifacts,
            circuits,
            limiter,
        }
    }

    pub fn documents(&self) -> &D {
        &self.documents
    }

    pub fn artifacts(&self) -> &A {
        &self.artifacts
    }

    pub fn circuits(&self) -> &SourceCircuit {
        &self.circuits
    }

    async fn throttle(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
    }

    /// Search the document store.
    pub async fn search(
        &self,
        index: Index,
        query: &str,
        filter_queries: &[String],
    ) -> Result<Vec<String>> {
        let start = Instant::now();
        let breaker = &self.circuits.documents;
        let result = breaker
            .call(|| self.documents.search(index, query, filter_queries))
            .await
            .map_err(|e| source_failure("search", breaker, e));
        metrics::record_source_latency("search", start.elapsed());
        result
    }

    /// Fetch one document; absent documents are `NotFound`.
    pub async fn get(&self, index: Index, doc_id: &str) -> Result<Value> {
        self.throttle().await;
        let start = Instant::now();
        let breaker = &self.circuits.documents;
        let result = breaker
            .call(|| self.documents.get(index, doc_id))
            .await
            .map_err(|e| source_failure("request", breaker, e));
        metrics::record_source_latency("request", start.elapsed());

        result?.ok_or_else(|| ReplayError::not_found("document", format!("{}/{}", index, doc_id)))
    }

    /// Fetch an artifact and verify it hashes to `sha256`.
    pub async fn fetch(&self, sha256: &str) -> Result<Vec<u8>> {
        self.throttle().await;
        let start = Instant::now();
        let breaker = &self.circuits.artifacts;
        let result = breaker
            .call(|| self.artifacts.fetch(sha256))
            .await
            .map_err(|e| source_failure("fetch_file", breaker, e));
        metrics::record_source_latency("fetch_file", start.elapsed());

        let content = result?.ok_or_else(|| ReplayError::not_found("file", sha256))?;
        let actual = sha256_hex(&content);
        if !actual.eq_ignore_ascii_case(sha256) {
            warn!(sha256, actual = %actual, "Fetched file failed integrity check");
            metrics::record_integrity_failure();
            return Err(ReplayError::Integrity {
                sha256: sha256.to_string(),
                actual,
            });
        }

        metrics::record_file_bytes(content.len());
        Ok(content)
    }
}
