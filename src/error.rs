// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replay engine.
//!
//! Errors are categorized by their source (local store, document store,
//! caller input) and carry enough context to tell which key failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `TransientStoreFailure` | Yes | Source unreachable, circuit open, local store busy |
//! | `InvalidMessageType` | No | Unknown type string, or wrong family for the operation |
//! | `InvalidWatermark` | No | Blank operator watermark |
//! | `NotFound` | No | Document, artifact or queue receipt absent |
//! | `Store` | No | Local SQLite errors (needs operator attention) |
//! | `Integrity` | No | Artifact bytes do not match the requested sha256 |
//! | `Codec` | No | Stored queue payload is corrupt |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine lifecycle violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! Completing an already-complete document is **not** an error: it is
//! reported as [`CompletionOutcome::AlreadyComplete`](crate::completion::CompletionOutcome).
//!
//! # Retry Behavior
//!
//! The engine never retries on the caller's behalf. Use
//! [`ReplayError::is_retryable()`] in the worker loop to decide whether to
//! back off and try again.

use thiserror::Error;

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Errors that can occur during replay replication.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Unrecognized message type string, or a type used with an operation
    /// of the other family (e.g. a checkpoint for `alert`).
    #[error("Invalid message type '{value}': {reason}")]
    InvalidMessageType { value: String, reason: String },

    /// Operator-supplied watermark is blank. Only `"*"` rewinds.
    #[error("Invalid watermark '{0}': use \"*\" to rewind to the beginning")]
    InvalidWatermark(String),

    /// A document, artifact or queue receipt does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The document store, artifact store or local store is temporarily
    /// unavailable. Retryable with backoff.
    #[error("Transient store failure ({operation}): {message}")]
    TransientStoreFailure { operation: String, message: String },

    /// SQLite error in the local replay store.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Replay store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Artifact bytes fetched for `sha256` hashed to something else.
    #[error("Integrity check failed for {sha256}: content hashes to {actual}")]
    Integrity { sha256: String, actual: String },

    /// Stored queue payload could not be decoded.
    #[error("Payload codec error: {0}")]
    Codec(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine lifecycle violation (e.g. an operation before `start()`).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplayError {
    /// Create an `InvalidMessageType` error.
    pub fn invalid_type(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMessageType {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a `NotFound` error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a `TransientStoreFailure` error.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientStoreFailure {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientStoreFailure { .. } => true,
            Self::InvalidMessageType { .. } => false,
            Self::InvalidWatermark(_) => false,
            Self::NotFound { .. } => false,
            Self::Store(_) => false, // Local DB issues need attention
            Self::Integrity { .. } => false,
            Self::Codec(_) => false, // Data corruption
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidMessageType { .. } => "invalid_message_type",
            Self::InvalidWatermark(_) => "invalid_watermark",
            Self::NotFound { .. } => "not_found",
            Self::TransientStoreFailure { .. } => "transient",
            Self::Store(_) => "store",
            Self::Integrity { .. } => "integrity",
            Self::Codec(_) => "codec",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
