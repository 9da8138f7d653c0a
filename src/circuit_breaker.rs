// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breakers for the source deployment.
//!
//! The document store and the artifact store are remote collaborators that
//! can stall or fail under load. Each gets its own breaker so a struggling
//! artifact store does not stop alert replication, and vice versa. Built on
//! the `recloser` crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Collaborator unhealthy, calls fail fast without being attempted
//! - **HalfOpen**: Probing for recovery, limited calls allowed
//!
//! A rejected call surfaces to the caller as `TransientStoreFailure`, the
//! same as a failed one, so worker retry policy does not need to tell them
//! apart.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use replay_engine::circuit_breaker::{SourceCircuit, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuits = SourceCircuit::new();
//!
//! match circuits.documents.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* success */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, back off */ }
//!     Err(CircuitError::Inner(e)) => { /* store error */ }
//! }
//! # Ok(())
//! # }
//! ```

use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed = 0,
    /// Testing if the collaborator recovered
    HalfOpen = 1,
    /// Collaborator unhealthy, fail fast
    Open = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::HalfOpen,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    /// Check if this is a rejection (circuit open).
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    /// Get the inner error if present.
    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit.
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing.
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: &'static str,
    inner: AsyncRecloser,
    state: AtomicU8,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config.
    pub fn new(name: &'static str, config: CircuitConfig) -> Self {
        // Trip once `failure_threshold` calls in the closed window have all failed.
        let recloser = Recloser::custom()
            .error_rate(1.0)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        metrics::set_circuit_state(name, "closed");
        Self {
            name,
            inner: recloser.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Execute an async operation through the circuit breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.transition(CircuitState::Closed);
                metrics::record_circuit_call(self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                self.transition(CircuitState::Open);
                metrics::record_circuit_call(self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(self.name, "failure");
                debug!(circuit = self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn transition(&self, next: CircuitState) {
        let previous = CircuitState::from_u8(self.state.swap(next as u8, Ordering::Relaxed));
        if previous == next {
            return;
        }
        match next {
            CircuitState::Open => {
                warn!(circuit = self.name, "Circuit breaker open, rejecting calls")
            }
            _ => debug!(circuit = self.name, state = %next, "Circuit breaker state changed"),
        }
        metrics::set_circuit_state(self.name, &next.to_string());
    }

    /// Last observed state.
    ///
    /// Updated as calls succeed or get rejected, so an open circuit reads as
    /// open until a call is let through again.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Number of failed calls (operation errors).
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Number of rejected calls (circuit open).
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// Circuit breakers for the two source collaborators.
pub struct SourceCircuit {
    /// Document store: `search` and `get`
    pub documents: CircuitBreaker,
    /// Artifact store: `fetch`
    pub artifacts: CircuitBreaker,
}

impl Default for SourceCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceCircuit {
    pub fn new() -> Self {
        Self::with_config(CircuitConfig::default())
    }

    pub fn with_config(config: CircuitConfig) -> Self {
        Self {
            documents: CircuitBreaker::new("documents", config.clone()),
            artifacts: CircuitBreaker::new("artifacts", config),
        }
    }

    /// Snapshot for health checks.
    pub fn snapshot(&self) -> SourceCircuitSnapshot {
        SourceCircuitSnapshot {
            documents: self.documents.state(),
            artifacts: self.artifacts.state(),
            documents_rejections: self.documents.rejections(),
            artifacts_rejections: self.artifacts.rejections(),
        }
    }

    /// Check if any circuit is open.
    pub fn any_open(&self) -> bool {
        self.documents.state() == CircuitState::Open || self.artifacts.state() == CircuitState::Open
    }
}

/// Point-in-time state of the source circuits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceCircuitSnapshot {
    pub documents: CircuitState,
    pub artifacts: CircuitState,
    pub documents_rejections: u64,
    pub artifacts_rejections: u64,
}
