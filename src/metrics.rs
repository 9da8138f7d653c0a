// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Checkpoint writes (operator overrides and worker advances)
//! - Admission (bulk-pending) results
//! - Queue traffic: enqueues, leases, redeliveries, releases, acks, dead letters
//! - Completions by outcome
//! - Source call latency and circuit breaker outcomes
//! - Reference worker outcomes
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replay_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use replay_engine::metrics;
//!
//! // After a bulk-pending pass
//! metrics::record_admission("alert", 5);
//!
//! // After a worker finishes a message
//! metrics::record_worker_outcome("alert", "completed");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Engine
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encoded numerically for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replay_engine_state").set(value);
}

/// Record an operation error by kind.
pub fn record_error(operation: &str, kind: &str) {
    counter!(
        "replay_errors_total",
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record local store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_store_retry(operation: &str) {
    counter!("replay_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Record a checkpoint write (`put` = operator override, `advance` = worker).
pub fn record_checkpoint_write(message_type: &str, kind: &'static str) {
    counter!(
        "replay_checkpoint_writes_total",
        "message_type" => message_type.to_string(),
        "kind" => kind
    )
    .increment(1);
}

// =============================================================================
// Admission and queue traffic
// =============================================================================

/// Record documents newly admitted by a bulk-pending pass.
pub fn record_admission(index: &str, admitted: usize) {
    counter!("replay_admission_passes_total", "index" => index.to_string()).increment(1);
    counter!("replay_admitted_total", "index" => index.to_string()).increment(admitted as u64);
}

/// Record a message enqueued (`origin` = "admission" or "put").
pub fn record_enqueue(message_type: &str, origin: &'static str) {
    counter!(
        "replay_enqueued_total",
        "message_type" => message_type.to_string(),
        "origin" => origin
    )
    .increment(1);
}

/// Record a message leased to a worker.
pub fn record_lease(message_type: &str, delivery: u32) {
    counter!("replay_leases_total", "message_type" => message_type.to_string()).increment(1);
    if delivery > 1 {
        counter!("replay_redeliveries_total", "message_type" => message_type.to_string())
            .increment(1);
    }
}

/// Record an explicit release (transfer failed).
pub fn record_release(message_type: &str) {
    counter!("replay_releases_total", "message_type" => message_type.to_string()).increment(1);
}

/// Record an acknowledged message.
pub fn record_ack(message_type: &str) {
    counter!("replay_acks_total", "message_type" => message_type.to_string()).increment(1);
}

/// Record messages moved to the dead-letter table.
pub fn record_dead_letters(message_type: &str, count: usize) {
    counter!("replay_dead_letters_total", "message_type" => message_type.to_string())
        .increment(count as u64);
}

/// Record dead letters put back on the queue by an operator.
pub fn record_requeued(message_type: &str, count: usize) {
    counter!("replay_requeued_total", "message_type" => message_type.to_string())
        .increment(count as u64);
}

/// Record expired leases reverted by the sweeper.
pub fn record_sweep(reverted: usize, dead_lettered: usize, duration: Duration) {
    counter!("replay_sweeps_total").increment(1);
    counter!("replay_sweep_reverted_total").increment(reverted as u64);
    counter!("replay_sweep_dead_lettered_total").increment(dead_lettered as u64);
    histogram!("replay_sweep_duration_seconds").record(duration.as_secs_f64());
}

/// Set the queue depth gauges for one message type.
pub fn set_queue_depth(message_type: &str, ready: u64, in_flight: u64, dead: u64) {
    gauge!("replay_queue_ready", "message_type" => message_type.to_string()).set(ready as f64);
    gauge!("replay_queue_in_flight", "message_type" => message_type.to_string())
        .set(in_flight as f64);
    gauge!("replay_queue_dead", "message_type" => message_type.to_string()).set(dead as f64);
}

// =============================================================================
// Completion
// =============================================================================

/// Record a completion (`completed` or `already_complete`).
pub fn record_completion(index: &str, outcome: &'static str) {
    counter!(
        "replay_completions_total",
        "index" => index.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

// =============================================================================
// Source calls
// =============================================================================

/// Record document/artifact store call latency.
pub fn record_source_latency(operation: &'static str, duration: Duration) {
    histogram!("replay_source_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Record artifact bytes fetched.
pub fn record_file_bytes(bytes: usize) {
    counter!("replay_file_bytes_total").increment(bytes as u64);
}

/// Record an artifact whose content did not match its sha256.
pub fn record_integrity_failure() {
    counter!("replay_integrity_failures_total").increment(1);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &'static str) {
    counter!(
        "replay_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("replay_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

// =============================================================================
// Reference workers
// =============================================================================

/// Record how a worker finished one message.
pub fn record_worker_outcome(message_type: &str, outcome: &'static str) {
    counter!(
        "replay_worker_outcomes_total",
        "message_type" => message_type.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record one cursor sync round.
pub fn record_cursor_sync(message_type: &str, records: usize, duration: Duration) {
    counter!("replay_cursor_syncs_total", "message_type" => message_type.to_string())
        .increment(1);
    counter!("replay_cursor_records_total", "message_type" => message_type.to_string())
        .increment(records as u64);
    histogram!("replay_cursor_sync_duration_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}
