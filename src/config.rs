// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replay engine.
//!
//! Configuration is passed to [`ReplayEngine::new()`](crate::ReplayEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use replay_engine::config::{ReplayConfig, StoreConfig};
//!
//! let config = ReplayConfig {
//!     instance_id: "central-1".into(),
//!     store: StoreConfig {
//!         sqlite_path: "/var/lib/replay/replay.db".into(),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplayConfig
//! ├── instance_id: String          # Identifies this engine in logs
//! ├── store: StoreConfig           # Shared SQLite database
//! ├── queue: QueueConfig           # Visibility window, redelivery, payloads
//! ├── source: SourceConfig         # Rate limit + circuit breakers for the source
//! └── worker: WorkerConfig         # Reference worker polling
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! instance_id: "airgap-replay-1"
//!
//! store:
//!   sqlite_path: "/var/lib/replay/replay.db"
//!   busy_timeout: "5s"
//!
//! queue:
//!   visibility_timeout: "5m"
//!   max_deliveries: 5
//!
//! source:
//!   rate_limit_enabled: true
//!   rate_limit_per_sec: 200
//! ```

use crate::error::{ReplayError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplayEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplayEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Identity of this engine instance (logging only; state is shared).
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Shared replay database.
    #[serde(default)]
    pub store: StoreConfig,

    /// Transfer queue behavior.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Protection for document/artifact store calls.
    #[serde(default)]
    pub source: SourceConfig,

    /// Reference worker polling.
    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_instance_id() -> String {
    "replay.dev.default".to_string()
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
            source: SourceConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl ReplayConfig {
    /// Create a minimal in-memory config for testing.
    ///
    /// Short visibility window and fast worker polling so redelivery paths
    /// can be exercised without long sleeps.
    pub fn for_testing(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            store: StoreConfig::in_memory(),
            queue: QueueConfig {
                visibility_timeout: "200ms".to_string(),
                release_backoff_base_ms: 10,
                release_backoff_max_ms: 100,
                sweep_interval_sec: 1,
                ..QueueConfig::default()
            },
            source: SourceConfig::default(),
            worker: WorkerConfig {
                poll_interval: "10ms".to_string(),
                max_idle_backoff: "50ms".to_string(),
                cursor_batch_size: 100,
            },
        }
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.trim().is_empty() {
            return Err(ReplayError::Config("instance_id must not be empty".into()));
        }
        if self.store.sqlite_path.trim().is_empty() {
            return Err(ReplayError::Config("store.sqlite_path must not be empty".into()));
        }
        parse_duration_field("store.busy_timeout", &self.store.busy_timeout)?;

        let visibility =
            parse_duration_field("queue.visibility_timeout", &self.queue.visibility_timeout)?;
        if visibility.is_zero() {
            return Err(ReplayError::Config(
                "queue.visibility_timeout must be greater than zero".into(),
            ));
        }
        if self.queue.max_deliveries == 0 {
            return Err(ReplayError::Config("queue.max_deliveries must be at least 1".into()));
        }
        if self.queue.release_backoff_base_ms > self.queue.release_backoff_max_ms {
            return Err(ReplayError::Config(format!(
                "queue.release_backoff_base_ms ({}) exceeds release_backoff_max_ms ({})",
                self.queue.release_backoff_base_ms, self.queue.release_backoff_max_ms
            )));
        }
        if self.queue.sweep_interval_sec == 0 {
            return Err(ReplayError::Config("queue.sweep_interval_sec must be at least 1".into()));
        }

        if self.source.rate_limit_enabled && self.source.rate_limit_per_sec == 0 {
            return Err(ReplayError::Config(
                "source.rate_limit_per_sec must be positive when rate limiting is enabled".into(),
            ));
        }
        if self.source.circuit_failure_threshold == 0 {
            return Err(ReplayError::Config(
                "source.circuit_failure_threshold must be at least 1".into(),
            ));
        }

        parse_duration_field("worker.poll_interval", &self.worker.poll_interval)?;
        parse_duration_field("worker.max_idle_backoff", &self.worker.max_idle_backoff)?;
        if self.worker.cursor_batch_size == 0 {
            return Err(ReplayError::Config("worker.cursor_batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_duration_field(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| ReplayError::Config(format!("{} '{}' is not a duration: {}", name, value, e)))
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: the shared replay database
// ═══════════════════════════════════════════════════════════════════════════════

/// Replay database configuration.
///
/// Every engine instance pointed at the same file shares checkpoints,
/// pending records, transfer records and queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database, or `":memory:"`.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Pool size. In-memory databases always use one connection.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a connection waits on a locked database before SQLITE_BUSY.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: String,
}

fn default_sqlite_path() -> String {
    "replay.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout() -> String {
    "5s".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
            max_connections: default_max_connections(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            max_connections: 1,
            busy_timeout: default_busy_timeout(),
        }
    }

    /// Parse the busy_timeout string to a Duration.
    pub fn busy_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.busy_timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueConfig: visibility window, redelivery and payload storage
// ═══════════════════════════════════════════════════════════════════════════════

/// Transfer queue configuration.
///
/// A leased message that is neither acknowledged nor completed within
/// `visibility_timeout` becomes visible again. After `max_deliveries` leases
/// it is moved to the dead-letter table instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Lease duration as a duration string (e.g., "5m").
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout: String,

    /// Leases allowed before a message is dead-lettered.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// Delay before a released message is visible again, first failure (ms).
    /// Actual delay = min(base * 2^(deliveries-1), max).
    #[serde(default = "default_release_backoff_base_ms")]
    pub release_backoff_base_ms: u64,

    /// Ceiling for the release delay (ms).
    #[serde(default = "default_release_backoff_max_ms")]
    pub release_backoff_max_ms: u64,

    /// Payloads at or above this size are zstd-compressed at rest.
    #[serde(default = "default_compress_threshold_bytes")]
    pub compress_threshold_bytes: usize,

    /// How often the sweeper reverts expired leases (seconds).
    #[serde(default = "default_sweep_interval_sec")]
    pub sweep_interval_sec: u64,
}

fn default_visibility_timeout() -> String {
    "5m".to_string()
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_release_backoff_base_ms() -> u64 {
    1_000
}

fn default_release_backoff_max_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_compress_threshold_bytes() -> usize {
    4096
}

fn default_sweep_interval_sec() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: default_visibility_timeout(),
            max_deliveries: default_max_deliveries(),
            release_backoff_base_ms: default_release_backoff_base_ms(),
            release_backoff_max_ms: default_release_backoff_max_ms(),
            compress_threshold_bytes: default_compress_threshold_bytes(),
            sweep_interval_sec: default_sweep_interval_sec(),
        }
    }
}

impl QueueConfig {
    /// Parse the visibility_timeout string to a Duration.
    pub fn visibility_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.visibility_timeout).unwrap_or(Duration::from_secs(300))
    }

    /// Delay before a message released after its `deliveries`-th lease
    /// becomes visible again.
    pub fn release_backoff(&self, deliveries: u32) -> Duration {
        let exponent = deliveries.saturating_sub(1);
        let delay_ms = self
            .release_backoff_base_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(delay_ms.min(self.release_backoff_max_ms))
    }

    /// Get the sweep interval as a Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_sec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig: protection for the source deployment
// ═══════════════════════════════════════════════════════════════════════════════

/// Rate limiting and circuit breaking for document/artifact store calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Enable rate limiting for `request`/`fetch_file`.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum source calls per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Number of consecutive failures before a circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long to wait before trying again after a circuit opens (seconds).
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout_sec: u64,
}

fn default_rate_limit_per_sec() -> u32 {
    500
}

fn default_rate_limit_burst() -> u32 {
    50
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> u64 {
    30
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout_sec: default_circuit_reset_timeout(),
        }
    }
}

impl SourceConfig {
    /// Rate limit configuration, or `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    /// Circuit configuration for the source collaborators.
    pub fn circuit_config(&self) -> crate::circuit_breaker::CircuitConfig {
        crate::circuit_breaker::CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(self.circuit_reset_timeout_sec),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WorkerConfig: reference worker loops
// ═══════════════════════════════════════════════════════════════════════════════

/// Polling behavior of the reference workers in [`crate::worker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Delay after an empty poll (first idle round).
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Ceiling for idle/error backoff.
    #[serde(default = "default_max_idle_backoff")]
    pub max_idle_backoff: String,

    /// Maximum reference records applied per cursor batch.
    #[serde(default = "default_cursor_batch_size")]
    pub cursor_batch_size: usize,
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_max_idle_backoff() -> String {
    "30s".to_string()
}

fn default_cursor_batch_size() -> usize {
    500
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_idle_backoff: default_max_idle_backoff(),
            cursor_batch_size: default_cursor_batch_size(),
        }
    }
}

impl WorkerConfig {
    /// Retry schedule used between empty polls and failed rounds.
    pub fn retry_config(&self) -> crate::resilience::RetryConfig {
        let initial_delay =
            humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(1));
        let max_delay =
            humantime::parse_duration(&self.max_idle_backoff).unwrap_or(Duration::from_secs(30));
        crate::resilience::RetryConfig {
            max_attempts: usize::MAX,
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            backoff_factor: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_config_default() {
        let config = ReplayConfig::default();
        assert_eq!(config.instance_id, "replay.dev.default");
        assert_eq!(config.store.sqlite_path, "replay.db");
        assert!(config.store.wal_mode);
        assert_eq!(config.queue.visibility_timeout, "5m");
        assert_eq!(config.queue.max_deliveries, 5);
        assert!(!config.source.rate_limit_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_for_testing_config() {
        let config = ReplayConfig::for_testing("test-1");
        assert_eq!(config.instance_id, "test-1");
        assert_eq!(config.store.sqlite_path, ":memory:");
        assert_eq!(
            config.queue.visibility_timeout_duration(),
            Duration::from_millis(200)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_busy_timeout_parsing() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("250ms", Duration::from_millis(250)),
            ("1m", Duration::from_secs(60)),
        ];

        for (input, expected) in test_cases {
            let config = StoreConfig {
                busy_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.busy_timeout_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_visibility_timeout_invalid_fallback() {
        let config = QueueConfig {
            visibility_timeout: "invalid".to_string(),
            ..Default::default()
        };
        // Falls back to 5 minutes
        assert_eq!(config.visibility_timeout_duration(), Duration::from_secs(300));
    }

    #[test]
    fn test_release_backoff() {
        let config = QueueConfig::default(); // 1s base, 5m cap

        assert_eq!(config.release_backoff(0), Duration::from_secs(1));
        assert_eq!(config.release_backoff(1), Duration::from_secs(1));
        assert_eq!(config.release_backoff(2), Duration::from_secs(2));
        assert_eq!(config.release_backoff(3), Duration::from_secs(4));
        assert_eq!(config.release_backoff(9), Duration::from_secs(256));
        // 2^9 = 512s, capped at 300
        assert_eq!(config.release_backoff(10), Duration::from_secs(300));
        assert_eq!(config.release_backoff(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_source_rate_limit_config() {
        let mut config = SourceConfig::default();

        // Disabled by default
        assert!(config.rate_limit_config().is_none());

        config.rate_limit_enabled = true;
        config.rate_limit_per_sec = 200;
        config.rate_limit_burst = 20;

        let rate_config = config.rate_limit_config().unwrap();
        assert_eq!(rate_config.refill_rate, 200);
        assert_eq!(rate_config.burst_size, 20);
    }

    #[test]
    fn test_source_circuit_config() {
        let config = SourceConfig {
            circuit_failure_threshold: 3,
            circuit_reset_timeout_sec: 10,
            ..Default::default()
        };
        let circuit = config.circuit_config();
        assert_eq!(circuit.failure_threshold, 3);
        assert_eq!(circuit.recovery_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_worker_retry_config() {
        let config = WorkerConfig {
            poll_interval: "100ms".to_string(),
            max_idle_backoff: "1s".to_string(),
            cursor_batch_size: 10,
        };
        let retry = config.retry_config();
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = ReplayConfig::default();
        config.queue.max_deliveries = 0;
        assert!(matches!(config.validate(), Err(ReplayError::Config(_))));

        let mut config = ReplayConfig::default();
        config.queue.visibility_timeout = "soon".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue.visibility_timeout"));

        let mut config = ReplayConfig::default();
        config.queue.visibility_timeout = "0s".to_string();
        assert!(config.validate().is_err());

        let mut config = ReplayConfig::default();
        config.queue.release_backoff_base_ms = 10_000;
        config.queue.release_backoff_max_ms = 1_000;
        assert!(config.validate().is_err());

        let mut config = ReplayConfig::default();
        config.source.rate_limit_enabled = true;
        config.source.rate_limit_per_sec = 0;
        assert!(config.validate().is_err());

        let mut config = ReplayConfig::default();
        config.instance_id = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = ReplayConfig::default();
        config.worker.cursor_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "instance_id": "edge-1", "queue": { "max_deliveries": 3 } }"#;
        let config: ReplayConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.instance_id, "edge-1");
        assert_eq!(config.queue.max_deliveries, 3);
        assert_eq!(config.queue.visibility_timeout, "5m");
        assert_eq!(config.store.sqlite_path, "replay.db");
        assert_eq!(config.worker.cursor_batch_size, 500);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReplayConfig::for_testing("roundtrip");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplayConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.instance_id, "roundtrip");
        assert_eq!(parsed.store.sqlite_path, ":memory:");
        assert_eq!(parsed.queue.visibility_timeout, "200ms");
    }
}
