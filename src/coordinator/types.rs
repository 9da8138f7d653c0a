// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (store opened)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!                  shutdown()
//!
//! Starting ──(store failed to open)──→ Failed
//! ```
//!
//! - **Created**: After `ReplayEngine::new()`. No store is open.
//! - **Starting**: `start()` is validating config and opening the store.
//! - **Running**: Operations are served and the sweeper is active.
//! - **ShuttingDown**: Background tasks are draining.
//! - **Stopped**: Store closed. Safe to drop.
//! - **Failed**: `start()` could not open the store.

use crate::circuit_breaker::SourceCircuitSnapshot;
use crate::message::MessageType;
use crate::queue::QueueStats;
use serde::Serialize;

/// State of the replay engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Created but not started.
    ///
    /// Call [`start()`](super::ReplayEngine::start) to open the store.
    Created,

    /// Opening the store and spawning the sweeper.
    Starting,

    /// Serving operations.
    Running,

    /// Shutting down gracefully.
    ShuttingDown,

    /// Shut down cleanly.
    Stopped,

    /// Failed to start. Check logs for the cause.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Depth of one queue-family message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub message_type: MessageType,
    #[serde(flatten)]
    pub stats: QueueStats,
}

/// Snapshot returned by [`ReplayEngine::health_check`](super::ReplayEngine::health_check).
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,

    /// Running and the store answered.
    pub ready: bool,

    /// Ready, and neither source circuit is open.
    pub healthy: bool,

    pub instance_id: String,

    pub circuits: SourceCircuitSnapshot,

    /// One entry per queue-family type. Empty when the store is not open.
    pub queues: Vec<QueueHealth>,

    /// Set when the store could not be queried.
    pub store_error: Option<String>,
}

impl HealthCheck {
    /// Total dead-lettered messages across all queues.
    pub fn dead_letters(&self) -> u64 {
        self.queues.iter().map(|q| q.stats.dead).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_engine_state_serializes_as_name() {
        let json = serde_json::to_string(&EngineState::ShuttingDown).unwrap();
        assert_eq!(json, "\"ShuttingDown\"");
    }

    #[test]
    fn test_health_check_dead_letter_total() {
        let health = HealthCheck {
            state: EngineState::Running,
            ready: true,
            healthy: true,
            instance_id: "replay.test".into(),
            circuits: SourceCircuitSnapshot {
                documents: CircuitState::Closed,
                artifacts: CircuitState::Closed,
                documents_rejections: 0,
                artifacts_rejections: 0,
            },
            queues: vec![
                QueueHealth {
                    message_type: MessageType::Alert,
                    stats: QueueStats { ready: 3, in_flight: 1, dead: 2 },
                },
                QueueHealth {
                    message_type: MessageType::File,
                    stats: QueueStats { ready: 0, in_flight: 0, dead: 1 },
                },
            ],
            store_error: None,
        };

        assert_eq!(health.dead_letters(), 3);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["queues"][0]["message_type"], "alert");
        assert_eq!(json["queues"][0]["ready"], 3);
    }
}
