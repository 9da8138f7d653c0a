// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background lease sweeper.
//!
//! Leases expire on their own: `get_message` hands out any message whose
//! visibility deadline has passed. What does not happen on its own is the
//! PendingRecord side. A document whose worker died stays `InTransit` until
//! something reverts it, so the sweeper periodically:
//!
//! 1. dead-letters messages that used up their deliveries
//! 2. reverts InTransit records whose lease expired back to Pending

use crate::metrics;
use crate::queue::TransferQueue;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawn the sweeper. Runs until `shutdown_rx` turns true.
pub(super) fn spawn_sweeper(
    queue: TransferQueue,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_ms = interval.as_millis() as u64, "Starting lease sweeper");

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let start = Instant::now();
                    match queue.reap_expired().await {
                        Ok(report) => {
                            metrics::record_sweep(
                                report.reverted,
                                report.dead_lettered,
                                start.elapsed(),
                            );
                            if report.reverted > 0 || report.dead_lettered > 0 {
                                info!(
                                    reverted = report.reverted,
                                    dead_lettered = report.dead_lettered,
                                    "Sweep reclaimed expired leases"
                                );
                            }
                        }
                        Err(e) => {
                            // Next tick tries again
                            warn!(error = %e, "Lease sweep failed");
                            metrics::record_error("sweep", e.kind());
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender means the engine is gone
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Lease sweeper stopping");
                        break;
                    }
                }
            }
        }

        info!("Lease sweeper stopped");
    })
}
