//! Session Reclaim Background Task
//!
//! Periodically rolls back transactions idle past the configured timeout so
//! a crashed or forgetful client can never hold its tenant's write lock
//! indefinitely. Runs on its own interval, independent of request traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use vesper_core::TransactionConfig;

use crate::services::TransactionCoordinator;

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct SessionReclaimMetrics {
    /// Total sweeps completed
    pub sweeps: AtomicU64,

    /// Total sessions rolled back for idling
    pub sessions_reclaimed: AtomicU64,
}

impl SessionReclaimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SessionReclaimSnapshot {
        SessionReclaimSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            sessions_reclaimed: self.sessions_reclaimed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReclaimSnapshot {
    pub sweeps: u64,
    pub sessions_reclaimed: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Sweep for idle sessions until the shutdown signal is received.
///
/// # Returns
///
/// Metrics collected during the task's lifetime
pub async fn session_reclaim_task(
    coordinator: TransactionCoordinator,
    config: TransactionConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SessionReclaimMetrics> {
    let metrics = Arc::new(SessionReclaimMetrics::new());

    let mut sweep_interval = interval(config.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_secs = config.sweep_interval.as_secs(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Session reclaim task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Session reclaim task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweep(&coordinator, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweeps = snapshot.sweeps,
        sessions_reclaimed = snapshot.sessions_reclaimed,
        "Session reclaim task completed"
    );

    metrics
}

async fn sweep(coordinator: &TransactionCoordinator, metrics: &SessionReclaimMetrics) {
    metrics.sweeps.fetch_add(1, Ordering::Relaxed);
    let reclaimed = coordinator.reclaim_expired().await;
    if reclaimed > 0 {
        metrics
            .sessions_reclaimed
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
        tracing::info!(reclaimed, "Session reclaim sweep completed");
    } else {
        tracing::trace!("Session reclaim sweep found no idle sessions");
    }
}
