//! Background Jobs for the VESPER server
//!
//! - `session_reclaim`: rolls back transaction sessions idle past the timeout
//! - `cache_listener`: invalidates cached results for committed changes
//! - `queue_populator`: turns committed content changes into enrichment tasks
//! - `enrichment_worker`: claims tasks, computes embeddings, writes them back
//!
//! # Usage
//!
//! Every job takes a `watch::Receiver<bool>` and exits once `true` is sent.
//! [`BackgroundJobs`] owns the sender and the join handles:
//!
//! ```ignore
//! let jobs = service.start_background_jobs();
//! tokio::signal::ctrl_c().await?;
//! jobs.shutdown().await;
//! ```

pub mod cache_listener;
pub mod enrichment_worker;
pub mod queue_populator;
pub mod session_reclaim;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use cache_listener::{
    cache_listener_task, invalidate_batch, CacheListenerMetrics, CacheListenerSnapshot,
};
pub use enrichment_worker::{
    enrichment_worker_task, CycleReport, EnrichmentMetrics, EnrichmentSnapshot, EnrichmentWorker,
};
pub use queue_populator::{
    enqueue_batch, queue_populator_task, QueuePopulatorMetrics, QueuePopulatorSnapshot,
};
pub use session_reclaim::{session_reclaim_task, SessionReclaimMetrics, SessionReclaimSnapshot};

/// Handles for the spawned background jobs.
pub struct BackgroundJobs {
    shutdown_tx: watch::Sender<bool>,
    pub(crate) session_reclaim: JoinHandle<Arc<SessionReclaimMetrics>>,
    pub(crate) cache_listener: JoinHandle<Arc<CacheListenerMetrics>>,
    pub(crate) queue_populator: Option<JoinHandle<Arc<QueuePopulatorMetrics>>>,
    pub(crate) enrichment_worker: Option<JoinHandle<Arc<EnrichmentMetrics>>>,
}

/// Final metrics of every job that ran.
#[derive(Debug, Clone, Default)]
pub struct JobsReport {
    pub session_reclaim: Option<SessionReclaimSnapshot>,
    pub cache_listener: Option<CacheListenerSnapshot>,
    pub queue_populator: Option<QueuePopulatorSnapshot>,
    pub enrichment_worker: Option<EnrichmentSnapshot>,
}

impl BackgroundJobs {
    pub(crate) fn new(
        shutdown_tx: watch::Sender<bool>,
        session_reclaim: JoinHandle<Arc<SessionReclaimMetrics>>,
        cache_listener: JoinHandle<Arc<CacheListenerMetrics>>,
        queue_populator: Option<JoinHandle<Arc<QueuePopulatorMetrics>>>,
        enrichment_worker: Option<JoinHandle<Arc<EnrichmentMetrics>>>,
    ) -> Self {
        Self {
            shutdown_tx,
            session_reclaim,
            cache_listener,
            queue_populator,
            enrichment_worker,
        }
    }

    /// True when enrichment jobs were started.
    pub fn enrichment_running(&self) -> bool {
        self.enrichment_worker.is_some()
    }

    /// Signal every job and wait for it to finish its current step.
    pub async fn shutdown(self) -> JobsReport {
        // Receivers may already be gone if a job panicked.
        let _ = self.shutdown_tx.send(true);
        let mut report = JobsReport::default();

        match self.session_reclaim.await {
            Ok(metrics) => report.session_reclaim = Some(metrics.snapshot()),
            Err(e) => tracing::error!(error = %e, "Session reclaim job did not exit cleanly"),
        }
        match self.cache_listener.await {
            Ok(metrics) => report.cache_listener = Some(metrics.snapshot()),
            Err(e) => tracing::error!(error = %e, "Cache listener job did not exit cleanly"),
        }
        if let Some(handle) = self.queue_populator {
            match handle.await {
                Ok(metrics) => report.queue_populator = Some(metrics.snapshot()),
                Err(e) => tracing::error!(error = %e, "Queue populator job did not exit cleanly"),
            }
        }
        if let Some(handle) = self.enrichment_worker {
            match handle.await {
                Ok(metrics) => report.enrichment_worker = Some(metrics.snapshot()),
                Err(e) => tracing::error!(error = %e, "Enrichment worker job did not exit cleanly"),
            }
        }

        tracing::info!("Background jobs stopped");
        report
    }
}
