//! Cache Invalidation Listener
//!
//! Subscribes to every committed change, deletes included, and invalidates
//! the affected (tenant, collection) pairs. This also covers writes that
//! never went through a coordinator session. Commits made through the
//! coordinator have already been invalidated synchronously by the time
//! their batch arrives here.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use vesper_events::{ChangeBatch, Subscription};
use vesper_storage::CacheInvalidator;

#[derive(Debug, Default)]
pub struct CacheListenerMetrics {
    /// Change batches received
    pub batches: AtomicU64,

    /// (tenant, collection) invalidations issued
    pub invalidations: AtomicU64,
}

impl CacheListenerMetrics {
    pub fn snapshot(&self) -> CacheListenerSnapshot {
        CacheListenerSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheListenerSnapshot {
    pub batches: u64,
    pub invalidations: u64,
}

/// Invalidate every collection a batch touched, once each.
pub fn invalidate_batch(
    invalidator: &CacheInvalidator,
    batch: &ChangeBatch,
    metrics: &CacheListenerMetrics,
) {
    metrics.batches.fetch_add(1, Ordering::Relaxed);
    let collections: BTreeSet<&str> = batch
        .records
        .iter()
        .map(|r| r.collection.as_str())
        .collect();
    for collection in collections {
        invalidator.invalidate(&batch.tenant, collection);
        metrics.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Consume change batches until shutdown or until the notifier goes away.
pub async fn cache_listener_task(
    invalidator: Arc<CacheInvalidator>,
    mut subscription: Subscription,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<CacheListenerMetrics> {
    let metrics = Arc::new(CacheListenerMetrics::default());
    tracing::info!(subscription = subscription.id(), "Cache listener started");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Cache listener shutting down");
                    break;
                }
            }

            batch = subscription.recv() => {
                match batch {
                    Some(batch) => invalidate_batch(&invalidator, &batch, &metrics),
                    None => break,
                }
            }
        }
    }

    subscription.cancel();
    let snapshot = metrics.snapshot();
    tracing::info!(
        batches = snapshot.batches,
        invalidations = snapshot.invalidations,
        "Cache listener completed"
    );
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::{ChangeKind, ChangeRecord, TenantId};

    #[test]
    fn test_deletes_invalidate_and_collections_are_deduplicated() {
        let invalidator = CacheInvalidator::new();
        let metrics = CacheListenerMetrics::default();
        let acme = TenantId::new("acme");
        let batch = ChangeBatch {
            tenant: acme.clone(),
            records: vec![
                ChangeRecord::new(ChangeKind::Delete, "articles", "d1"),
                ChangeRecord::new(ChangeKind::Insert, "articles", "d2"),
                ChangeRecord::new(ChangeKind::Update, "authors", "a1"),
            ],
        };

        invalidate_batch(&invalidator, &batch, &metrics);
        assert_eq!(invalidator.epoch(&acme, "articles"), 1);
        assert_eq!(invalidator.epoch(&acme, "authors"), 1);
        assert_eq!(
            metrics.snapshot(),
            CacheListenerSnapshot {
                batches: 1,
                invalidations: 2,
            }
        );
    }
}
