//! Invalidation signals for cached read results.
//!
//! Every (tenant, collection) pair has one signal: a monotonically
//! increasing epoch. A cache entry remembers the epochs it was computed
//! under; it is dead as soon as either its collection signal or its
//! tenant-wide signal has moved on. Firing a signal is a single atomic
//! increment no matter how many entries depend on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;
use vesper_core::TenantId;

/// A cancellation signal expressed as an epoch counter.
#[derive(Debug, Default)]
pub struct InvalidationSignal {
    epoch: AtomicU64,
}

impl InvalidationSignal {
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn fire(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Debug, Default)]
struct TenantSignals {
    tenant: Arc<InvalidationSignal>,
    collections: DashMap<String, Arc<InvalidationSignal>>,
}

/// The signals a cache entry was computed under.
///
/// Capture it *before* computing the value; if a commit lands in between,
/// the entry is born dead instead of caching pre-commit data.
#[derive(Debug, Clone)]
pub struct SignalToken {
    tenant_signal: Arc<InvalidationSignal>,
    tenant_epoch: u64,
    collection_signal: Arc<InvalidationSignal>,
    collection_epoch: u64,
}

impl SignalToken {
    pub fn is_fired(&self) -> bool {
        self.tenant_signal.epoch() != self.tenant_epoch
            || self.collection_signal.epoch() != self.collection_epoch
    }
}

/// Counters for invalidation activity.
#[derive(Debug, Default)]
pub struct InvalidationMetrics {
    /// Calls to `invalidate`
    pub collection_invalidations: AtomicU64,
    /// Calls to `invalidate_tenant`
    pub tenant_invalidations: AtomicU64,
}

/// Point-in-time copy of [`InvalidationMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationSnapshot {
    pub collection_invalidations: u64,
    pub tenant_invalidations: u64,
}

impl InvalidationMetrics {
    pub fn snapshot(&self) -> InvalidationSnapshot {
        InvalidationSnapshot {
            collection_invalidations: self.collection_invalidations.load(Ordering::Relaxed),
            tenant_invalidations: self.tenant_invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Evicts cached results per (tenant, collection).
#[derive(Debug, Default)]
pub struct CacheInvalidator {
    tenants: DashMap<TenantId, Arc<TenantSignals>>,
    metrics: InvalidationMetrics,
}

impl CacheInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    fn tenant_signals(&self, tenant: &TenantId) -> Arc<TenantSignals> {
        Arc::clone(
            self.tenants
                .entry(tenant.clone())
                .or_insert_with(|| Arc::new(TenantSignals::default()))
                .value(),
        )
    }

    fn collection_signal(signals: &TenantSignals, collection: &str) -> Arc<InvalidationSignal> {
        if let Some(signal) = signals.collections.get(collection) {
            return Arc::clone(signal.value());
        }
        Arc::clone(
            signals
                .collections
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(InvalidationSignal::default()))
                .value(),
        )
    }

    /// Capture the current signals for a pair.
    pub fn token(&self, tenant: &TenantId, collection: &str) -> SignalToken {
        let signals = self.tenant_signals(tenant);
        let collection_signal = Self::collection_signal(&signals, collection);
        SignalToken {
            tenant_epoch: signals.tenant.epoch(),
            tenant_signal: Arc::clone(&signals.tenant),
            collection_epoch: collection_signal.epoch(),
            collection_signal,
        }
    }

    /// Evict every entry computed from (tenant, collection).
    pub fn invalidate(&self, tenant: &TenantId, collection: &str) {
        self.metrics
            .collection_invalidations
            .fetch_add(1, Ordering::Relaxed);
        let signals = self.tenant_signals(tenant);
        let epoch = Self::collection_signal(&signals, collection).fire();
        trace!(tenant = %tenant, collection, epoch, "Invalidated collection");
    }

    /// Evict every entry for a tenant.
    pub fn invalidate_tenant(&self, tenant: &TenantId) {
        self.metrics
            .tenant_invalidations
            .fetch_add(1, Ordering::Relaxed);
        let epoch = self.tenant_signals(tenant).tenant.fire();
        trace!(tenant = %tenant, epoch, "Invalidated tenant");
    }

    /// Current epoch of a pair's collection signal.
    pub fn epoch(&self, tenant: &TenantId, collection: &str) -> u64 {
        self.tenants
            .get(tenant)
            .and_then(|signals| signals.collections.get(collection).map(|s| s.epoch()))
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> InvalidationSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_fires_on_collection_invalidation() {
        let invalidator = CacheInvalidator::new();
        let acme = TenantId::new("acme");
        let token = invalidator.token(&acme, "articles");
        assert!(!token.is_fired());

        invalidator.invalidate(&acme, "articles2");
        assert!(!token.is_fired());

        invalidator.invalidate(&acme, "articles");
        assert!(token.is_fired());
    }

    #[test]
    fn test_tenant_invalidation_fires_every_collection() {
        let invalidator = CacheInvalidator::new();
        let acme = TenantId::new("acme");
        let other = TenantId::new("other");
        let a = invalidator.token(&acme, "articles");
        let b = invalidator.token(&acme, "authors");
        let c = invalidator.token(&other, "articles");

        invalidator.invalidate_tenant(&acme);
        assert!(a.is_fired());
        assert!(b.is_fired());
        assert!(!c.is_fired());
    }

    #[test]
    fn test_token_taken_after_invalidation_is_live() {
        let invalidator = CacheInvalidator::new();
        let acme = TenantId::new("acme");
        invalidator.invalidate(&acme, "articles");
        let token = invalidator.token(&acme, "articles");
        assert!(!token.is_fired());
        assert_eq!(invalidator.epoch(&acme, "articles"), 1);
    }

    #[test]
    fn test_metrics_count_calls() {
        let invalidator = CacheInvalidator::new();
        let acme = TenantId::new("acme");
        invalidator.invalidate(&acme, "a");
        invalidator.invalidate(&acme, "b");
        invalidator.invalidate_tenant(&acme);
        assert_eq!(
            invalidator.metrics(),
            InvalidationSnapshot {
                collection_invalidations: 2,
                tenant_invalidations: 1,
            }
        );
    }
}
