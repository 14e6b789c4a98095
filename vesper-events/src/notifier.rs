//! Non-blocking fan-out of committed change records.
//!
//! Each subscriber owns an unbounded queue, so publishing never waits on a
//! slow consumer and one stalled subscriber cannot hold up another. Queues
//! whose receiving side is gone are pruned on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use vesper_core::{ChangeKind, ChangeRecord, TenantId};
use vesper_storage::{CommitObserver, ObserverFactory};

/// The records of one commit that matched a subscriber's filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    pub tenant: TenantId,
    pub records: Vec<ChangeRecord>,
}

/// Which changes a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    /// `None` matches every tenant.
    pub tenant: Option<TenantId>,
    /// `None` matches every collection.
    pub collection: Option<String>,
    pub kinds: Vec<ChangeKind>,
}

impl SubscriptionFilter {
    /// Every change of every kind.
    pub fn all() -> Self {
        Self {
            tenant: None,
            collection: None,
            kinds: vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete],
        }
    }

    /// Inserts and updates only: changes that carry document content.
    pub fn content_changes() -> Self {
        Self {
            kinds: vec![ChangeKind::Insert, ChangeKind::Update],
            ..Self::all()
        }
    }

    pub fn for_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn for_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    fn matches_tenant(&self, tenant: &TenantId) -> bool {
        self.tenant.as_ref().map_or(true, |t| t == tenant)
    }

    fn matches(&self, record: &ChangeRecord) -> bool {
        self.kinds.contains(&record.kind)
            && self
                .collection
                .as_deref()
                .map_or(true, |c| c == record.collection)
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<ChangeBatch>,
}

#[derive(Debug, Default)]
struct NotifierMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    pruned: AtomicU64,
}

/// Snapshot of notifier counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierSnapshot {
    /// Commits published
    pub published: u64,
    /// Batches handed to subscribers
    pub delivered: u64,
    /// Subscribers dropped because their receiver was gone
    pub pruned: u64,
    pub subscribers: u64,
}

struct NotifierInner {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    metrics: NotifierMetrics,
}

/// Multi-subscriber publish point for committed changes.
#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<NotifierInner>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                metrics: NotifierMetrics::default(),
            }),
        }
    }

    /// Register a subscriber. Dropping the returned handle cancels it.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.insert(id, Subscriber { filter, tx });
        debug!(subscription = id, "Change subscription registered");
        Subscription {
            id,
            rx,
            notifier: self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        if self.inner.subscribers.remove(&id).is_some() {
            debug!(subscription = id, "Change subscription cancelled");
        }
    }

    /// Hand a commit's records to every matching subscriber.
    ///
    /// Never blocks. Returns the number of subscribers that received a batch.
    pub fn publish(&self, tenant: &TenantId, records: &[ChangeRecord]) -> usize {
        if records.is_empty() {
            return 0;
        }
        self.inner.metrics.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut closed = Vec::new();
        for entry in self.inner.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.filter.matches_tenant(tenant) {
                continue;
            }
            let matching: Vec<ChangeRecord> = records
                .iter()
                .filter(|r| subscriber.filter.matches(r))
                .cloned()
                .collect();
            if matching.is_empty() {
                continue;
            }
            let batch = ChangeBatch {
                tenant: tenant.clone(),
                records: matching,
            };
            if subscriber.tx.send(batch).is_err() {
                closed.push(*entry.key());
            } else {
                delivered += 1;
            }
        }

        for id in closed {
            self.inner.subscribers.remove(&id);
            self.inner.metrics.pruned.fetch_add(1, Ordering::Relaxed);
        }
        self.inner
            .metrics
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        trace!(tenant = %tenant, records = records.len(), delivered, "Published changes");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn snapshot(&self) -> NotifierSnapshot {
        NotifierSnapshot {
            published: self.inner.metrics.published.load(Ordering::Relaxed),
            delivered: self.inner.metrics.delivered.load(Ordering::Relaxed),
            pruned: self.inner.metrics.pruned.load(Ordering::Relaxed),
            subscribers: self.inner.subscribers.len() as u64,
        }
    }
}

/// A live subscription. Cancelled on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ChangeBatch>,
    notifier: ChangeNotifier,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next batch. `None` once cancelled and drained.
    pub async fn recv(&mut self) -> Option<ChangeBatch> {
        self.rx.recv().await
    }

    /// Next batch if one is already queued.
    pub fn try_recv(&mut self) -> Option<ChangeBatch> {
        self.rx.try_recv().ok()
    }

    /// Stop future deliveries. Batches already queued stay readable.
    pub fn cancel(&mut self) {
        self.notifier.unsubscribe(self.id);
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.unsubscribe(self.id);
    }
}

/// Forwards one engine's commits into the notifier under its tenant.
struct TenantForwarder {
    tenant: TenantId,
    notifier: ChangeNotifier,
}

impl CommitObserver for TenantForwarder {
    fn on_commit(&self, records: &[ChangeRecord]) {
        self.notifier.publish(&self.tenant, records);
    }
}

impl ObserverFactory for ChangeNotifier {
    fn observer_for(&self, tenant: &TenantId) -> Arc<dyn CommitObserver> {
        Arc::new(TenantForwarder {
            tenant: tenant.clone(),
            notifier: self.clone(),
        })
    }
}
