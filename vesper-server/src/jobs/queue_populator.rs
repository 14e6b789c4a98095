//! Enrichment Queue Populator
//!
//! Turns committed inserts and updates into enrichment tasks. Deletes never
//! reach this subscriber. Reserved collections and collections without an
//! enrichment rule are skipped, as are the worker's own write-backs: changes
//! whose document still carries exactly the state the worker wrote.
//!
//! Batches touch the engine synchronously, so they run on the blocking pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use vesper_core::{
    is_reserved_collection, task_key, EnrichmentRule, TenantId, VesperError, VesperResult,
};
use vesper_events::{ChangeBatch, Subscription};
use vesper_storage::TenantRegistry;

use crate::services::EnrichmentTaskQueue;

#[derive(Debug, Default)]
pub struct QueuePopulatorMetrics {
    /// Change batches received
    pub batches: AtomicU64,

    /// Tasks enqueued
    pub enqueued: AtomicU64,

    /// Records ignored (reserved collection, no rule, or worker write-back)
    pub skipped: AtomicU64,

    /// Failures resolving metadata or writing the queue
    pub errors: AtomicU64,
}

impl QueuePopulatorMetrics {
    pub fn snapshot(&self) -> QueuePopulatorSnapshot {
        QueuePopulatorSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuePopulatorSnapshot {
    pub batches: u64,
    pub enqueued: u64,
    pub skipped: u64,
    pub errors: u64,
}

fn enrichment_rule(
    registry: &TenantRegistry,
    tenant: &TenantId,
    collection: &str,
) -> VesperResult<Option<EnrichmentRule>> {
    let engine = registry.resolve(tenant)?.engine()?;
    Ok(engine.collection_metadata(collection)?.enrichment)
}

/// Fingerprint of the document as it is now. Unreadable counts as changed.
fn current_fingerprint(
    registry: &TenantRegistry,
    tenant: &TenantId,
    collection: &str,
    document_id: &str,
    rule: &EnrichmentRule,
) -> Option<String> {
    let engine = registry.resolve(tenant).ok()?.engine().ok()?;
    let doc = engine.find_by_id(collection, document_id).ok()??;
    rule.fingerprint(&doc)
}

/// Enqueue the eligible records of one batch.
pub fn enqueue_batch(
    registry: &TenantRegistry,
    queue: &EnrichmentTaskQueue,
    batch: &ChangeBatch,
    metrics: &QueuePopulatorMetrics,
) {
    metrics.batches.fetch_add(1, Ordering::Relaxed);
    let mut rules: HashMap<&str, Option<EnrichmentRule>> = HashMap::new();

    for record in &batch.records {
        if !record.kind.carries_content() || is_reserved_collection(&record.collection) {
            metrics.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if !rules.contains_key(record.collection.as_str()) {
            match enrichment_rule(registry, &batch.tenant, &record.collection) {
                Ok(rule) => {
                    rules.insert(&record.collection, rule);
                }
                Err(VesperError::NotProvisioned { .. }) => {
                    metrics.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        tenant = %batch.tenant,
                        collection = %record.collection,
                        error = %e,
                        "Failed to read enrichment rule"
                    );
                    metrics.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
        }
        let Some(Some(rule)) = rules.get(record.collection.as_str()) else {
            metrics.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        };

        let key = task_key(&batch.tenant, &record.collection, &record.document_id);
        let echo = queue.take_echo(&key, || {
            current_fingerprint(
                registry,
                &batch.tenant,
                &record.collection,
                &record.document_id,
                rule,
            )
        });
        if echo {
            metrics.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        match queue.enqueue(&batch.tenant, &record.collection, &record.document_id) {
            Ok(_) => {
                metrics.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(
                    tenant = %batch.tenant,
                    collection = %record.collection,
                    document_id = %record.document_id,
                    error = %e,
                    "Failed to enqueue enrichment task"
                );
                metrics.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Feed the queue from a content-change subscription until shutdown.
pub async fn queue_populator_task(
    registry: Arc<TenantRegistry>,
    queue: Arc<EnrichmentTaskQueue>,
    mut subscription: Subscription,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<QueuePopulatorMetrics> {
    let metrics = Arc::new(QueuePopulatorMetrics::default());
    tracing::info!(subscription = subscription.id(), "Queue populator started");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Queue populator shutting down");
                    break;
                }
            }

            batch = subscription.recv() => {
                match batch {
                    Some(batch) => {
                        let registry = Arc::clone(&registry);
                        let queue = Arc::clone(&queue);
                        let task_metrics = Arc::clone(&metrics);
                        let handled = tokio::task::spawn_blocking(move || {
                            enqueue_batch(&registry, &queue, &batch, &task_metrics)
                        })
                        .await;
                        if let Err(e) = handled {
                            tracing::error!(error = %e, "Queue populator batch failed");
                            metrics.errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    subscription.cancel();
    let snapshot = metrics.snapshot();
    tracing::info!(
        batches = snapshot.batches,
        enqueued = snapshot.enqueued,
        skipped = snapshot.skipped,
        errors = snapshot.errors,
        "Queue populator completed"
    );
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::{
        ChangeKind, ChangeRecord, CollectionMetadata, Document, EnrichmentConfig, WriteOp,
    };
    use vesper_storage::MemoryEngineProvider;

    fn setup() -> (Arc<TenantRegistry>, EnrichmentTaskQueue, TenantId) {
        let registry =
            Arc::new(TenantRegistry::open(Arc::new(MemoryEngineProvider::new()), Vec::new()).unwrap());
        let acme = TenantId::new("acme");
        let engine = registry.provision(&acme).unwrap().engine().unwrap();
        engine
            .set_collection_metadata(
                "articles",
                CollectionMetadata {
                    indexes: Vec::new(),
                    enrichment: Some(EnrichmentRule::new(vec!["body".to_string()], "embedding")),
                },
            )
            .unwrap();
        let queue = EnrichmentTaskQueue::open(Arc::clone(&registry), &EnrichmentConfig::default())
            .unwrap();
        (registry, queue, acme)
    }

    #[test]
    fn test_only_rule_bearing_collections_are_queued() {
        let (registry, queue, acme) = setup();
        let metrics = QueuePopulatorMetrics::default();
        let batch = ChangeBatch {
            tenant: acme.clone(),
            records: vec![
                ChangeRecord::new(ChangeKind::Insert, "articles", "d1"),
                ChangeRecord::new(ChangeKind::Insert, "authors", "a1"),
                ChangeRecord::new(ChangeKind::Update, "_internal", "x"),
                ChangeRecord::new(ChangeKind::Delete, "articles", "d2"),
            ],
        };

        enqueue_batch(&registry, &queue, &batch, &metrics);
        assert_eq!(queue.tasks_for(&acme, "articles", "d1").unwrap().len(), 1);
        assert!(queue.tasks_for(&acme, "authors", "a1").unwrap().is_empty());
        assert!(queue.tasks_for(&acme, "articles", "d2").unwrap().is_empty());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.enqueued, 1);
        assert_eq!(snapshot.skipped, 3);
    }

    fn rule() -> EnrichmentRule {
        EnrichmentRule::new(vec!["body".to_string()], "embedding")
    }

    fn write(registry: &TenantRegistry, tenant: &TenantId, doc: Document) -> Document {
        let engine = registry.resolve(tenant).unwrap().engine().unwrap();
        engine
            .apply(vec![WriteOp::Insert {
                collection: "articles".to_string(),
                doc: doc.clone(),
            }])
            .unwrap();
        doc
    }

    fn update(tenant: &TenantId) -> ChangeBatch {
        ChangeBatch {
            tenant: tenant.clone(),
            records: vec![ChangeRecord::new(ChangeKind::Update, "articles", "d1")],
        }
    }

    #[test]
    fn test_worker_echo_is_not_requeued() {
        let (registry, queue, acme) = setup();
        let metrics = QueuePopulatorMetrics::default();
        let written = write(
            &registry,
            &acme,
            Document::new("d1")
                .with_field("body", "hello")
                .with_field("embedding", serde_json::json!([0.5])),
        );
        let key = task_key(&acme, "articles", "d1");
        queue.expect_echo(key, rule().fingerprint(&written).unwrap());

        enqueue_batch(&registry, &queue, &update(&acme), &metrics);
        assert!(queue.tasks_for(&acme, "articles", "d1").unwrap().is_empty());
        assert_eq!(queue.pending_echoes(), 0);

        // A later user update is queued normally.
        enqueue_batch(&registry, &queue, &update(&acme), &metrics);
        assert_eq!(queue.tasks_for(&acme, "articles", "d1").unwrap().len(), 1);
    }

    #[test]
    fn test_unconsumed_echo_does_not_hide_a_real_edit() {
        let (registry, queue, acme) = setup();
        let metrics = QueuePopulatorMetrics::default();
        let written = Document::new("d1")
            .with_field("body", "hello")
            .with_field("embedding", serde_json::json!([0.5]));
        let key = task_key(&acme, "articles", "d1");
        queue.expect_echo(key, rule().fingerprint(&written).unwrap());

        // The write-back's own change never arrived; the user edits first.
        write(&registry, &acme, written.with_field("body", "brand new body"));
        enqueue_batch(&registry, &queue, &update(&acme), &metrics);
        assert_eq!(queue.tasks_for(&acme, "articles", "d1").unwrap().len(), 1);
        assert_eq!(metrics.snapshot().enqueued, 1);
    }

    #[test]
    fn test_unprovisioned_tenant_is_skipped() {
        let (registry, queue, _acme) = setup();
        let metrics = QueuePopulatorMetrics::default();
        let batch = ChangeBatch {
            tenant: TenantId::new("ghost"),
            records: vec![ChangeRecord::new(ChangeKind::Insert, "articles", "d1")],
        };
        enqueue_batch(&registry, &queue, &batch, &metrics);
        assert_eq!(metrics.snapshot().errors, 0);
        assert_eq!(queue.stats().unwrap().outstanding(), 0);
    }
}
