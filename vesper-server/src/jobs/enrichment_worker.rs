//! Enrichment Worker Background Task
//!
//! Each cycle claims a batch from the enrichment queue and groups it by
//! tenant. For every group it first computes embeddings with no lock held,
//! then writes all results back in one short coordinator transaction.
//!
//! - "Nothing to do" (document gone, no rule, no text, empty vector, source
//!   edited since the compute, target already holding the vector) is a
//!   terminal state: the task is completed without a write.
//! - A failed compute leaves only that task in progress. A vector with a
//!   non-finite component counts as a failed compute.
//! - A failed write-back rolls the whole group back and leaves every task
//!   in progress; they become stale and are claimed again later.
//!
//! Queue operations and the write-back commit run on the blocking pool.
//! Compute-phase reads are short snapshot reads and stay on the async thread.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Number, Value};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use vesper_core::{
    Document, EngineError, EnrichmentConfig, EnrichmentRule, EnrichmentTask, TenantId,
    VesperError, VesperResult,
};
use vesper_llm::EmbeddingProvider;
use vesper_storage::{StorageEngine, TenantRegistry};

use crate::constants::ENRICHMENT_WORKER_OWNER;
use crate::services::{EnrichmentTaskQueue, TransactionCoordinator};

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct EnrichmentMetrics {
    /// Total cycles run
    pub cycles: AtomicU64,

    /// Tasks claimed from the queue
    pub claimed: AtomicU64,

    /// Documents whose enrichment was written back
    pub enriched: AtomicU64,

    /// Tasks completed without a write
    pub no_ops: AtomicU64,

    /// Compute or write-back failures
    pub errors: AtomicU64,

    /// Done tasks removed after retention
    pub purged: AtomicU64,
}

impl EnrichmentMetrics {
    pub fn snapshot(&self) -> EnrichmentSnapshot {
        EnrichmentSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            enriched: self.enriched.load(Ordering::Relaxed),
            no_ops: self.no_ops.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentSnapshot {
    pub cycles: u64,
    pub claimed: u64,
    pub enriched: u64,
    pub no_ops: u64,
    pub errors: u64,
    pub purged: u64,
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub enriched: usize,
    pub no_ops: usize,
    /// Tasks left in progress for a later retry
    pub deferred: usize,
    pub purged: usize,
}

impl CycleReport {
    fn absorb(&mut self, group: GroupReport) {
        self.enriched += group.enriched;
        self.no_ops += group.no_ops;
        self.deferred += group.deferred;
    }
}

#[derive(Debug, Default)]
struct GroupReport {
    enriched: usize,
    no_ops: usize,
    deferred: usize,
}

/// A computed result waiting to be written back.
struct Pending {
    task: EnrichmentTask,
    rule: EnrichmentRule,
    /// Source text the vector was computed from
    text: String,
    value: Value,
}

// ============================================================================
// WORKER
// ============================================================================

pub struct EnrichmentWorker {
    registry: Arc<TenantRegistry>,
    coordinator: TransactionCoordinator,
    queue: Arc<EnrichmentTaskQueue>,
    provider: Arc<dyn EmbeddingProvider>,
    config: EnrichmentConfig,
    metrics: Arc<EnrichmentMetrics>,
}

impl EnrichmentWorker {
    pub fn new(
        registry: Arc<TenantRegistry>,
        coordinator: TransactionCoordinator,
        queue: Arc<EnrichmentTaskQueue>,
        provider: Arc<dyn EmbeddingProvider>,
        config: EnrichmentConfig,
    ) -> Self {
        Self {
            registry,
            coordinator,
            queue,
            provider,
            config,
            metrics: Arc::new(EnrichmentMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<EnrichmentMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run one claim, compute, persist and purge cycle.
    pub async fn run_cycle(&self) -> VesperResult<CycleReport> {
        self.metrics.cycles.fetch_add(1, Ordering::Relaxed);
        let batch_size = self.config.batch_size;
        let tasks = self
            .on_queue(move |queue| queue.take_batch(batch_size))
            .await?;
        let mut report = CycleReport {
            claimed: tasks.len(),
            ..CycleReport::default()
        };
        self.metrics
            .claimed
            .fetch_add(tasks.len() as u64, Ordering::Relaxed);

        let mut groups: BTreeMap<TenantId, Vec<EnrichmentTask>> = BTreeMap::new();
        for task in tasks {
            groups.entry(task.tenant.clone()).or_default().push(task);
        }
        for (tenant, tasks) in groups {
            let group = self.process_group(&tenant, tasks).await;
            report.absorb(group);
        }

        let retention = self.config.retention_chrono();
        self.queue.prune_echoes(retention);
        match self.on_queue(move |queue| queue.purge_done(retention)).await {
            Ok(purged) => {
                report.purged = purged;
                self.metrics
                    .purged
                    .fetch_add(purged as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Failed to purge done enrichment tasks");
            }
        }

        if report.claimed > 0 || report.purged > 0 {
            tracing::info!(
                claimed = report.claimed,
                enriched = report.enriched,
                no_ops = report.no_ops,
                deferred = report.deferred,
                purged = report.purged,
                "Enrichment cycle completed"
            );
        } else {
            tracing::trace!("Enrichment cycle found no work");
        }
        Ok(report)
    }

    /// Run a queue operation on the blocking pool.
    async fn on_queue<T, F>(&self, op: F) -> VesperResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&EnrichmentTaskQueue) -> VesperResult<T> + Send + 'static,
    {
        let queue = Arc::clone(&self.queue);
        tokio::task::spawn_blocking(move || op(&queue))
            .await
            .map_err(|e| EngineError::backend(format!("queue task failed: {}", e)))?
    }

    async fn complete(&self, ids: &[String]) -> bool {
        let owned = ids.to_vec();
        match self.on_queue(move |queue| queue.complete(&owned)).await {
            Ok(_) => true,
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, tasks = ids.len(), "Failed to complete enrichment tasks");
                false
            }
        }
    }

    async fn process_group(&self, tenant: &TenantId, tasks: Vec<EnrichmentTask>) -> GroupReport {
        let mut report = GroupReport::default();
        let engine = match self
            .registry
            .resolve(tenant)
            .and_then(|handle| handle.engine())
        {
            Ok(engine) => engine,
            Err(VesperError::NotProvisioned { .. }) => {
                // The tenant is gone; nothing left to enrich.
                let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
                if self.complete(&ids).await {
                    report.no_ops = ids.len();
                    self.metrics
                        .no_ops
                        .fetch_add(ids.len() as u64, Ordering::Relaxed);
                } else {
                    report.deferred = ids.len();
                }
                return report;
            }
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(tenant = %tenant, error = %e, "Cannot open tenant for enrichment");
                report.deferred = tasks.len();
                return report;
            }
        };

        let (pending, mut no_ops, deferred) = self.compute(tenant, engine.as_ref(), tasks).await;
        report.deferred += deferred;

        let mut written = Vec::new();
        if !pending.is_empty() {
            match self.persist(tenant, &pending).await {
                Ok((enriched, unchanged)) => {
                    written = enriched;
                    no_ops.extend(unchanged);
                }
                Err(e) => {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        tenant = %tenant,
                        tasks = pending.len() + no_ops.len(),
                        error = %e,
                        "Enrichment write-back failed; tasks left for retry"
                    );
                    report.deferred += pending.len() + no_ops.len();
                    return report;
                }
            }
        }

        let ids: Vec<String> = written.iter().chain(no_ops.iter()).cloned().collect();
        if self.complete(&ids).await {
            report.enriched = written.len();
            report.no_ops = no_ops.len();
            self.metrics
                .enriched
                .fetch_add(written.len() as u64, Ordering::Relaxed);
            self.metrics
                .no_ops
                .fetch_add(no_ops.len() as u64, Ordering::Relaxed);
        } else {
            report.deferred += ids.len();
        }
        report
    }

    /// Compute embeddings outside any transaction.
    ///
    /// Returns the results to write, the ids of no-op tasks, and how many
    /// tasks failed to compute.
    async fn compute(
        &self,
        tenant: &TenantId,
        engine: &dyn StorageEngine,
        tasks: Vec<EnrichmentTask>,
    ) -> (Vec<Pending>, Vec<String>, usize) {
        let mut rules: HashMap<String, Option<EnrichmentRule>> = HashMap::new();
        let mut pending = Vec::new();
        let mut no_ops = Vec::new();
        let mut failed = 0;

        for task in tasks {
            let rule = match rules.get(&task.collection) {
                Some(rule) => rule.clone(),
                None => match engine.collection_metadata(&task.collection) {
                    Ok(metadata) => {
                        rules.insert(task.collection.clone(), metadata.enrichment.clone());
                        metadata.enrichment
                    }
                    Err(e) => {
                        failed += 1;
                        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(tenant = %tenant, collection = %task.collection, error = %e, "Failed to read collection metadata");
                        continue;
                    }
                },
            };
            let Some(rule) = rule else {
                no_ops.push(task.id);
                continue;
            };

            let doc = match engine.find_by_id(&task.collection, &task.document_id) {
                Ok(Some(doc)) => doc,
                Ok(None) => {
                    no_ops.push(task.id);
                    continue;
                }
                Err(e) => {
                    failed += 1;
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(tenant = %tenant, document_id = %task.document_id, error = %e, "Failed to load document");
                    continue;
                }
            };
            let Some(text) = rule.source_text(&doc) else {
                no_ops.push(task.id);
                continue;
            };

            match self.provider.embed(&text).await {
                Ok(vector) if vector.is_empty() => no_ops.push(task.id),
                Ok(vector) => match vector_value(&vector) {
                    Some(value) => pending.push(Pending {
                        task,
                        rule,
                        text,
                        value,
                    }),
                    None => {
                        failed += 1;
                        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            tenant = %tenant,
                            collection = %task.collection,
                            document_id = %task.document_id,
                            "Embedding has a non-finite component; task left for retry"
                        );
                    }
                },
                Err(e) => {
                    failed += 1;
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        tenant = %tenant,
                        collection = %task.collection,
                        document_id = %task.document_id,
                        error = %e,
                        "Embedding failed; task left for retry"
                    );
                }
            }
        }
        (pending, no_ops, failed)
    }

    /// Write every result back in one transaction.
    ///
    /// Returns the ids written and the ids that needed no write: the document
    /// vanished, its source text changed since the compute phase, or the
    /// target already holds the vector.
    async fn persist(
        &self,
        tenant: &TenantId,
        pending: &[Pending],
    ) -> VesperResult<(Vec<String>, Vec<String>)> {
        let owner = ENRICHMENT_WORKER_OWNER;
        let token = self.coordinator.begin(owner, tenant).await?;

        let mut written = Vec::new();
        let mut unchanged = Vec::new();
        let mut echoes: Vec<(String, String)> = Vec::new();
        let staged: VesperResult<()> = async {
            for item in pending {
                let task = &item.task;
                let current = self
                    .coordinator
                    .find(&token, owner, &task.collection, &task.document_id)
                    .await?;
                let Some(mut doc): Option<Document> = current else {
                    unchanged.push(task.id.clone());
                    continue;
                };
                // An edit since the compute queued a fresh task.
                if item.rule.source_text(&doc).as_deref() != Some(item.text.as_str())
                    || doc.get(&item.rule.target_field) == Some(&item.value)
                {
                    unchanged.push(task.id.clone());
                    continue;
                }
                doc.set(item.rule.target_field.clone(), item.value.clone());
                if let Some(fingerprint) = item.rule.fingerprint(&doc) {
                    echoes.push((task.key(), fingerprint));
                }
                self.coordinator
                    .update(&token, owner, &task.collection, doc)
                    .await?;
                written.push(task.id.clone());
            }
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            if let Err(rollback_err) = self.coordinator.rollback(&token, owner).await {
                tracing::warn!(tenant = %tenant, error = %rollback_err, "Rollback after failed write-back also failed");
            }
            return Err(e);
        }

        for (key, fingerprint) in &echoes {
            self.queue.expect_echo(key.clone(), fingerprint.clone());
        }
        if let Err(e) = self.coordinator.commit(&token, owner).await {
            for (key, fingerprint) in &echoes {
                self.queue.cancel_echo(key, fingerprint);
            }
            return Err(e);
        }
        Ok((written, unchanged))
    }
}

/// Encode a vector as a JSON array of numbers.
///
/// Each component is written with its shortest `f32` representation, so
/// `0.1f32` is stored as `0.1`. Returns `None` if any component is NaN or
/// infinite.
fn vector_value(vector: &[f32]) -> Option<Value> {
    vector
        .iter()
        .map(|f| {
            let shortest: f64 = f.to_string().parse().ok()?;
            Number::from_f64(shortest).map(Value::Number)
        })
        .collect::<Option<Vec<Value>>>()
        .map(Value::Array)
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run enrichment cycles until the shutdown signal is received.
pub async fn enrichment_worker_task(
    worker: EnrichmentWorker,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<EnrichmentMetrics> {
    let mut cycle_interval = interval(worker.config.interval);
    cycle_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = worker.config.interval.as_secs(),
        batch_size = worker.config.batch_size,
        model = worker.provider.model_id(),
        "Enrichment worker started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Enrichment worker shutting down");
                    break;
                }
            }

            _ = cycle_interval.tick() => {
                if let Err(e) = worker.run_cycle().await {
                    worker.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(error = %e, "Enrichment cycle failed");
                }
            }
        }
    }

    let snapshot = worker.metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        claimed = snapshot.claimed,
        enriched = snapshot.enriched,
        no_ops = snapshot.no_ops,
        errors = snapshot.errors,
        purged = snapshot.purged,
        "Enrichment worker completed"
    );
    worker.metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_value_keeps_f32_digits() {
        let value = vector_value(&[0.1, 0.2, 0.3, -1.5, 0.0]).unwrap();
        assert_eq!(value, serde_json::json!([0.1, 0.2, 0.3, -1.5, 0.0]));
        assert_eq!(value.to_string(), "[0.1,0.2,0.3,-1.5,0.0]");

        let mut doc = Document::new("d1");
        doc.set("embedding", value);
        assert_eq!(doc.vector_field("embedding"), Some(vec![0.1, 0.2, 0.3, -1.5, 0.0]));
    }

    #[test]
    fn test_vector_value_rejects_non_finite() {
        assert!(vector_value(&[0.1, f32::NAN]).is_none());
        assert!(vector_value(&[f32::INFINITY]).is_none());
        assert_eq!(vector_value(&[]), Some(Value::Array(Vec::new())));
    }

    #[test]
    fn test_cycle_report_absorbs_groups() {
        let mut report = CycleReport::default();
        report.absorb(GroupReport {
            enriched: 2,
            no_ops: 1,
            deferred: 0,
        });
        report.absorb(GroupReport {
            enriched: 0,
            no_ops: 0,
            deferred: 3,
        });
        assert_eq!(report.enriched, 2);
        assert_eq!(report.no_ops, 1);
        assert_eq!(report.deferred, 3);
    }
}
