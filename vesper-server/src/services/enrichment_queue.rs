//! Enrichment Task Queue
//!
//! Persistent, deduplicating queue of per-document enrichment work, stored
//! as documents in the system tenant's `_enrichment_queue` collection with
//! secondary indexes on the task key and status.
//!
//! Every operation is one atomic engine batch taken under the queue's own
//! lock, so two callers can never claim the same task. Operations block on
//! engine I/O; async callers run them on the blocking pool.
//!
//! The queue also keeps the echo ledger: for each document the worker has
//! just written, the fingerprint of the state it wrote. A later change whose
//! document still has that fingerprint is the worker's own write-back and is
//! not queued again. Any other change is queued normally, so an unconsumed
//! entry can never hide genuine work.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;
use vesper_core::{
    task_key, validate_collection_name, validate_document_id, CollectionMetadata,
    EffectiveStatus, EngineError, EnrichmentConfig, EnrichmentTask, TaskStatus, TenantId,
    Timestamp, VesperError, VesperResult, WriteOp,
};
use vesper_storage::{StorageEngine, TenantRegistry};

use crate::constants::{QUEUE_COLLECTION, QUEUE_KEY_FIELD, QUEUE_STATUS_FIELD};

/// Task counts by effective status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub todo: u64,
    pub in_progress: u64,
    pub stale: u64,
    pub done: u64,
}

impl QueueStats {
    /// Tasks not yet done, stale ones included.
    pub fn outstanding(&self) -> u64 {
        self.todo + self.in_progress + self.stale
    }
}

/// State the worker wrote to one document.
#[derive(Debug, Clone)]
struct Echo {
    fingerprint: String,
    recorded_at: Timestamp,
}

pub struct EnrichmentTaskQueue {
    registry: Arc<TenantRegistry>,
    stale_after: ChronoDuration,
    lock: Mutex<()>,
    /// Task key to the fingerprint of the worker's latest write.
    echoes: DashMap<String, Echo>,
}

impl EnrichmentTaskQueue {
    /// Open the queue, registering its indexes if missing.
    pub fn open(registry: Arc<TenantRegistry>, config: &EnrichmentConfig) -> VesperResult<Self> {
        let queue = Self {
            registry,
            stale_after: config.stale_after_chrono(),
            lock: Mutex::new(()),
            echoes: DashMap::new(),
        };
        let engine = queue.engine()?;
        let metadata = engine.collection_metadata(QUEUE_COLLECTION)?;
        if !metadata.is_indexed(QUEUE_KEY_FIELD) || !metadata.is_indexed(QUEUE_STATUS_FIELD) {
            engine.set_collection_metadata(
                QUEUE_COLLECTION,
                CollectionMetadata {
                    indexes: vec![QUEUE_KEY_FIELD.to_string(), QUEUE_STATUS_FIELD.to_string()],
                    enrichment: None,
                },
            )?;
            tracing::debug!(collection = QUEUE_COLLECTION, "Enrichment queue indexes registered");
        }
        Ok(queue)
    }

    pub fn stale_after(&self) -> ChronoDuration {
        self.stale_after
    }

    fn engine(&self) -> VesperResult<Arc<dyn StorageEngine>> {
        self.registry.system().engine()
    }

    fn guard(&self) -> VesperResult<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| VesperError::from(EngineError::LockPoisoned))
    }

    fn decode_all(docs: Vec<vesper_core::Document>) -> Vec<EnrichmentTask> {
        docs.iter()
            .filter_map(|doc| match EnrichmentTask::from_document(doc) {
                Ok(task) => Some(task),
                Err(e) => {
                    tracing::warn!(id = %doc.id, error = %e, "Skipping undecodable queue record");
                    None
                }
            })
            .collect()
    }

    fn with_status(
        engine: &dyn StorageEngine,
        status: TaskStatus,
    ) -> VesperResult<Vec<EnrichmentTask>> {
        let docs = engine.find_by_field(
            QUEUE_COLLECTION,
            QUEUE_STATUS_FIELD,
            &Value::String(status.as_db_str().to_string()),
        )?;
        Ok(Self::decode_all(docs))
    }

    fn with_key(engine: &dyn StorageEngine, key: &str) -> VesperResult<Vec<EnrichmentTask>> {
        let docs = engine.find_by_field(
            QUEUE_COLLECTION,
            QUEUE_KEY_FIELD,
            &Value::String(key.to_string()),
        )?;
        Ok(Self::decode_all(docs))
    }

    /// Queue a document for enrichment, replacing any outstanding task.
    pub fn enqueue(
        &self,
        tenant: &TenantId,
        collection: &str,
        document_id: &str,
    ) -> VesperResult<EnrichmentTask> {
        self.enqueue_at(tenant, collection, document_id, Utc::now())
    }

    pub fn enqueue_at(
        &self,
        tenant: &TenantId,
        collection: &str,
        document_id: &str,
        now: Timestamp,
    ) -> VesperResult<EnrichmentTask> {
        tenant.validate()?;
        validate_collection_name(collection)?;
        if document_id.is_empty() {
            return Err(VesperError::invalid_argument("document_id", "must not be empty"));
        }
        validate_document_id(document_id)?;

        let _guard = self.guard()?;
        let engine = self.engine()?;
        let key = task_key(tenant, collection, document_id);

        let mut ops: Vec<WriteOp> = Self::with_key(engine.as_ref(), &key)?
            .into_iter()
            .filter(|t| t.status != TaskStatus::Done)
            .map(|t| WriteOp::Delete {
                collection: QUEUE_COLLECTION.to_string(),
                id: t.id,
            })
            .collect();
        let replaced = ops.len();

        let task = EnrichmentTask {
            id: Uuid::now_v7().to_string(),
            tenant: tenant.clone(),
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            status: TaskStatus::Todo,
            enqueued_at: now,
            transitioned_at: now,
        };
        ops.push(WriteOp::Insert {
            collection: QUEUE_COLLECTION.to_string(),
            doc: task.to_document()?,
        });
        engine.apply(ops)?;

        tracing::trace!(tenant = %tenant, collection, document_id, replaced, "Enrichment task queued");
        Ok(task)
    }

    /// Claim up to `max` todo or stale tasks, oldest first.
    pub fn take_batch(&self, max: usize) -> VesperResult<Vec<EnrichmentTask>> {
        self.take_batch_at(max, Utc::now())
    }

    pub fn take_batch_at(&self, max: usize, now: Timestamp) -> VesperResult<Vec<EnrichmentTask>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.guard()?;
        let engine = self.engine()?;

        let mut claimable = Self::with_status(engine.as_ref(), TaskStatus::Todo)?;
        claimable.extend(
            Self::with_status(engine.as_ref(), TaskStatus::InProgress)?
                .into_iter()
                .filter(|t| t.effective_status(now, self.stale_after) == EffectiveStatus::Stale),
        );
        claimable.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        claimable.truncate(max);
        if claimable.is_empty() {
            return Ok(claimable);
        }

        let mut ops = Vec::with_capacity(claimable.len());
        for task in &mut claimable {
            task.transition(TaskStatus::InProgress, now);
            ops.push(WriteOp::Update {
                collection: QUEUE_COLLECTION.to_string(),
                doc: task.to_document()?,
            });
        }
        engine.apply(ops)?;
        tracing::debug!(claimed = claimable.len(), "Enrichment batch claimed");
        Ok(claimable)
    }

    /// Mark tasks done. Unknown or already-done ids are ignored.
    ///
    /// Returns how many tasks changed state.
    pub fn complete(&self, ids: &[String]) -> VesperResult<usize> {
        self.complete_at(ids, Utc::now())
    }

    pub fn complete_at(&self, ids: &[String], now: Timestamp) -> VesperResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let _guard = self.guard()?;
        let engine = self.engine()?;

        let mut ops = Vec::new();
        for id in ids {
            let Some(doc) = engine.find_by_id(QUEUE_COLLECTION, id)? else {
                continue;
            };
            let mut task = EnrichmentTask::from_document(&doc)?;
            if task.status == TaskStatus::Done {
                continue;
            }
            task.transition(TaskStatus::Done, now);
            ops.push(WriteOp::Update {
                collection: QUEUE_COLLECTION.to_string(),
                doc: task.to_document()?,
            });
        }
        let completed = ops.len();
        if completed > 0 {
            engine.apply(ops)?;
        }
        Ok(completed)
    }

    /// Delete done tasks older than the retention window.
    pub fn purge_done(&self, retention: ChronoDuration) -> VesperResult<usize> {
        self.purge_done_at(retention, Utc::now())
    }

    pub fn purge_done_at(&self, retention: ChronoDuration, now: Timestamp) -> VesperResult<usize> {
        let _guard = self.guard()?;
        let engine = self.engine()?;

        let ops: Vec<WriteOp> = Self::with_status(engine.as_ref(), TaskStatus::Done)?
            .into_iter()
            .filter(|t| now - t.transitioned_at > retention)
            .map(|t| WriteOp::Delete {
                collection: QUEUE_COLLECTION.to_string(),
                id: t.id,
            })
            .collect();
        let purged = ops.len();
        if purged > 0 {
            engine.apply(ops)?;
            tracing::debug!(purged, "Purged done enrichment tasks");
        }
        Ok(purged)
    }

    /// Every stored task for one document, done ones included.
    pub fn tasks_for(
        &self,
        tenant: &TenantId,
        collection: &str,
        document_id: &str,
    ) -> VesperResult<Vec<EnrichmentTask>> {
        let engine = self.engine()?;
        let mut tasks = Self::with_key(engine.as_ref(), &task_key(tenant, collection, document_id))?;
        tasks.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(tasks)
    }

    pub fn stats(&self) -> VesperResult<QueueStats> {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: Timestamp) -> VesperResult<QueueStats> {
        let engine = self.engine()?;
        let mut stats = QueueStats::default();
        for task in Self::decode_all(engine.scan(QUEUE_COLLECTION)?) {
            match task.effective_status(now, self.stale_after) {
                EffectiveStatus::Todo => stats.todo += 1,
                EffectiveStatus::InProgress => stats.in_progress += 1,
                EffectiveStatus::Stale => stats.stale += 1,
                EffectiveStatus::Done => stats.done += 1,
            }
        }
        Ok(stats)
    }

    /// Outstanding task counts per tenant.
    pub fn outstanding_by_tenant(&self) -> VesperResult<BTreeMap<TenantId, u64>> {
        let engine = self.engine()?;
        let mut counts = BTreeMap::new();
        for task in Self::decode_all(engine.scan(QUEUE_COLLECTION)?) {
            if task.status != TaskStatus::Done {
                *counts.entry(task.tenant).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Record the state the worker is about to write to a document.
    pub(crate) fn expect_echo(&self, key: String, fingerprint: String) {
        self.expect_echo_at(key, fingerprint, Utc::now());
    }

    pub(crate) fn expect_echo_at(&self, key: String, fingerprint: String, now: Timestamp) {
        self.echoes.insert(
            key,
            Echo {
                fingerprint,
                recorded_at: now,
            },
        );
    }

    /// Forget an expected write that never committed.
    pub(crate) fn cancel_echo(&self, key: &str, fingerprint: &str) {
        self.echoes
            .remove_if(key, |_, echo| echo.fingerprint == fingerprint);
    }

    /// Settle a change to `key` against the ledger.
    ///
    /// Returns true when the change is the worker's own write-back: an entry
    /// exists and `current` yields its fingerprint. The entry is consumed
    /// either way. `current` is only called when an entry exists.
    pub(crate) fn take_echo(&self, key: &str, current: impl FnOnce() -> Option<String>) -> bool {
        match self.echoes.remove(key) {
            Some((_, echo)) => current().as_deref() == Some(echo.fingerprint.as_str()),
            None => false,
        }
    }

    /// Drop ledger entries older than `older_than`. Returns how many.
    pub fn prune_echoes(&self, older_than: ChronoDuration) -> usize {
        self.prune_echoes_at(older_than, Utc::now())
    }

    pub fn prune_echoes_at(&self, older_than: ChronoDuration, now: Timestamp) -> usize {
        let before = self.echoes.len();
        self.echoes
            .retain(|_, echo| now - echo.recorded_at <= older_than);
        before.saturating_sub(self.echoes.len())
    }

    /// Number of unsettled ledger entries.
    pub fn pending_echoes(&self) -> usize {
        self.echoes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vesper_storage::MemoryEngineProvider;

    fn queue() -> EnrichmentTaskQueue {
        let registry =
            Arc::new(TenantRegistry::open(Arc::new(MemoryEngineProvider::new()), Vec::new()).unwrap());
        let config = EnrichmentConfig {
            stale_after: std::time::Duration::from_secs(600),
            ..EnrichmentConfig::default()
        };
        EnrichmentTaskQueue::open(registry, &config).unwrap()
    }

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_enqueue_replaces_outstanding_task() {
        let queue = queue();
        let acme = TenantId::new("acme");
        let first = queue.enqueue_at(&acme, "articles", "d1", at(0)).unwrap();
        let second = queue.enqueue_at(&acme, "articles", "d1", at(1)).unwrap();
        assert_ne!(first.id, second.id);

        let tasks = queue.tasks_for(&acme, "articles", "d1").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, second.id);
        assert_eq!(tasks[0].status, TaskStatus::Todo);
    }

    #[test]
    fn test_enqueue_keeps_done_history() {
        let queue = queue();
        let acme = TenantId::new("acme");
        let first = queue.enqueue_at(&acme, "articles", "d1", at(0)).unwrap();
        queue.take_batch_at(10, at(1)).unwrap();
        queue.complete_at(&[first.id.clone()], at(2)).unwrap();
        queue.enqueue_at(&acme, "articles", "d1", at(3)).unwrap();

        let tasks = queue.tasks_for(&acme, "articles", "d1").unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Done);
        assert_eq!(tasks[1].status, TaskStatus::Todo);
    }

    #[test]
    fn test_take_batch_oldest_first_and_claims_once() {
        let queue = queue();
        let acme = TenantId::new("acme");
        queue.enqueue_at(&acme, "articles", "late", at(5)).unwrap();
        queue.enqueue_at(&acme, "articles", "early", at(1)).unwrap();
        queue.enqueue_at(&acme, "articles", "middle", at(3)).unwrap();

        let batch = queue.take_batch_at(2, at(10)).unwrap();
        let ids: Vec<&str> = batch.iter().map(|t| t.document_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "middle"]);
        assert!(batch
            .iter()
            .all(|t| t.status == TaskStatus::InProgress && t.transitioned_at == at(10)));

        let rest = queue.take_batch_at(10, at(11)).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].document_id, "late");
        assert!(queue.take_batch_at(10, at(12)).unwrap().is_empty());
    }

    #[test]
    fn test_stale_tasks_are_reclaimed() {
        let queue = queue();
        let acme = TenantId::new("acme");
        queue.enqueue_at(&acme, "articles", "d1", at(0)).unwrap();
        queue.take_batch_at(10, at(0)).unwrap();

        assert!(queue.take_batch_at(10, at(600)).unwrap().is_empty());
        assert_eq!(queue.stats_at(at(601)).unwrap().stale, 1);
        let reclaimed = queue.take_batch_at(10, at(601)).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].transitioned_at, at(601));
    }

    #[test]
    fn test_complete_is_idempotent() {
        let queue = queue();
        let acme = TenantId::new("acme");
        let task = queue.enqueue_at(&acme, "articles", "d1", at(0)).unwrap();
        queue.take_batch_at(10, at(1)).unwrap();

        let ids = vec![task.id.clone(), "unknown".to_string()];
        assert_eq!(queue.complete_at(&ids, at(2)).unwrap(), 1);
        assert_eq!(queue.complete_at(&ids, at(3)).unwrap(), 0);
        let stored = queue.tasks_for(&acme, "articles", "d1").unwrap();
        assert_eq!(stored[0].transitioned_at, at(2));
    }

    #[test]
    fn test_purge_done_respects_retention() {
        let queue = queue();
        let acme = TenantId::new("acme");
        let old = queue.enqueue_at(&acme, "articles", "old", at(0)).unwrap();
        let recent = queue.enqueue_at(&acme, "articles", "recent", at(0)).unwrap();
        queue.take_batch_at(10, at(1)).unwrap();
        queue.complete_at(&[old.id], at(10)).unwrap();
        queue.complete_at(&[recent.id], at(100)).unwrap();
        queue.enqueue_at(&acme, "articles", "pending", at(110)).unwrap();

        let purged = queue
            .purge_done_at(ChronoDuration::seconds(60), at(120))
            .unwrap();
        assert_eq!(purged, 1);
        let stats = queue.stats_at(at(120)).unwrap();
        assert_eq!(stats.done, 1);
        assert_eq!(stats.todo, 1);
    }

    #[test]
    fn test_echo_matches_only_the_written_state() {
        let queue = queue();
        queue.expect_echo("k".to_string(), "written".to_string());
        assert!(queue.take_echo("k", || Some("written".to_string())));
        assert!(!queue.take_echo("k", || Some("written".to_string())));

        queue.expect_echo("k".to_string(), "written".to_string());
        assert!(!queue.take_echo("k", || Some("edited".to_string())));
        assert_eq!(queue.pending_echoes(), 0);

        queue.expect_echo("k".to_string(), "written".to_string());
        queue.cancel_echo("k", "other");
        assert_eq!(queue.pending_echoes(), 1);
        queue.cancel_echo("k", "written");
        assert!(!queue.take_echo("k", || panic!("no entry to compare")));
    }

    #[test]
    fn test_unsettled_echoes_expire() {
        let queue = queue();
        queue.expect_echo_at("old".to_string(), "f".to_string(), at(0));
        queue.expect_echo_at("new".to_string(), "f".to_string(), at(100));
        assert_eq!(queue.prune_echoes_at(ChronoDuration::seconds(60), at(120)), 1);
        assert_eq!(queue.pending_echoes(), 1);
    }

    #[test]
    fn test_enqueue_rejects_unqueueable_keys() {
        let queue = queue();
        let acme = TenantId::new("acme");
        assert!(queue.enqueue(&TenantId::new("a/b"), "articles", "d1").is_err());
        assert!(queue.enqueue(&acme, "articles", "").is_err());
        assert!(queue.enqueue(&acme, "art\u{1f}icles", "d1").is_err());
        assert!(queue
            .enqueue(&acme, "articles", &"x".repeat(vesper_core::MAX_DOCUMENT_ID_LEN + 1))
            .is_err());
        assert_eq!(queue.stats().unwrap().outstanding(), 0);
    }

    #[test]
    fn test_outstanding_by_tenant() {
        let queue = queue();
        queue.enqueue(&TenantId::new("acme"), "articles", "d1").unwrap();
        queue.enqueue(&TenantId::new("acme"), "articles", "d2").unwrap();
        queue.enqueue(&TenantId::new("other"), "articles", "d1").unwrap();

        let counts = queue.outstanding_by_tenant().unwrap();
        assert_eq!(counts.get(&TenantId::new("acme")), Some(&2));
        assert_eq!(counts.get(&TenantId::new("other")), Some(&1));
        assert_eq!(queue.stats().unwrap().outstanding(), 3);
    }
}
