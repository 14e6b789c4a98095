//! In-memory storage engine.
//!
//! Same semantics as the LMDB engine, without durability. Used by tests and
//! by `VESPER_STORAGE=memory`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vesper_core::{
    ChangeKind, ChangeRecord, CollectionMetadata, Document, EngineError, TenantId, WriteOp,
};

use super::{
    CommitObserver, EngineProvider, EngineResult, EngineTransaction, StagedTransaction,
    StorageEngine,
};

/// Data owned by one in-memory store. Survives close/reopen.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MemoryStore {
    collections: HashMap<String, BTreeMap<String, Document>>,
    metadata: HashMap<String, CollectionMetadata>,
}

struct MemoryInner {
    store: Arc<RwLock<MemoryStore>>,
    observers: RwLock<Vec<Arc<dyn CommitObserver>>>,
    closed: AtomicBool,
}

/// In-memory engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<MemoryInner>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_store(Arc::new(RwLock::new(MemoryStore::default())))
    }

    fn with_store(store: Arc<RwLock<MemoryStore>>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                store,
                observers: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn notify(&self, records: &[ChangeRecord]) {
        if records.is_empty() {
            return;
        }
        let observers = match self.inner.observers.read() {
            Ok(observers) => observers.clone(),
            Err(_) => return,
        };
        for observer in observers {
            observer.on_commit(records);
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemoryEngine {
    fn begin(&self) -> EngineResult<Box<dyn EngineTransaction>> {
        self.ensure_open()?;
        Ok(Box::new(StagedTransaction::new(self.clone())))
    }

    fn find_by_id(&self, collection: &str, id: &str) -> EngineResult<Option<Document>> {
        self.ensure_open()?;
        let store = self.inner.store.read().map_err(|_| EngineError::LockPoisoned)?;
        Ok(store
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn scan(&self, collection: &str) -> EngineResult<Vec<Document>> {
        self.ensure_open()?;
        let store = self.inner.store.read().map_err(|_| EngineError::LockPoisoned)?;
        Ok(store
            .collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> EngineResult<Vec<Document>> {
        Ok(self
            .scan(collection)?
            .into_iter()
            .filter(|doc| doc.get(field) == Some(value))
            .collect())
    }

    fn apply(&self, ops: Vec<WriteOp>) -> EngineResult<Vec<ChangeRecord>> {
        self.ensure_open()?;
        let records = {
            let mut store = self.inner.store.write().map_err(|_| EngineError::LockPoisoned)?;

            // Work on copies of the touched collections so a failing op
            // leaves the store untouched.
            let mut touched: HashMap<String, BTreeMap<String, Document>> = HashMap::new();
            let mut records = Vec::with_capacity(ops.len());

            for op in ops {
                let collection = op.collection().to_string();
                let docs = touched.entry(collection.clone()).or_insert_with(|| {
                    store.collections.get(&collection).cloned().unwrap_or_default()
                });
                match op {
                    WriteOp::Insert { doc, .. } => {
                        if docs.contains_key(&doc.id) {
                            return Err(EngineError::DuplicateId {
                                collection,
                                id: doc.id,
                            });
                        }
                        records.push(ChangeRecord::new(ChangeKind::Insert, &collection, &doc.id));
                        docs.insert(doc.id.clone(), doc);
                    }
                    WriteOp::Update { doc, .. } => {
                        if !docs.contains_key(&doc.id) {
                            return Err(EngineError::DocumentNotFound {
                                collection,
                                id: doc.id,
                            });
                        }
                        records.push(ChangeRecord::new(ChangeKind::Update, &collection, &doc.id));
                        docs.insert(doc.id.clone(), doc);
                    }
                    WriteOp::Delete { id, .. } => {
                        if docs.remove(&id).is_some() {
                            records.push(ChangeRecord::new(ChangeKind::Delete, &collection, &id));
                        }
                    }
                }
            }

            for (collection, docs) in touched {
                store.collections.insert(collection, docs);
            }
            records
        };

        self.notify(&records);
        Ok(records)
    }

    fn collection_metadata(&self, collection: &str) -> EngineResult<CollectionMetadata> {
        self.ensure_open()?;
        let store = self.inner.store.read().map_err(|_| EngineError::LockPoisoned)?;
        Ok(store.metadata.get(collection).cloned().unwrap_or_default())
    }

    fn set_collection_metadata(
        &self,
        collection: &str,
        metadata: CollectionMetadata,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        let mut store = self.inner.store.write().map_err(|_| EngineError::LockPoisoned)?;
        store.metadata.insert(collection.to_string(), metadata);
        Ok(())
    }

    fn observe(&self, observer: Arc<dyn CommitObserver>) {
        if let Ok(mut observers) = self.inner.observers.write() {
            observers.push(observer);
        }
    }

    fn backup_to(&self, dest: &Path) -> EngineResult<()> {
        self.ensure_open()?;
        let bytes = {
            let store = self.inner.store.read().map_err(|_| EngineError::LockPoisoned)?;
            serde_json::to_vec(&*store).map_err(|e| EngineError::Serialization {
                reason: e.to_string(),
            })?
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::io(e.to_string()))?;
        }
        std::fs::write(dest, bytes).map_err(|e| EngineError::io(e.to_string()))
    }

    fn close(&self) -> EngineResult<()> {
        self.inner.closed.store(true, Ordering::Release);
        if let Ok(mut observers) = self.inner.observers.write() {
            observers.clear();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Keeps in-memory stores by tenant so they survive close and reopen.
#[derive(Default)]
pub struct MemoryEngineProvider {
    stores: DashMap<TenantId, Arc<RwLock<MemoryStore>>>,
}

impl MemoryEngineProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EngineProvider for MemoryEngineProvider {
    fn exists(&self, tenant: &TenantId) -> bool {
        self.stores.contains_key(tenant)
    }

    fn open(&self, tenant: &TenantId) -> EngineResult<Arc<dyn StorageEngine>> {
        let store = self
            .stores
            .get(tenant)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| EngineError::io(format!("no in-memory store for {}", tenant)))?;
        Ok(Arc::new(MemoryEngine::with_store(store)))
    }

    fn create(&self, tenant: &TenantId) -> EngineResult<Arc<dyn StorageEngine>> {
        let store = Arc::clone(
            self.stores
                .entry(tenant.clone())
                .or_insert_with(|| Arc::new(RwLock::new(MemoryStore::default())))
                .value(),
        );
        Ok(Arc::new(MemoryEngine::with_store(store)))
    }

    fn discover(&self) -> EngineResult<Vec<TenantId>> {
        let mut tenants: Vec<TenantId> = self
            .stores
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|tenant| !tenant.is_system())
            .collect();
        tenants.sort();
        Ok(tenants)
    }

    fn delete_files(&self, tenant: &TenantId) -> EngineResult<()> {
        self.stores.remove(tenant);
        Ok(())
    }

    fn location(&self, tenant: &TenantId) -> PathBuf {
        if tenant.is_system() {
            PathBuf::from("memory://system")
        } else {
            PathBuf::from(format!("memory://tenants/{}", tenant.as_str()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        seen: Mutex<Vec<ChangeRecord>>,
    }

    impl CommitObserver for RecordingObserver {
        fn on_commit(&self, records: &[ChangeRecord]) {
            self.seen.lock().unwrap().extend_from_slice(records);
        }
    }

    fn doc(id: &str, title: &str) -> Document {
        Document::new(id).with_field("title", title)
    }

    #[test]
    fn test_insert_find_update_delete() {
        let engine = MemoryEngine::new();
        engine.insert("articles", doc("d1", "a")).unwrap();
        assert_eq!(
            engine.find_by_id("articles", "d1").unwrap(),
            Some(doc("d1", "a"))
        );

        engine.update("articles", doc("d1", "b")).unwrap();
        assert_eq!(
            engine.find_by_id("articles", "d1").unwrap().unwrap().get("title"),
            Some(&Value::from("b"))
        );

        assert!(engine.delete("articles", "d1").unwrap());
        assert!(!engine.delete("articles", "d1").unwrap());
        assert_eq!(engine.find_by_id("articles", "d1").unwrap(), None);
    }

    #[test]
    fn test_failed_batch_leaves_store_untouched() {
        let engine = MemoryEngine::new();
        engine.insert("articles", doc("d1", "a")).unwrap();

        let result = engine.apply(vec![
            WriteOp::Insert {
                collection: "articles".into(),
                doc: doc("d2", "b"),
            },
            WriteOp::Insert {
                collection: "articles".into(),
                doc: doc("d1", "dup"),
            },
        ]);
        assert!(matches!(result, Err(EngineError::DuplicateId { .. })));
        assert_eq!(engine.find_by_id("articles", "d2").unwrap(), None);
    }

    #[test]
    fn test_staged_transaction_read_your_writes() {
        let engine = MemoryEngine::new();
        let mut txn = engine.begin().unwrap();
        txn.insert("articles", doc("d1", "a")).unwrap();

        assert!(txn.find_by_id("articles", "d1").unwrap().is_some());
        assert!(engine.find_by_id("articles", "d1").unwrap().is_none());

        let records = txn.commit().unwrap();
        assert_eq!(records, vec![ChangeRecord::new(ChangeKind::Insert, "articles", "d1")]);
        assert!(engine.find_by_id("articles", "d1").unwrap().is_some());
    }

    #[test]
    fn test_rollback_discards_writes() {
        let engine = MemoryEngine::new();
        let mut txn = engine.begin().unwrap();
        txn.insert("articles", doc("d1", "a")).unwrap();
        txn.rollback().unwrap();
        assert!(engine.scan("articles").unwrap().is_empty());
    }

    #[test]
    fn test_observers_see_committed_records_only() {
        let engine = MemoryEngine::new();
        let observer = Arc::new(RecordingObserver::default());
        engine.observe(observer.clone());

        let mut txn = engine.begin().unwrap();
        txn.insert("articles", doc("d1", "a")).unwrap();
        assert!(observer.seen.lock().unwrap().is_empty());
        txn.commit().unwrap();

        engine.delete("articles", "missing").unwrap();
        engine.delete("articles", "d1").unwrap();

        let seen = observer.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].kind, ChangeKind::Delete);
    }

    #[test]
    fn test_closed_engine_rejects_calls() {
        let engine = MemoryEngine::new();
        engine.close().unwrap();
        assert!(engine.is_closed());
        assert!(matches!(engine.begin(), Err(EngineError::Closed)));
        assert!(matches!(
            engine.find_by_id("articles", "d1"),
            Err(EngineError::Closed)
        ));
    }

    #[test]
    fn test_provider_store_survives_reopen() {
        let provider = MemoryEngineProvider::new();
        let acme = TenantId::new("acme");
        assert!(!provider.exists(&acme));

        let engine = provider.create(&acme).unwrap();
        engine.insert("articles", doc("d1", "a")).unwrap();
        engine.close().unwrap();

        let reopened = provider.open(&acme).unwrap();
        assert!(reopened.find_by_id("articles", "d1").unwrap().is_some());
        assert_eq!(provider.discover().unwrap(), vec![acme.clone()]);

        provider.delete_files(&acme).unwrap();
        assert!(!provider.exists(&acme));
        assert!(provider.open(&acme).is_err());
    }

    #[test]
    fn test_find_by_field_scans() {
        let engine = MemoryEngine::new();
        engine.insert("articles", doc("d1", "a")).unwrap();
        engine.insert("articles", doc("d2", "b")).unwrap();
        let found = engine
            .find_by_field("articles", "title", &Value::from("b"))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "d2");
    }
}
