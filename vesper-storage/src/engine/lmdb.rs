//! LMDB-backed storage engine.
//!
//! Uses the heed crate (Rust bindings for LMDB). Each tenant gets its own
//! environment directory holding three named databases:
//!
//! - `docs`: JSON documents keyed by `collection\0id`
//! - `meta`: JSON collection metadata keyed by collection name
//! - `index`: secondary index entries keyed by
//!   `collection\0field\0value\0id` with empty values
//!
//! A batch from [`StorageEngine::apply`] runs inside a single LMDB write
//! transaction, so it is applied entirely or not at all.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use heed::types::Bytes;
use heed::{CompactionOption, Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde_json::Value;
use tracing::{debug, warn};
use vesper_core::{
    ChangeKind, ChangeRecord, CollectionMetadata, Document, EngineError, TenantId, WriteOp,
};

use super::{
    index_value, CommitObserver, EngineProvider, EngineResult, EngineTransaction,
    StagedTransaction, StorageEngine,
};

const DOCS_DB: &str = "docs";
const META_DB: &str = "meta";
const INDEX_DB: &str = "index";
const MAX_DBS: u32 = 4;
const DATA_FILE: &str = "data.mdb";
const KEY_SEP: u8 = 0;

/// How long `close` waits for LMDB to release the environment.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn lmdb_err(e: heed::Error) -> EngineError {
    match e {
        heed::Error::Io(io) => EngineError::io(io.to_string()),
        other => EngineError::backend(other.to_string()),
    }
}

fn encode_err(e: serde_json::Error) -> EngineError {
    EngineError::Serialization {
        reason: e.to_string(),
    }
}

fn join_key(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEP);
        }
        key.extend_from_slice(part.as_bytes());
    }
    key
}

fn doc_key(collection: &str, id: &str) -> Vec<u8> {
    join_key(&[collection, id])
}

fn collection_prefix(collection: &str) -> Vec<u8> {
    let mut prefix = join_key(&[collection]);
    prefix.push(KEY_SEP);
    prefix
}

fn index_key(collection: &str, field: &str, value: &Value, id: &str) -> Vec<u8> {
    join_key(&[collection, field, &index_value(value), id])
}

fn index_prefix(collection: &str, field: &str, value: Option<&Value>) -> Vec<u8> {
    let mut prefix = match value {
        Some(value) => join_key(&[collection, field, &index_value(value)]),
        None => join_key(&[collection, field]),
    };
    prefix.push(KEY_SEP);
    prefix
}

struct LmdbInner {
    /// `None` once closed.
    env: RwLock<Option<Env>>,
    docs: Database<Bytes, Bytes>,
    meta: Database<Bytes, Bytes>,
    index: Database<Bytes, Bytes>,
    observers: RwLock<Vec<Arc<dyn CommitObserver>>>,
    path: PathBuf,
}

/// LMDB engine for one tenant. Cheap to clone; clones share the environment.
#[derive(Clone)]
pub struct LmdbEngine {
    inner: Arc<LmdbInner>,
}

impl LmdbEngine {
    /// Open (or create) the environment at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or LMDB refuses
    /// to open the environment.
    pub fn open<P: AsRef<Path>>(path: P, map_size: usize) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).map_err(|e| EngineError::io(e.to_string()))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(MAX_DBS)
                .open(&path)
        }
        .map_err(lmdb_err)?;

        let mut wtxn = env.write_txn().map_err(lmdb_err)?;
        let docs: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(DOCS_DB))
            .map_err(lmdb_err)?;
        let meta: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(META_DB))
            .map_err(lmdb_err)?;
        let index: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(INDEX_DB))
            .map_err(lmdb_err)?;
        wtxn.commit().map_err(lmdb_err)?;

        debug!(path = %path.display(), "Opened LMDB environment");

        Ok(Self {
            inner: Arc::new(LmdbInner {
                env: RwLock::new(Some(env)),
                docs,
                meta,
                index,
                observers: RwLock::new(Vec::new()),
                path,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn with_env<T>(&self, f: impl FnOnce(&Env) -> EngineResult<T>) -> EngineResult<T> {
        let guard = self.inner.env.read().map_err(|_| EngineError::LockPoisoned)?;
        let env = guard.as_ref().ok_or(EngineError::Closed)?;
        f(env)
    }

    fn read_doc(&self, rtxn: &RoTxn, collection: &str, id: &str) -> EngineResult<Option<Document>> {
        match self
            .inner
            .docs
            .get(rtxn, &doc_key(collection, id))
            .map_err(lmdb_err)?
        {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes).map_err(encode_err)?)),
            None => Ok(None),
        }
    }

    fn read_metadata(&self, rtxn: &RoTxn, collection: &str) -> EngineResult<CollectionMetadata> {
        match self
            .inner
            .meta
            .get(rtxn, collection.as_bytes())
            .map_err(lmdb_err)?
        {
            Some(bytes) => serde_json::from_slice(bytes).map_err(encode_err),
            None => Ok(CollectionMetadata::default()),
        }
    }

    fn scan_in(&self, rtxn: &RoTxn, collection: &str) -> EngineResult<Vec<Document>> {
        let prefix = collection_prefix(collection);
        let iter = self.inner.docs.prefix_iter(rtxn, &prefix).map_err(lmdb_err)?;
        let mut docs = Vec::new();
        for entry in iter {
            let (_, bytes) = entry.map_err(lmdb_err)?;
            docs.push(serde_json::from_slice(bytes).map_err(encode_err)?);
        }
        Ok(docs)
    }

    fn add_index_entries(
        &self,
        wtxn: &mut RwTxn,
        collection: &str,
        metadata: &CollectionMetadata,
        doc: &Document,
    ) -> EngineResult<()> {
        for field in &metadata.indexes {
            if let Some(value) = doc.get(field) {
                let key = index_key(collection, field, value, &doc.id);
                self.inner.index.put(wtxn, &key, &[]).map_err(lmdb_err)?;
            }
        }
        Ok(())
    }

    fn remove_index_entries(
        &self,
        wtxn: &mut RwTxn,
        collection: &str,
        metadata: &CollectionMetadata,
        doc: &Document,
    ) -> EngineResult<()> {
        for field in &metadata.indexes {
            if let Some(value) = doc.get(field) {
                let key = index_key(collection, field, value, &doc.id);
                self.inner.index.delete(wtxn, &key).map_err(lmdb_err)?;
            }
        }
        Ok(())
    }

    fn delete_prefix(
        &self,
        wtxn: &mut RwTxn,
        db: Database<Bytes, Bytes>,
        prefix: &[u8],
    ) -> EngineResult<u64> {
        let keys: Vec<Vec<u8>> = {
            let iter = db.prefix_iter(wtxn, prefix).map_err(lmdb_err)?;
            let mut keys = Vec::new();
            for entry in iter {
                let (key, _) = entry.map_err(lmdb_err)?;
                keys.push(key.to_vec());
            }
            keys
        };
        let mut deleted = 0u64;
        for key in &keys {
            if db.delete(wtxn, key).map_err(lmdb_err)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn put_doc(&self, wtxn: &mut RwTxn, collection: &str, doc: &Document) -> EngineResult<()> {
        let bytes = serde_json::to_vec(doc).map_err(encode_err)?;
        self.inner
            .docs
            .put(wtxn, &doc_key(collection, &doc.id), &bytes)
            .map_err(lmdb_err)
    }

    fn apply_in(&self, wtxn: &mut RwTxn, ops: Vec<WriteOp>) -> EngineResult<Vec<ChangeRecord>> {
        let mut metadata: HashMap<String, CollectionMetadata> = HashMap::new();
        let mut records = Vec::with_capacity(ops.len());

        for op in ops {
            let collection = op.collection().to_string();
            if !metadata.contains_key(&collection) {
                let loaded = self.read_metadata(wtxn, &collection)?;
                metadata.insert(collection.clone(), loaded);
            }
            let meta = metadata.get(&collection).cloned().unwrap_or_default();

            match op {
                WriteOp::Insert { doc, .. } => {
                    if self.read_doc(wtxn, &collection, &doc.id)?.is_some() {
                        return Err(EngineError::DuplicateId {
                            collection,
                            id: doc.id,
                        });
                    }
                    self.put_doc(wtxn, &collection, &doc)?;
                    self.add_index_entries(wtxn, &collection, &meta, &doc)?;
                    records.push(ChangeRecord::new(ChangeKind::Insert, &collection, &doc.id));
                }
                WriteOp::Update { doc, .. } => {
                    let old = self
                        .read_doc(wtxn, &collection, &doc.id)?
                        .ok_or_else(|| EngineError::DocumentNotFound {
                            collection: collection.clone(),
                            id: doc.id.clone(),
                        })?;
                    self.remove_index_entries(wtxn, &collection, &meta, &old)?;
                    self.put_doc(wtxn, &collection, &doc)?;
                    self.add_index_entries(wtxn, &collection, &meta, &doc)?;
                    records.push(ChangeRecord::new(ChangeKind::Update, &collection, &doc.id));
                }
                WriteOp::Delete { id, .. } => {
                    if let Some(old) = self.read_doc(wtxn, &collection, &id)? {
                        self.remove_index_entries(wtxn, &collection, &meta, &old)?;
                        self.inner
                            .docs
                            .delete(wtxn, &doc_key(&collection, &id))
                            .map_err(lmdb_err)?;
                        records.push(ChangeRecord::new(ChangeKind::Delete, &collection, &id));
                    }
                }
            }
        }
        Ok(records)
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

impl StorageEngine for LmdbEngine {
    fn begin(&self) -> EngineResult<Box<dyn EngineTransaction>> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(Box::new(StagedTransaction::new(self.clone())))
    }

    fn find_by_id(&self, collection: &str, id: &str) -> EngineResult<Option<Document>> {
        self.with_env(|env| {
            let rtxn = env.read_txn().map_err(lmdb_err)?;
            self.read_doc(&rtxn, collection, id)
        })
    }

    fn scan(&self, collection: &str) -> EngineResult<Vec<Document>> {
        self.with_env(|env| {
            let rtxn = env.read_txn().map_err(lmdb_err)?;
            self.scan_in(&rtxn, collection)
        })
    }

    fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> EngineResult<Vec<Document>> {
        self.with_env(|env| {
            let rtxn = env.read_txn().map_err(lmdb_err)?;
            let metadata = self.read_metadata(&rtxn, collection)?;
            if !metadata.is_indexed(field) {
                return Ok(self
                    .scan_in(&rtxn, collection)?
                    .into_iter()
                    .filter(|doc| doc.get(field) == Some(value))
                    .collect());
            }

            let prefix = index_prefix(collection, field, Some(value));
            let ids: Vec<String> = {
                let iter = self
                    .inner
                    .index
                    .prefix_iter(&rtxn, &prefix)
                    .map_err(lmdb_err)?;
                let mut ids = Vec::new();
                for entry in iter {
                    let (key, _) = entry.map_err(lmdb_err)?;
                    ids.push(String::from_utf8_lossy(&key[prefix.len()..]).into_owned());
                }
                ids
            };

            // Long values are indexed by digest, so confirm each hit.
            let mut docs = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(doc) = self.read_doc(&rtxn, collection, &id)? {
                    if doc.get(field) == Some(value) {
                        docs.push(doc);
                    }
                }
            }
            Ok(docs)
        })
    }

    fn apply(&self, ops: Vec<WriteOp>) -> EngineResult<Vec<ChangeRecord>> {
        let records = self.with_env(|env| {
            let mut wtxn = env.write_txn().map_err(lmdb_err)?;
            // Dropping an uncommitted write transaction aborts it.
            let records = self.apply_in(&mut wtxn, ops)?;
            wtxn.commit().map_err(lmdb_err)?;
            Ok(records)
        })?;
        self.notify(&records);
        Ok(records)
    }

    fn collection_metadata(&self, collection: &str) -> EngineResult<CollectionMetadata> {
        self.with_env(|env| {
            let rtxn = env.read_txn().map_err(lmdb_err)?;
            self.read_metadata(&rtxn, collection)
        })
    }

    fn set_collection_metadata(
        &self,
        collection: &str,
        metadata: CollectionMetadata,
    ) -> EngineResult<()> {
        self.with_env(|env| {
            let mut wtxn = env.write_txn().map_err(lmdb_err)?;
            let previous = self.read_metadata(&wtxn, collection)?;

            for field in previous.indexes.iter().filter(|f| !metadata.is_indexed(f)) {
                let prefix = index_prefix(collection, field, None);
                self.delete_prefix(&mut wtxn, self.inner.index, &prefix)?;
            }

            let added: Vec<&String> = metadata
                .indexes
                .iter()
                .filter(|f| !previous.is_indexed(f))
                .collect();
            if !added.is_empty() {
                let docs = self.scan_in(&wtxn, collection)?;
                let only_added = CollectionMetadata {
                    indexes: added.into_iter().cloned().collect(),
                    enrichment: None,
                };
                for doc in &docs {
                    self.add_index_entries(&mut wtxn, collection, &only_added, doc)?;
                }
            }

            let bytes = serde_json::to_vec(&metadata).map_err(encode_err)?;
            self.inner
                .meta
                .put(&mut wtxn, collection.as_bytes(), &bytes)
                .map_err(lmdb_err)?;
            wtxn.commit().map_err(lmdb_err)
        })
    }

    fn observe(&self, observer: Arc<dyn CommitObserver>) {
        if let Ok(mut observers) = self.inner.observers.write() {
            observers.push(observer);
        }
    }

    fn backup_to(&self, dest: &Path) -> EngineResult<()> {
        self.with_env(|env| {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| EngineError::io(e.to_string()))?;
            }
            env.copy_to_file(dest, CompactionOption::Enabled)
                .map_err(lmdb_err)?;
            Ok(())
        })
    }

    fn close(&self) -> EngineResult<()> {
        let env = {
            let mut guard = self.inner.env.write().map_err(|_| EngineError::LockPoisoned)?;
            guard.take()
        };
        if let Ok(mut observers) = self.inner.observers.write() {
            observers.clear();
        }
        let Some(env) = env else {
            return Ok(());
        };
        let closing = env.prepare_for_closing();
        if !closing.wait_timeout(CLOSE_TIMEOUT) {
            warn!(
                path = %self.inner.path.display(),
                "LMDB environment still referenced after close timeout"
            );
        }
        debug!(path = %self.inner.path.display(), "Closed LMDB environment");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner
            .env
            .read()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }
}

/// Lays tenant environments out under a data directory:
/// `<data_dir>/system` for the system tenant and `<data_dir>/tenants/<id>`
/// for everyone else.
pub struct LmdbEngineProvider {
    data_dir: PathBuf,
    map_size: usize,
}

impl LmdbEngineProvider {
    pub fn new(data_dir: impl Into<PathBuf>, map_size: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            map_size,
        }
    }

    fn tenants_dir(&self) -> PathBuf {
        self.data_dir.join("tenants")
    }
}

impl EngineProvider for LmdbEngineProvider {
    fn exists(&self, tenant: &TenantId) -> bool {
        self.location(tenant).join(DATA_FILE).is_file()
    }

    fn open(&self, tenant: &TenantId) -> EngineResult<Arc<dyn StorageEngine>> {
        if !self.exists(tenant) {
            return Err(EngineError::io(format!(
                "no LMDB store at {}",
                self.location(tenant).display()
            )));
        }
        Ok(Arc::new(LmdbEngine::open(self.location(tenant), self.map_size)?))
    }

    fn create(&self, tenant: &TenantId) -> EngineResult<Arc<dyn StorageEngine>> {
        Ok(Arc::new(LmdbEngine::open(self.location(tenant), self.map_size)?))
    }

    fn discover(&self) -> EngineResult<Vec<TenantId>> {
        let dir = self.tenants_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&dir).map_err(|e| EngineError::io(e.to_string()))?;
        let mut tenants = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::io(e.to_string()))?;
            if !entry.path().join(DATA_FILE).is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                let tenant = TenantId::new(name);
                if !tenant.is_system() && tenant.validate().is_ok() {
                    tenants.push(tenant);
                }
            }
        }
        tenants.sort();
        Ok(tenants)
    }

    fn delete_files(&self, tenant: &TenantId) -> EngineResult<()> {
        let dir = self.location(tenant);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::io(format!("{}: {}", dir.display(), e))),
        }
    }

    fn location(&self, tenant: &TenantId) -> PathBuf {
        if tenant.is_system() {
            self.data_dir.join("system")
        } else {
            self.tenants_dir().join(tenant.as_str())
        }
    }
}
