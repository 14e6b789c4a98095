//! Storage engine seam.
//!
//! A tenant's data lives in exactly one [`StorageEngine`]. The coordination
//! layer only ever talks to engines through these traits, so the LMDB and
//! in-memory engines are interchangeable.
//!
//! Engine transactions stage their writes and apply them as one atomic batch
//! on commit. Nothing staged is visible to other readers, or published to
//! commit observers, until then.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use vesper_core::{
    ChangeRecord, CollectionMetadata, Document, EngineError, TenantId, WriteOp,
};

pub mod lmdb;
pub mod memory;

pub use lmdb::{LmdbEngine, LmdbEngineProvider};
pub use memory::{MemoryEngine, MemoryEngineProvider};

/// Result type for engine calls.
pub type EngineResult<T> = Result<T, EngineError>;

/// Receives the change records of every successful atomic write.
///
/// Called synchronously on the committing thread after the write is durable,
/// so implementations must hand work off rather than do it inline.
pub trait CommitObserver: Send + Sync {
    fn on_commit(&self, records: &[ChangeRecord]);
}

/// Builds a commit observer for each engine the registry opens.
pub trait ObserverFactory: Send + Sync {
    fn observer_for(&self, tenant: &TenantId) -> Arc<dyn CommitObserver>;
}

/// One tenant's storage engine.
pub trait StorageEngine: Send + Sync {
    /// Start a staged transaction.
    fn begin(&self) -> EngineResult<Box<dyn EngineTransaction>>;

    fn find_by_id(&self, collection: &str, id: &str) -> EngineResult<Option<Document>>;

    /// Every document in a collection, in id order.
    fn scan(&self, collection: &str) -> EngineResult<Vec<Document>>;

    /// Documents whose `field` equals `value`. Uses the secondary index when
    /// the field is indexed, a scan otherwise.
    fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> EngineResult<Vec<Document>>;

    /// Apply a batch atomically and return what changed.
    ///
    /// Deleting a missing document is a no-op and produces no record.
    fn apply(&self, ops: Vec<WriteOp>) -> EngineResult<Vec<ChangeRecord>>;

    fn collection_metadata(&self, collection: &str) -> EngineResult<CollectionMetadata>;

    fn set_collection_metadata(
        &self,
        collection: &str,
        metadata: CollectionMetadata,
    ) -> EngineResult<()>;

    /// Register a post-commit observer.
    fn observe(&self, observer: Arc<dyn CommitObserver>);

    /// Write a consistent copy of the store to `dest`.
    fn backup_to(&self, dest: &Path) -> EngineResult<()>;

    /// Release the engine's resources. Later calls fail with
    /// [`EngineError::Closed`].
    fn close(&self) -> EngineResult<()>;

    fn is_closed(&self) -> bool;

    /// Auto-committed insert. Assigns an id when the document has none.
    fn insert(&self, collection: &str, mut doc: Document) -> EngineResult<Document> {
        doc.ensure_id();
        self.apply(vec![WriteOp::Insert {
            collection: collection.to_string(),
            doc: doc.clone(),
        }])?;
        Ok(doc)
    }

    /// Auto-committed replace of an existing document.
    fn update(&self, collection: &str, doc: Document) -> EngineResult<()> {
        self.apply(vec![WriteOp::Update {
            collection: collection.to_string(),
            doc,
        }])?;
        Ok(())
    }

    /// Auto-committed delete. Returns whether the document existed.
    fn delete(&self, collection: &str, id: &str) -> EngineResult<bool> {
        let records = self.apply(vec![WriteOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        }])?;
        Ok(!records.is_empty())
    }
}

/// A staged write transaction on one engine.
pub trait EngineTransaction: Send {
    /// Read through the staged writes, then the engine.
    fn find_by_id(&self, collection: &str, id: &str) -> EngineResult<Option<Document>>;

    fn insert(&mut self, collection: &str, doc: Document) -> EngineResult<Document>;

    fn update(&mut self, collection: &str, doc: Document) -> EngineResult<()>;

    fn delete(&mut self, collection: &str, id: &str) -> EngineResult<()>;

    /// Number of staged operations.
    fn pending(&self) -> usize;

    fn commit(self: Box<Self>) -> EngineResult<Vec<ChangeRecord>>;

    fn rollback(self: Box<Self>) -> EngineResult<()>;
}

/// Opens, creates, discovers and deletes per-tenant backing stores.
pub trait EngineProvider: Send + Sync {
    /// Whether a backing store exists for the tenant.
    fn exists(&self, tenant: &TenantId) -> bool;

    /// Open an existing store.
    fn open(&self, tenant: &TenantId) -> EngineResult<Arc<dyn StorageEngine>>;

    /// Create the store if needed and open it.
    fn create(&self, tenant: &TenantId) -> EngineResult<Arc<dyn StorageEngine>>;

    /// Tenants with a backing store, excluding the system tenant.
    fn discover(&self) -> EngineResult<Vec<TenantId>>;

    /// Remove every file belonging to the tenant's store.
    fn delete_files(&self, tenant: &TenantId) -> EngineResult<()>;

    /// Where the tenant's store lives.
    fn location(&self, tenant: &TenantId) -> PathBuf;
}

type OverlayKey = (String, String);

/// Write-staging transaction shared by every engine.
///
/// Writes are buffered as [`WriteOp`]s plus an overlay for read-your-writes,
/// then handed to [`StorageEngine::apply`] in one batch.
pub struct StagedTransaction<E: StorageEngine + Clone + 'static> {
    engine: E,
    ops: Vec<WriteOp>,
    overlay: HashMap<OverlayKey, Option<Document>>,
}

impl<E: StorageEngine + Clone + 'static> StagedTransaction<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            ops: Vec::new(),
            overlay: HashMap::new(),
        }
    }

    fn overlay_key(collection: &str, id: &str) -> OverlayKey {
        (collection.to_string(), id.to_string())
    }

    fn exists(&self, collection: &str, id: &str) -> EngineResult<bool> {
        Ok(self.find_by_id(collection, id)?.is_some())
    }
}

impl<E: StorageEngine + Clone + 'static> EngineTransaction for StagedTransaction<E> {
    fn find_by_id(&self, collection: &str, id: &str) -> EngineResult<Option<Document>> {
        match self.overlay.get(&Self::overlay_key(collection, id)) {
            Some(staged) => Ok(staged.clone()),
            None => self.engine.find_by_id(collection, id),
        }
    }

    fn insert(&mut self, collection: &str, mut doc: Document) -> EngineResult<Document> {
        if self.engine.is_closed() {
            return Err(EngineError::Closed);
        }
        doc.ensure_id();
        if self.exists(collection, &doc.id)? {
            return Err(EngineError::DuplicateId {
                collection: collection.to_string(),
                id: doc.id.clone(),
            });
        }
        self.overlay
            .insert(Self::overlay_key(collection, &doc.id), Some(doc.clone()));
        self.ops.push(WriteOp::Insert {
            collection: collection.to_string(),
            doc: doc.clone(),
        });
        Ok(doc)
    }

    fn update(&mut self, collection: &str, doc: Document) -> EngineResult<()> {
        if self.engine.is_closed() {
            return Err(EngineError::Closed);
        }
        if !self.exists(collection, &doc.id)? {
            return Err(EngineError::DocumentNotFound {
                collection: collection.to_string(),
                id: doc.id,
            });
        }
        self.overlay
            .insert(Self::overlay_key(collection, &doc.id), Some(doc.clone()));
        self.ops.push(WriteOp::Update {
            collection: collection.to_string(),
            doc,
        });
        Ok(())
    }

    fn delete(&mut self, collection: &str, id: &str) -> EngineResult<()> {
        if self.engine.is_closed() {
            return Err(EngineError::Closed);
        }
        self.overlay.insert(Self::overlay_key(collection, id), None);
        self.ops.push(WriteOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    fn pending(&self) -> usize {
        self.ops.len()
    }

    fn commit(self: Box<Self>) -> EngineResult<Vec<ChangeRecord>> {
        let this = *self;
        if this.ops.is_empty() {
            return Ok(Vec::new());
        }
        this.engine.apply(this.ops)
    }

    fn rollback(self: Box<Self>) -> EngineResult<()> {
        // Staged writes never reached the engine.
        Ok(())
    }
}

/// Encoded values longer than this are indexed by digest.
const MAX_INLINE_INDEX_VALUE: usize = 64;

/// Secondary-index encoding of a field value.
///
/// Short values are stored as their JSON text. Longer ones become a SHA-256
/// digest so index keys stay bounded; lookups through a digest must compare
/// the stored document's field against the requested value.
pub(crate) fn index_value(value: &Value) -> String {
    let encoded = value.to_string();
    if encoded.len() <= MAX_INLINE_INDEX_VALUE {
        return encoded;
    }
    let digest = Sha256::digest(encoded.as_bytes());
    format!("#{}", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_value_is_bounded() {
        assert_eq!(index_value(&json!("acme")), "\"acme\"");
        let long = index_value(&json!("k".repeat(1000)));
        assert_eq!(long.len(), 65);
        assert!(long.starts_with('#'));
        assert_ne!(long, index_value(&json!("j".repeat(1000))));
    }
}
