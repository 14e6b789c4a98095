//! VESPER Test Utilities
//!
//! Centralized test infrastructure for the VESPER workspace:
//! - An instrumented engine provider that counts concurrently open
//!   transactions and can inject begin/commit failures
//! - Fixed and failing embedding providers
//! - Document builders for common scenarios
//! - Proptest strategies for identifiers and documents

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::json;

// Re-export core types for convenience
pub use vesper_core::{
    ChangeKind, ChangeRecord, CollectionMetadata, Document, EngineError, EnrichmentRule,
    SessionToken, TenantId, VesperConfig, VesperError, VesperResult, WriteOp,
};
pub use vesper_llm::EmbeddingProvider;
pub use vesper_storage::{
    CommitObserver, EngineProvider, EngineResult, EngineTransaction, MemoryEngineProvider,
    StorageEngine,
};

// ============================================================================
// INSTRUMENTED ENGINE
// ============================================================================

/// Shared counters and failure switches for every engine a provider opens.
#[derive(Debug, Default)]
pub struct EngineMonitor {
    open_transactions: AtomicUsize,
    max_open_transactions: AtomicUsize,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    fail_next_begin: AtomicBool,
    fail_next_commit: AtomicBool,
    commit_gate: Mutex<Option<Receiver<()>>>,
}

/// How long a held commit waits for its release before failing.
const COMMIT_GATE_TIMEOUT: Duration = Duration::from_secs(5);

impl EngineMonitor {
    /// Transactions begun and not yet finished.
    pub fn open_transactions(&self) -> usize {
        self.open_transactions.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open transactions seen.
    pub fn max_open_transactions(&self) -> usize {
        self.max_open_transactions.load(Ordering::SeqCst)
    }

    pub fn begins(&self) -> u64 {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Make the next `begin` fail with a backend error.
    pub fn fail_next_begin(&self) {
        self.fail_next_begin.store(true, Ordering::SeqCst);
    }

    /// Make the next `commit` fail with a backend error.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Block the next `commit` on its calling thread until the returned
    /// sender fires. Fails that commit if nothing is sent within 5 seconds.
    pub fn hold_next_commit(&self) -> Sender<()> {
        let (release, gate) = mpsc::channel();
        if let Ok(mut slot) = self.commit_gate.lock() {
            *slot = Some(gate);
        }
        release
    }

    fn wait_for_release(&self) -> bool {
        let gate = self.commit_gate.lock().ok().and_then(|mut slot| slot.take());
        match gate {
            Some(gate) => gate.recv_timeout(COMMIT_GATE_TIMEOUT).is_ok(),
            None => true,
        }
    }

    fn opened(&self) {
        self.begins.fetch_add(1, Ordering::SeqCst);
        let now = self.open_transactions.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_transactions.fetch_max(now, Ordering::SeqCst);
    }

    fn closed(&self) {
        self.open_transactions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Engine provider that wraps every engine it hands out with an
/// [`EngineMonitor`].
pub struct InstrumentedEngineProvider {
    inner: Arc<dyn EngineProvider>,
    monitor: Arc<EngineMonitor>,
}

impl InstrumentedEngineProvider {
    /// Instrument an in-memory provider.
    pub fn memory() -> Self {
        Self::wrap(Arc::new(MemoryEngineProvider::new()))
    }

    pub fn wrap(inner: Arc<dyn EngineProvider>) -> Self {
        Self {
            inner,
            monitor: Arc::new(EngineMonitor::default()),
        }
    }

    pub fn monitor(&self) -> Arc<EngineMonitor> {
        Arc::clone(&self.monitor)
    }

    fn instrument(&self, engine: Arc<dyn StorageEngine>) -> Arc<dyn StorageEngine> {
        Arc::new(InstrumentedEngine {
            inner: engine,
            monitor: Arc::clone(&self.monitor),
        })
    }
}

impl EngineProvider for InstrumentedEngineProvider {
    fn exists(&self, tenant: &TenantId) -> bool {
        self.inner.exists(tenant)
    }

    fn open(&self, tenant: &TenantId) -> EngineResult<Arc<dyn StorageEngine>> {
        Ok(self.instrument(self.inner.open(tenant)?))
    }

    fn create(&self, tenant: &TenantId) -> EngineResult<Arc<dyn StorageEngine>> {
        Ok(self.instrument(self.inner.create(tenant)?))
    }

    fn discover(&self) -> EngineResult<Vec<TenantId>> {
        self.inner.discover()
    }

    fn delete_files(&self, tenant: &TenantId) -> EngineResult<()> {
        self.inner.delete_files(tenant)
    }

    fn location(&self, tenant: &TenantId) -> PathBuf {
        self.inner.location(tenant)
    }
}

struct InstrumentedEngine {
    inner: Arc<dyn StorageEngine>,
    monitor: Arc<EngineMonitor>,
}

impl StorageEngine for InstrumentedEngine {
    fn begin(&self) -> EngineResult<Box<dyn EngineTransaction>> {
        if self.monitor.fail_next_begin.swap(false, Ordering::SeqCst) {
            return Err(EngineError::backend("injected begin failure"));
        }
        let inner = self.inner.begin()?;
        self.monitor.opened();
        Ok(Box::new(InstrumentedTransaction {
            inner: Some(inner),
            monitor: Arc::clone(&self.monitor),
        }))
    }

    fn find_by_id(&self, collection: &str, id: &str) -> EngineResult<Option<Document>> {
        self.inner.find_by_id(collection, id)
    }

    fn scan(&self, collection: &str) -> EngineResult<Vec<Document>> {
        self.inner.scan(collection)
    }

    fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> EngineResult<Vec<Document>> {
        self.inner.find_by_field(collection, field, value)
    }

    fn apply(&self, ops: Vec<WriteOp>) -> EngineResult<Vec<ChangeRecord>> {
        self.inner.apply(ops)
    }

    fn collection_metadata(&self, collection: &str) -> EngineResult<CollectionMetadata> {
        self.inner.collection_metadata(collection)
    }

    fn set_collection_metadata(
        &self,
        collection: &str,
        metadata: CollectionMetadata,
    ) -> EngineResult<()> {
        self.inner.set_collection_metadata(collection, metadata)
    }

    fn observe(&self, observer: Arc<dyn CommitObserver>) {
        self.inner.observe(observer)
    }

    fn backup_to(&self, dest: &Path) -> EngineResult<()> {
        self.inner.backup_to(dest)
    }

    fn close(&self) -> EngineResult<()> {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

struct InstrumentedTransaction {
    inner: Option<Box<dyn EngineTransaction>>,
    monitor: Arc<EngineMonitor>,
}

impl InstrumentedTransaction {
    fn take(&mut self) -> EngineResult<Box<dyn EngineTransaction>> {
        self.inner.take().ok_or(EngineError::Closed)
    }

    fn inner(&self) -> EngineResult<&dyn EngineTransaction> {
        self.inner.as_deref().ok_or(EngineError::Closed)
    }

    fn inner_mut(&mut self) -> EngineResult<&mut Box<dyn EngineTransaction>> {
        self.inner.as_mut().ok_or(EngineError::Closed)
    }
}

impl Drop for InstrumentedTransaction {
    fn drop(&mut self) {
        // Finished transactions were already counted down.
        if self.inner.is_some() {
            self.monitor.closed();
        }
    }
}

impl EngineTransaction for InstrumentedTransaction {
    fn find_by_id(&self, collection: &str, id: &str) -> EngineResult<Option<Document>> {
        self.inner()?.find_by_id(collection, id)
    }

    fn insert(&mut self, collection: &str, doc: Document) -> EngineResult<Document> {
        self.inner_mut()?.insert(collection, doc)
    }

    fn update(&mut self, collection: &str, doc: Document) -> EngineResult<()> {
        self.inner_mut()?.update(collection, doc)
    }

    fn delete(&mut self, collection: &str, id: &str) -> EngineResult<()> {
        self.inner_mut()?.delete(collection, id)
    }

    fn pending(&self) -> usize {
        self.inner.as_ref().map(|t| t.pending()).unwrap_or(0)
    }

    fn commit(mut self: Box<Self>) -> EngineResult<Vec<ChangeRecord>> {
        let inner = self.take()?;
        self.monitor.closed();
        if !self.monitor.wait_for_release() {
            inner.rollback()?;
            return Err(EngineError::backend("held commit was never released"));
        }
        if self.monitor.fail_next_commit.swap(false, Ordering::SeqCst) {
            inner.rollback()?;
            return Err(EngineError::backend("injected commit failure"));
        }
        let records = inner.commit()?;
        self.monitor.commits.fetch_add(1, Ordering::SeqCst);
        Ok(records)
    }

    fn rollback(mut self: Box<Self>) -> EngineResult<()> {
        let inner = self.take()?;
        self.monitor.closed();
        self.monitor.rollbacks.fetch_add(1, Ordering::SeqCst);
        inner.rollback()
    }
}

// ============================================================================
// EMBEDDING PROVIDERS
// ============================================================================

/// Returns the same vector for every text and counts calls.
#[derive(Debug)]
pub struct FixedEmbeddingProvider {
    vector: Vec<f32>,
    calls: AtomicU64,
}

impl FixedEmbeddingProvider {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for FixedEmbeddingProvider {
    fn default() -> Self {
        Self::new(vec![0.1, 0.2, 0.3])
    }
}

#[async_trait]
impl EmbeddingProvider for FixedEmbeddingProvider {
    async fn embed(&self, _text: &str) -> VesperResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector.clone())
    }

    fn dimensions(&self) -> usize {
        self.vector.len()
    }

    fn model_id(&self) -> &str {
        "fixed"
    }
}

/// Fails every call, as an unreachable endpoint would.
#[derive(Debug, Default)]
pub struct FailingEmbeddingProvider {
    calls: AtomicU64,
}

impl FailingEmbeddingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FailingEmbeddingProvider {
    async fn embed(&self, _text: &str) -> VesperResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(VesperError::enrichment("embedding endpoint unavailable"))
    }

    fn dimensions(&self) -> usize {
        0
    }

    fn model_id(&self) -> &str {
        "failing"
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// An `articles` document with a text body.
pub fn article(id: &str, body: &str) -> Document {
    Document::new(id)
        .with_field("title", format!("Article {}", id))
        .with_field("body", body)
}

/// Enrich `body` into `embedding`.
pub fn body_embedding_rule() -> EnrichmentRule {
    EnrichmentRule::new(vec!["body".to_string()], "embedding")
}

/// Development config with enrichment enabled and the given batch size.
pub fn test_config(batch_size: usize) -> VesperConfig {
    let mut config = VesperConfig::development();
    config.enrichment.batch_size = batch_size;
    config
}

/// A document with a single numeric field.
pub fn counter(id: &str, value: i64) -> Document {
    Document::new(id).with_field("value", json!(value))
}

// ============================================================================
// PROPTEST STRATEGIES
// ============================================================================

/// Tenant identifiers in raw form, including mixed case and padding.
pub fn arb_raw_tenant() -> impl Strategy<Value = String> {
    ("[a-zA-Z][a-zA-Z0-9_-]{0,11}", 0usize..2, 0usize..2)
        .prop_map(|(name, lead, trail)| format!("{}{}{}", " ".repeat(lead), name, " ".repeat(trail)))
}

/// Collection names that are never reserved.
pub fn arb_collection() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,9}"
}

pub fn arb_document_id() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,8}"
}

/// Documents with a string body.
pub fn arb_document() -> impl Strategy<Value = Document> {
    (arb_document_id(), "[a-z ]{0,40}").prop_map(|(id, body)| article(&id, &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_tracks_open_transactions() {
        let provider = InstrumentedEngineProvider::memory();
        let monitor = provider.monitor();
        let engine = provider.create(&TenantId::new("acme")).unwrap();

        let mut first = engine.begin().unwrap();
        first.insert("articles", article("d1", "hello")).unwrap();
        let second = engine.begin().unwrap();
        assert_eq!(monitor.open_transactions(), 2);
        assert_eq!(monitor.max_open_transactions(), 2);

        first.commit().unwrap();
        second.rollback().unwrap();
        assert_eq!(monitor.open_transactions(), 0);
        assert_eq!(monitor.commits(), 1);
        assert_eq!(monitor.rollbacks(), 1);
        assert!(engine.find_by_id("articles", "d1").unwrap().is_some());
    }

    #[test]
    fn test_dropped_transaction_is_counted_down() {
        let provider = InstrumentedEngineProvider::memory();
        let monitor = provider.monitor();
        let engine = provider.create(&TenantId::new("acme")).unwrap();
        drop(engine.begin().unwrap());
        assert_eq!(monitor.open_transactions(), 0);
    }

    #[test]
    fn test_injected_failures_fire_once() {
        let provider = InstrumentedEngineProvider::memory();
        let monitor = provider.monitor();
        let engine = provider.create(&TenantId::new("acme")).unwrap();

        monitor.fail_next_begin();
        assert!(engine.begin().is_err());
        assert!(engine.begin().is_ok());

        monitor.fail_next_commit();
        let mut txn = engine.begin().unwrap();
        txn.insert("articles", article("d1", "x")).unwrap();
        assert!(txn.commit().is_err());
        assert!(engine.find_by_id("articles", "d1").unwrap().is_none());
        assert_eq!(monitor.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_fixed_provider_counts_calls() {
        let provider = FixedEmbeddingProvider::default();
        assert_eq!(provider.embed("a").await.unwrap(), vec![0.1, 0.2, 0.3]);
        assert_eq!(provider.calls(), 1);
        assert_eq!(provider.dimensions(), 3);
    }

    proptest! {
        #[test]
        fn prop_raw_tenants_normalize_to_valid_ids(raw in arb_raw_tenant()) {
            let tenant = TenantId::new(&raw);
            prop_assert!(!tenant.is_system());
            prop_assert!(tenant.validate().is_ok());
            prop_assert_eq!(tenant.as_str(), raw.trim().to_lowercase());
        }
    }
}
