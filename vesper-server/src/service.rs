//! Database Service Facade
//!
//! `DatabaseService` is the surface a protocol layer calls. It owns the
//! tenant registry, the transaction coordinator, the change notifier, the
//! cache invalidator, the enrichment queue and the result caches, and wires
//! them together on open.
//!
//! Every document write accepts an optional session token. With a token the
//! write is staged in that session; without one it runs in its own short
//! transaction through the same coordinator, so per-tenant serialization and
//! synchronous cache invalidation hold for both paths.
//!
//! Collection names, field names and document ids are checked here before
//! they reach a storage key: bounded length, no `\0` or `\u{1f}`.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use vesper_core::{
    validate_collection_name, validate_document_id, validate_field_name, CollectionMetadata,
    Document, EnrichmentRule, SessionToken, StorageBackend, TenantId, VesperConfig, VesperError,
};
use vesper_events::{ChangeNotifier, SubscriptionFilter};
use vesper_llm::{EmbeddingProvider, OllamaEmbeddingProvider};
use vesper_storage::{
    CacheInvalidator, CacheKey, CacheStats, EngineProvider, LmdbEngineProvider,
    MemoryEngineProvider, ObserverFactory, ResultCache, StorageEngine, TenantEntry,
    TenantRegistry,
};

use crate::constants::{CACHE_QUERY_BY_ID, CACHE_QUERY_SCAN};
use crate::error::{ApiError, ApiResult};
use crate::jobs::{
    cache_listener_task, enrichment_worker_task, queue_populator_task, session_reclaim_task,
    BackgroundJobs, EnrichmentWorker,
};
use crate::services::{EnrichmentTaskQueue, QueueStats, SessionInfo, TransactionCoordinator};

/// Cached single-document reads. `None` records a confirmed miss.
pub type DocumentCache = ResultCache<Option<Document>>;

/// Cached full-collection scans.
pub type ScanCache = ResultCache<Arc<Vec<Document>>>;

pub struct DatabaseService {
    config: VesperConfig,
    registry: Arc<TenantRegistry>,
    notifier: ChangeNotifier,
    invalidator: Arc<CacheInvalidator>,
    coordinator: TransactionCoordinator,
    queue: Arc<EnrichmentTaskQueue>,
    provider: Arc<dyn EmbeddingProvider>,
    documents: DocumentCache,
    scans: ScanCache,
}

impl DatabaseService {
    /// Wire every component over the given engine and embedding providers.
    pub fn open(
        config: VesperConfig,
        engines: Arc<dyn EngineProvider>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> ApiResult<Self> {
        config.validate()?;

        let notifier = ChangeNotifier::new();
        let observers: Vec<Arc<dyn ObserverFactory>> = vec![Arc::new(notifier.clone())];
        let registry = Arc::new(TenantRegistry::open(engines, observers)?);
        let invalidator = Arc::new(CacheInvalidator::new());
        let coordinator = TransactionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&invalidator),
            config.transactions.clone(),
        );
        let queue = Arc::new(EnrichmentTaskQueue::open(
            Arc::clone(&registry),
            &config.enrichment,
        )?);
        let documents = ResultCache::new(Arc::clone(&invalidator), config.cache.clone());
        let scans = ResultCache::new(Arc::clone(&invalidator), config.cache.clone());

        tracing::info!(
            backend = ?config.storage.backend,
            enrichment_enabled = config.enrichment.enabled,
            embedding_model = provider.model_id(),
            "Database service opened"
        );

        Ok(Self {
            config,
            registry,
            notifier,
            invalidator,
            coordinator,
            queue,
            provider,
            documents,
            scans,
        })
    }

    /// Open with the engine backend and embedding endpoint named in `config`.
    pub fn from_config(config: VesperConfig) -> ApiResult<Self> {
        let engines: Arc<dyn EngineProvider> = match config.storage.backend {
            StorageBackend::Lmdb => Arc::new(LmdbEngineProvider::new(
                config.storage.data_dir.clone(),
                config.storage.map_size_bytes(),
            )),
            StorageBackend::Memory => Arc::new(MemoryEngineProvider::new()),
        };
        let provider = Arc::new(OllamaEmbeddingProvider::from_config(&config.embedding));
        Self::open(config, engines, provider)
    }

    // ========================================================================
    // BACKGROUND JOBS
    // ========================================================================

    /// Spawn the reclamation sweep, the cache listener and, when enabled,
    /// the queue populator and enrichment worker.
    ///
    /// Subscriptions are registered before this returns, so no commit made
    /// afterwards is missed.
    pub fn start_background_jobs(&self) -> BackgroundJobs {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session_reclaim = tokio::spawn(session_reclaim_task(
            self.coordinator.clone(),
            self.config.transactions.clone(),
            shutdown_rx.clone(),
        ));
        let cache_listener = tokio::spawn(cache_listener_task(
            Arc::clone(&self.invalidator),
            self.notifier.subscribe(SubscriptionFilter::all()),
            shutdown_rx.clone(),
        ));

        let (queue_populator, enrichment_worker) = if self.config.enrichment.enabled {
            let populator = tokio::spawn(queue_populator_task(
                Arc::clone(&self.registry),
                Arc::clone(&self.queue),
                self.notifier.subscribe(SubscriptionFilter::content_changes()),
                shutdown_rx.clone(),
            ));
            let worker = tokio::spawn(enrichment_worker_task(
                self.enrichment_worker(),
                shutdown_rx,
            ));
            (Some(populator), Some(worker))
        } else {
            tracing::info!("Enrichment disabled; populator and worker not started");
            (None, None)
        };

        BackgroundJobs::new(
            shutdown_tx,
            session_reclaim,
            cache_listener,
            queue_populator,
            enrichment_worker,
        )
    }

    /// A worker over this service's queue, for callers that drive cycles
    /// themselves.
    pub fn enrichment_worker(&self) -> EnrichmentWorker {
        EnrichmentWorker::new(
            Arc::clone(&self.registry),
            self.coordinator.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.provider),
            self.config.enrichment.clone(),
        )
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    pub async fn begin_transaction(&self, owner: &str, tenant: &str) -> ApiResult<SessionToken> {
        let tenant = TenantId::new(tenant);
        Ok(self.coordinator.begin(owner, &tenant).await?)
    }

    pub async fn commit(&self, token: &SessionToken, owner: &str) -> ApiResult<()> {
        Ok(self.coordinator.commit(token, owner).await?)
    }

    pub async fn rollback(&self, token: &SessionToken, owner: &str) -> ApiResult<()> {
        Ok(self.coordinator.rollback(token, owner).await?)
    }

    pub async fn touch(&self, token: &SessionToken, owner: &str) -> ApiResult<SessionInfo> {
        Ok(self.coordinator.touch(token, owner).await?)
    }

    pub async fn active_sessions(&self) -> Vec<SessionInfo> {
        self.coordinator.active_sessions().await
    }

    // ========================================================================
    // TENANTS
    // ========================================================================

    pub fn provision_tenant(&self, tenant: &str) -> ApiResult<()> {
        let tenant = TenantId::new(tenant);
        self.registry.provision(&tenant)?;
        Ok(())
    }

    /// Roll back any session on the tenant, close it, then drop its cache
    /// entries.
    pub async fn deprovision_tenant(&self, tenant: &str, delete_files: bool) -> ApiResult<()> {
        let tenant = TenantId::new(tenant);
        if tenant.is_system() {
            return Err(VesperError::invalid_argument(
                "tenant_id",
                "the default tenant cannot be deprovisioned",
            )
            .into());
        }
        let aborted = self.coordinator.abort_tenant(&tenant).await;
        if aborted > 0 {
            tracing::warn!(tenant = %tenant, aborted, "Rolled back sessions before deprovision");
        }
        self.registry.deprovision(&tenant, delete_files)?;
        self.invalidator.invalidate_tenant(&tenant);
        self.coordinator.forget_tenant(&tenant);
        Ok(())
    }

    pub fn list_tenants(&self) -> ApiResult<Vec<TenantEntry>> {
        Ok(self.registry.list_discovered()?)
    }

    /// Copy a tenant's store to `dest`.
    pub fn backup_tenant(&self, tenant: &str, dest: &Path) -> ApiResult<()> {
        let tenant = TenantId::new(tenant);
        let engine = self.engine(&tenant)?;
        engine.backup_to(dest)?;
        tracing::info!(tenant = %tenant, dest = %dest.display(), "Tenant backed up");
        Ok(())
    }

    // ========================================================================
    // COLLECTION METADATA
    // ========================================================================

    pub fn collection_metadata(&self, tenant: &str, collection: &str) -> ApiResult<CollectionMetadata> {
        let tenant = TenantId::new(tenant);
        validate_collection_name(collection)?;
        Ok(self.engine(&tenant)?.collection_metadata(collection)?)
    }

    /// Attach an enrichment rule. Later inserts and updates in the
    /// collection are queued for enrichment.
    pub fn configure_enrichment(
        &self,
        tenant: &str,
        collection: &str,
        rule: EnrichmentRule,
    ) -> ApiResult<()> {
        for field in rule.source_fields.iter().chain([&rule.target_field]) {
            if !field.is_empty() {
                validate_field_name(field)?;
            }
        }
        if rule.source_fields.is_empty() {
            return Err(ApiError::invalid_input("enrichment rule needs at least one source field"));
        }
        if rule.target_field.is_empty() || rule.source_fields.contains(&rule.target_field) {
            return Err(ApiError::invalid_input(
                "enrichment target field must be named and distinct from the source fields",
            ));
        }
        self.update_metadata(tenant, collection, |metadata| {
            metadata.enrichment = Some(rule);
        })
    }

    /// Remove the collection's enrichment rule. Tasks already queued are
    /// completed without a write when claimed.
    pub fn remove_enrichment(&self, tenant: &str, collection: &str) -> ApiResult<()> {
        self.update_metadata(tenant, collection, |metadata| {
            metadata.enrichment = None;
        })
    }

    /// Add a secondary index on `field`.
    pub fn create_index(&self, tenant: &str, collection: &str, field: &str) -> ApiResult<()> {
        validate_field_name(field)?;
        self.update_metadata(tenant, collection, |metadata| {
            if !metadata.is_indexed(field) {
                metadata.indexes.push(field.to_string());
            }
        })
    }

    fn update_metadata<F>(&self, tenant: &str, collection: &str, change: F) -> ApiResult<()>
    where
        F: FnOnce(&mut CollectionMetadata),
    {
        let tenant = TenantId::new(tenant);
        validate_collection_name(collection)?;
        let engine = self.engine(&tenant)?;
        let mut metadata = engine.collection_metadata(collection)?;
        change(&mut metadata);
        engine.set_collection_metadata(collection, metadata)?;
        tracing::debug!(tenant = %tenant, collection, "Collection metadata updated");
        Ok(())
    }

    // ========================================================================
    // DOCUMENTS
    // ========================================================================

    pub async fn insert(
        &self,
        tenant: &str,
        collection: &str,
        doc: Document,
        session: Option<(&SessionToken, &str)>,
    ) -> ApiResult<Document> {
        let tenant = TenantId::new(tenant);
        check_keys(collection, &doc.id)?;
        match session {
            Some((token, owner)) => {
                self.check_session_tenant(token, owner, &tenant).await?;
                Ok(self.coordinator.insert(token, owner, collection, doc).await?)
            }
            None => {
                let (token, owner) = self.begin_auto(&tenant).await?;
                let staged = self.coordinator.insert(&token, owner, collection, doc).await;
                self.finish_auto(&token, owner, staged).await
            }
        }
    }

    pub async fn update(
        &self,
        tenant: &str,
        collection: &str,
        doc: Document,
        session: Option<(&SessionToken, &str)>,
    ) -> ApiResult<()> {
        let tenant = TenantId::new(tenant);
        check_keys(collection, &doc.id)?;
        match session {
            Some((token, owner)) => {
                self.check_session_tenant(token, owner, &tenant).await?;
                Ok(self.coordinator.update(token, owner, collection, doc).await?)
            }
            None => {
                let (token, owner) = self.begin_auto(&tenant).await?;
                let staged = self.coordinator.update(&token, owner, collection, doc).await;
                self.finish_auto(&token, owner, staged).await
            }
        }
    }

    pub async fn delete(
        &self,
        tenant: &str,
        collection: &str,
        id: &str,
        session: Option<(&SessionToken, &str)>,
    ) -> ApiResult<()> {
        let tenant = TenantId::new(tenant);
        check_keys(collection, id)?;
        match session {
            Some((token, owner)) => {
                self.check_session_tenant(token, owner, &tenant).await?;
                Ok(self.coordinator.delete(token, owner, collection, id).await?)
            }
            None => {
                let (token, owner) = self.begin_auto(&tenant).await?;
                let staged = self.coordinator.delete(&token, owner, collection, id).await;
                self.finish_auto(&token, owner, staged).await
            }
        }
    }

    /// Read one document. Inside a session the read sees the session's
    /// staged writes; otherwise it is served through the result cache.
    pub async fn find(
        &self,
        tenant: &str,
        collection: &str,
        id: &str,
        session: Option<(&SessionToken, &str)>,
    ) -> ApiResult<Option<Document>> {
        let tenant = TenantId::new(tenant);
        check_keys(collection, id)?;
        if let Some((token, owner)) = session {
            self.check_session_tenant(token, owner, &tenant).await?;
            return Ok(self.coordinator.find(token, owner, collection, id).await?);
        }

        let key = CacheKey::new(&tenant, collection, format!("{}{}", CACHE_QUERY_BY_ID, id));
        let doc = self.documents.get_or_compute(key, || {
            Ok(self.engine(&tenant)?.find_by_id(collection, id)?)
        })?;
        Ok(doc)
    }

    /// Every document in a collection, served through the result cache.
    pub fn scan_cached(&self, tenant: &str, collection: &str) -> ApiResult<Arc<Vec<Document>>> {
        let tenant = TenantId::new(tenant);
        validate_collection_name(collection)?;
        let key = CacheKey::new(&tenant, collection, CACHE_QUERY_SCAN);
        let docs = self.scans.get_or_compute(key, || {
            Ok(Arc::new(self.engine(&tenant)?.scan(collection)?))
        })?;
        Ok(docs)
    }

    /// Auto-committed writes run under a per-call owner.
    async fn begin_auto(&self, tenant: &TenantId) -> ApiResult<(SessionToken, &'static str)> {
        let owner = AUTO_COMMIT_OWNER;
        let token = self.coordinator.begin(owner, tenant).await?;
        Ok((token, owner))
    }

    async fn finish_auto<T>(
        &self,
        token: &SessionToken,
        owner: &str,
        staged: Result<T, VesperError>,
    ) -> ApiResult<T> {
        match staged {
            Ok(value) => {
                self.coordinator.commit(token, owner).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.coordinator.rollback(token, owner).await {
                    tracing::warn!(error = %rollback_err, "Rollback of auto-commit write failed");
                }
                Err(e.into())
            }
        }
    }

    async fn check_session_tenant(
        &self,
        token: &SessionToken,
        owner: &str,
        tenant: &TenantId,
    ) -> ApiResult<()> {
        let session_tenant = self.coordinator.session_tenant(token, owner).await?;
        if &session_tenant != tenant {
            return Err(VesperError::invalid_argument(
                "tenant_id",
                format!(
                    "transaction belongs to tenant {}, not {}",
                    session_tenant, tenant
                ),
            )
            .into());
        }
        Ok(())
    }

    fn engine(&self, tenant: &TenantId) -> Result<Arc<dyn StorageEngine>, VesperError> {
        self.registry.resolve(tenant)?.engine()
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &VesperConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn invalidator(&self) -> &Arc<CacheInvalidator> {
        &self.invalidator
    }

    pub fn queue(&self) -> &Arc<EnrichmentTaskQueue> {
        &self.queue
    }

    pub fn queue_stats(&self) -> ApiResult<QueueStats> {
        Ok(self.queue.stats()?)
    }

    pub fn document_cache_stats(&self) -> CacheStats {
        self.documents.stats()
    }

    pub fn scan_cache_stats(&self) -> CacheStats {
        self.scans.stats()
    }

    /// Roll back every open session and close every tenant.
    ///
    /// Call after [`BackgroundJobs::shutdown`].
    pub async fn shutdown(&self) -> usize {
        let mut aborted = 0;
        for tenant in self.registry.active() {
            aborted += self.coordinator.abort_tenant(&tenant).await;
        }
        aborted += self.coordinator.abort_tenant(&TenantId::system()).await;
        let closed = self.registry.shutdown();
        tracing::info!(aborted, closed, "Database service shut down");
        closed
    }
}

/// Owner recorded on single-write transactions.
const AUTO_COMMIT_OWNER: &str = "system:auto-commit";

fn check_keys(collection: &str, id: &str) -> Result<(), VesperError> {
    validate_collection_name(collection)?;
    validate_document_id(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use vesper_test_utils::FixedEmbeddingProvider;

    fn service() -> DatabaseService {
        DatabaseService::open(
            VesperConfig::development(),
            Arc::new(MemoryEngineProvider::new()),
            Arc::new(FixedEmbeddingProvider::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_auto_commit_write_is_visible() {
        let service = service();
        service.provision_tenant("acme").unwrap();
        service
            .insert("acme", "articles", Document::new("d1").with_field("body", "hi"), None)
            .await
            .unwrap();
        let doc = service.find("acme", "articles", "d1", None).await.unwrap();
        assert_eq!(doc.unwrap().get("body"), Some(&serde_json::json!("hi")));
        assert!(!service.coordinator().is_locked(&TenantId::new("acme")));
    }

    #[tokio::test]
    async fn test_failed_auto_commit_releases_lock() {
        let service = service();
        service.provision_tenant("acme").unwrap();
        let err = service
            .update("acme", "articles", Document::new("missing"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EntityNotFound);
        assert!(!service.coordinator().is_locked(&TenantId::new("acme")));
    }

    #[tokio::test]
    async fn test_session_write_for_other_tenant_is_rejected() {
        let service = service();
        service.provision_tenant("acme").unwrap();
        service.provision_tenant("globex").unwrap();
        let token = service.begin_transaction("alice", "acme").await.unwrap();

        let err = service
            .insert("globex", "articles", Document::new("d1"), Some((&token, "alice")))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        service.rollback(&token, "alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_session_reads_see_staged_writes() {
        let service = service();
        service.provision_tenant("acme").unwrap();
        let token = service.begin_transaction("alice", "acme").await.unwrap();
        service
            .insert("acme", "articles", Document::new("d1"), Some((&token, "alice")))
            .await
            .unwrap();

        let inside = service
            .find("acme", "articles", "d1", Some((&token, "alice")))
            .await
            .unwrap();
        assert!(inside.is_some());
        service.rollback(&token, "alice").await.unwrap();
        let outside = service.find("acme", "articles", "d1", None).await.unwrap();
        assert!(outside.is_none());
    }

    #[test]
    fn test_enrichment_rule_validation() {
        let service = service();
        service.provision_tenant("acme").unwrap();
        let err = service
            .configure_enrichment("acme", "articles", EnrichmentRule::new(Vec::new(), "embedding"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);

        service
            .configure_enrichment(
                "acme",
                "articles",
                EnrichmentRule::new(vec!["body".to_string()], "embedding"),
            )
            .unwrap();
        assert!(service
            .collection_metadata("acme", "articles")
            .unwrap()
            .enrichment
            .is_some());
        service.remove_enrichment("acme", "articles").unwrap();
        assert!(service
            .collection_metadata("acme", "articles")
            .unwrap()
            .enrichment
            .is_none());
    }

    #[tokio::test]
    async fn test_separators_and_oversized_keys_are_rejected() {
        let service = service();
        service.provision_tenant("acme").unwrap();

        let err = service
            .insert("acme", "art\u{1f}icles", Document::new("d1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        let err = service
            .insert("acme", "articles", Document::new("d\u{0}1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        let err = service
            .find("acme", "articles", &"x".repeat(450), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert_eq!(
            service.scan_cached("acme", &"c".repeat(65)).unwrap_err().code,
            ErrorCode::InvalidInput
        );
        assert_eq!(
            service.create_index("acme", "articles", "ti\u{1f}tle").unwrap_err().code,
            ErrorCode::InvalidInput
        );
        let err = service
            .configure_enrichment(
                "acme",
                "articles",
                EnrichmentRule::new(vec!["bo\u{0}dy".to_string()], "embedding"),
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);

        // Nothing was written and no lock is left behind.
        assert!(service.scan_cached("acme", "articles").unwrap().is_empty());
        assert!(!service.coordinator().is_locked(&TenantId::new("acme")));
    }

    #[tokio::test]
    async fn test_deprovision_forgets_tenant_lock() {
        let service = service();
        service.provision_tenant("acme").unwrap();
        service
            .insert("acme", "articles", Document::new("d1"), None)
            .await
            .unwrap();
        assert_eq!(service.coordinator().tracked_tenants(), 1);

        service.deprovision_tenant("acme", true).await.unwrap();
        assert_eq!(service.coordinator().tracked_tenants(), 0);
    }

    #[tokio::test]
    async fn test_deprovision_default_tenant_is_invalid() {
        let service = service();
        let err = service.deprovision_tenant("", false).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }
}
