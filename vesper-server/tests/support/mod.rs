//! Shared harness for the server integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;
use vesper_core::StorageBackend;
use vesper_events::{Subscription, SubscriptionFilter};
use vesper_llm::EmbeddingProvider;
use vesper_server::jobs::{enqueue_batch, QueuePopulatorMetrics};
use vesper_server::DatabaseService;
use vesper_storage::{EngineProvider, LmdbEngineProvider};
use vesper_test_utils::{
    body_embedding_rule, test_config, EngineMonitor, FixedEmbeddingProvider,
    InstrumentedEngineProvider, VesperConfig,
};

pub const ACME: &str = "acme";
pub const ALICE: &str = "alice";
pub const BOB: &str = "bob";

pub struct Harness {
    pub service: DatabaseService,
    pub monitor: Arc<EngineMonitor>,
    pub embeddings: Arc<FixedEmbeddingProvider>,
}

impl Harness {
    /// Service over instrumented in-memory engines with `acme` provisioned.
    pub fn new() -> Self {
        Self::with_config(test_config(50))
    }

    pub fn with_config(config: VesperConfig) -> Self {
        let embeddings = Arc::new(FixedEmbeddingProvider::default());
        Self::with_provider(config, Arc::clone(&embeddings) as Arc<dyn EmbeddingProvider>, embeddings)
    }

    /// Service over instrumented LMDB engines stored under `dir`.
    pub fn lmdb(dir: &TempDir) -> Self {
        let mut config = test_config(50);
        config.storage.backend = StorageBackend::Lmdb;
        config.storage.data_dir = dir.path().to_path_buf();
        let lmdb: Arc<dyn EngineProvider> = Arc::new(LmdbEngineProvider::new(
            dir.path(),
            config.storage.map_size_bytes(),
        ));
        let embeddings = Arc::new(FixedEmbeddingProvider::default());
        Self::over(
            config,
            InstrumentedEngineProvider::wrap(lmdb),
            Arc::clone(&embeddings) as Arc<dyn EmbeddingProvider>,
            embeddings,
        )
    }

    pub fn with_provider(
        config: VesperConfig,
        provider: Arc<dyn EmbeddingProvider>,
        embeddings: Arc<FixedEmbeddingProvider>,
    ) -> Self {
        Self::over(config, InstrumentedEngineProvider::memory(), provider, embeddings)
    }

    fn over(
        config: VesperConfig,
        engines: InstrumentedEngineProvider,
        provider: Arc<dyn EmbeddingProvider>,
        embeddings: Arc<FixedEmbeddingProvider>,
    ) -> Self {
        let monitor = engines.monitor();
        let service = DatabaseService::open(config, Arc::new(engines), provider)
            .expect("service opens");
        service.provision_tenant(ACME).expect("acme provisions");
        Self {
            service,
            monitor,
            embeddings,
        }
    }

    /// Attach the `body -> embedding` rule to `articles`.
    pub fn enrich_articles(&self) {
        self.service
            .configure_enrichment(ACME, "articles", body_embedding_rule())
            .expect("rule configured");
    }

    pub fn content_subscription(&self) -> Subscription {
        self.service
            .notifier()
            .subscribe(SubscriptionFilter::content_changes())
    }

    /// Feed every batch already delivered to `subscription` into the queue,
    /// as the populator job would.
    pub fn drain_into_queue(&self, subscription: &mut Subscription) -> QueuePopulatorMetrics {
        let metrics = QueuePopulatorMetrics::default();
        while let Some(batch) = subscription.try_recv() {
            enqueue_batch(
                self.service.registry(),
                self.service.queue(),
                &batch,
                &metrics,
            );
        }
        metrics
    }
}
