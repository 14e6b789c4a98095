//! VESPER Storage - Engines, Tenant Registry and Result Cache
//!
//! Defines the storage engine seam used by the coordination layer, the LMDB
//! and in-memory engines behind it, the registry that maps tenants to open
//! engines, and the invalidation-aware result cache.

pub mod cache;
pub mod engine;
pub mod registry;

pub use cache::{
    CacheInvalidator, CacheKey, CacheStats, CacheWeight, InvalidationSnapshot, ResultCache,
    SignalToken,
};
pub use engine::{
    CommitObserver, EngineProvider, EngineResult, EngineTransaction, LmdbEngine,
    LmdbEngineProvider, MemoryEngine, MemoryEngineProvider, ObserverFactory, StagedTransaction,
    StorageEngine,
};
pub use registry::{TenantEntry, TenantHandle, TenantRegistry};
