//! VESPER Core - Shared Types
//!
//! Pure data structures shared by every other crate: errors, tenant and
//! session identifiers, documents and change records, the enrichment task
//! model and configuration. No I/O happens here.

pub mod config;
pub mod document;
pub mod error;
pub mod identity;
pub mod task;

pub use config::{
    CacheConfig, EmbeddingConfig, EnrichmentConfig, StorageBackend, StorageConfig,
    TransactionConfig, VesperConfig,
};
pub use document::{
    is_reserved_collection, validate_collection_name, validate_document_id, validate_field_name,
    ChangeKind, ChangeRecord, CollectionMetadata, Document, EnrichmentRule, WriteOp,
    MAX_DOCUMENT_ID_LEN, MAX_NAME_LEN, RESERVED_COLLECTION_PREFIX,
};
pub use error::{ConfigError, EngineError, VesperError, VesperResult};
pub use identity::{SessionToken, TenantId, Timestamp, MAX_TENANT_ID_LEN};
pub use task::{effective_status, task_key, EffectiveStatus, EnrichmentTask, TaskStatus};
