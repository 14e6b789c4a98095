//! VESPER Server - Tenant Coordination and Enrichment Layer
//!
//! Routes every request to its tenant's storage engine, allows at most one
//! write transaction per tenant, reclaims abandoned transactions, keeps the
//! result cache consistent with commits, and feeds committed content changes
//! through a persistent queue to the background enrichment worker.
//!
//! [`DatabaseService`] is the entry point a protocol layer uses.

pub mod constants;
pub mod error;
pub mod jobs;
pub mod service;
pub mod services;
pub mod telemetry;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ErrorCode};
pub use jobs::{BackgroundJobs, CycleReport, EnrichmentWorker, JobsReport};
pub use service::{DatabaseService, DocumentCache, ScanCache};
pub use services::{
    CoordinatorSnapshot, EnrichmentTaskQueue, QueueStats, SessionInfo, TransactionCoordinator,
};
pub use telemetry::init_tracing;
