//! Constants for the VESPER server

// ============================================================================
// ENRICHMENT QUEUE
// ============================================================================

/// Collection in the system tenant that holds enrichment tasks
pub const QUEUE_COLLECTION: &str = "_enrichment_queue";

/// Indexed field holding a task's deduplication key
pub const QUEUE_KEY_FIELD: &str = "key";

/// Indexed field holding a task's stored status
pub const QUEUE_STATUS_FIELD: &str = "status";

// ============================================================================
// SYSTEM PRINCIPALS
// ============================================================================

/// Owner recorded on transactions opened by the enrichment worker
pub const ENRICHMENT_WORKER_OWNER: &str = "system:enrichment-worker";

/// Principal named in logs for timeout-driven rollbacks
pub const RECLAIMER_PRINCIPAL: &str = "system:reclaimer";

// ============================================================================
// CACHE QUERY DISCRIMINATORS
// ============================================================================

/// Query key prefix for cached single-document reads
pub const CACHE_QUERY_BY_ID: &str = "id:";

/// Query key for cached full-collection scans
pub const CACHE_QUERY_SCAN: &str = "scan";

// ============================================================================
// TELEMETRY
// ============================================================================

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "vesper_server=debug,vesper_storage=info,info";

/// Environment variable selecting log output format ("json" or text)
pub const LOG_FORMAT_ENV: &str = "VESPER_LOG_FORMAT";
