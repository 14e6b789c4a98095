//! Coordination services
//!
//! - `transaction_coordinator`: per-tenant single-writer sessions
//! - `enrichment_queue`: persistent, deduplicating enrichment task queue

pub mod enrichment_queue;
pub mod transaction_coordinator;

pub use enrichment_queue::{EnrichmentTaskQueue, QueueStats};
pub use transaction_coordinator::{
    CoordinatorMetrics, CoordinatorSnapshot, SessionInfo, TransactionCoordinator,
};
