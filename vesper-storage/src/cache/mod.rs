//! Result caching with per-(tenant, collection) invalidation.
//!
//! [`CacheInvalidator`] owns one epoch signal per pair; [`ResultCache`]
//! stores values together with the signals they were computed under and
//! drops them once a signal fires. Commits invalidate synchronously through
//! the transaction coordinator, so a read issued after a commit returns never
//! sees a pre-commit result.

pub mod invalidator;
pub mod result_cache;

pub use invalidator::{CacheInvalidator, InvalidationSignal, InvalidationSnapshot, SignalToken};
pub use result_cache::{CacheKey, CacheStats, CacheWeight, ResultCache};
