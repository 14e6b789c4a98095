//! Cache of computed read results, scoped by (tenant, collection).
//!
//! Entries carry the [`SignalToken`] captured before their value was
//! computed, so a commit that lands between "compute" and "insert" keeps the
//! pre-commit value out of the cache. Size accounting is explicit: every
//! cached type says what it weighs through [`CacheWeight`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;
use vesper_core::{CacheConfig, Document, TenantId, VesperResult};

use super::invalidator::{CacheInvalidator, SignalToken};

/// Explicit size accounting for cached values.
pub trait CacheWeight {
    /// Approximate heap footprint in bytes.
    fn weight(&self) -> u64;

    /// Number of result items, compared against the skip threshold.
    fn item_count(&self) -> usize {
        1
    }
}

fn value_weight(value: &Value) -> u64 {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len() as u64,
        Value::Array(items) => 8 + items.iter().map(value_weight).sum::<u64>(),
        Value::Object(map) => {
            8 + map
                .iter()
                .map(|(k, v)| k.len() as u64 + value_weight(v))
                .sum::<u64>()
        }
    }
}

impl CacheWeight for Document {
    fn weight(&self) -> u64 {
        self.id.len() as u64
            + self
                .fields
                .iter()
                .map(|(k, v)| k.len() as u64 + value_weight(v))
                .sum::<u64>()
    }
}

impl<T: CacheWeight> CacheWeight for Option<T> {
    fn weight(&self) -> u64 {
        self.as_ref().map(CacheWeight::weight).unwrap_or(1)
    }
}

impl<T: CacheWeight> CacheWeight for Vec<T> {
    fn weight(&self) -> u64 {
        self.iter().map(CacheWeight::weight).sum()
    }

    fn item_count(&self) -> usize {
        self.len()
    }
}

impl<T: CacheWeight> CacheWeight for Arc<T> {
    fn weight(&self) -> u64 {
        self.as_ref().weight()
    }

    fn item_count(&self) -> usize {
        self.as_ref().item_count()
    }
}

/// Identifies one cached result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant: TenantId,
    pub collection: String,
    /// Producer-defined query discriminator.
    pub query: String,
}

impl CacheKey {
    pub fn new(tenant: &TenantId, collection: &str, query: impl Into<String>) -> Self {
        Self {
            tenant: tenant.clone(),
            collection: collection.to_string(),
            query: query.into(),
        }
    }
}

struct CacheEntry<V> {
    value: V,
    token: SignalToken,
    weight: u64,
    inserted_at: Instant,
    last_access: Mutex<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant, config: &CacheConfig) -> bool {
        if self.token.is_fired() {
            return false;
        }
        if now.saturating_duration_since(self.inserted_at) >= config.absolute_expiration {
            return false;
        }
        let last = self.last_access.lock().map(|t| *t).unwrap_or(self.inserted_at);
        now.saturating_duration_since(last) < config.sliding_expiration
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Results not cached because of size or a racing invalidation
    pub skipped: u64,
    pub entry_count: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    skipped: AtomicU64,
}

/// Result cache bound to a [`CacheInvalidator`].
pub struct ResultCache<V> {
    entries: DashMap<CacheKey, CacheEntry<V>>,
    invalidator: Arc<CacheInvalidator>,
    config: CacheConfig,
    total_weight: AtomicU64,
    counters: CacheCounters,
}

impl<V: CacheWeight + Clone> ResultCache<V> {
    pub fn new(invalidator: Arc<CacheInvalidator>, config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            invalidator,
            config,
            total_weight: AtomicU64::new(0),
            counters: CacheCounters::default(),
        }
    }

    pub fn invalidator(&self) -> &Arc<CacheInvalidator> {
        &self.invalidator
    }

    /// Capture the signals for a key. Call before computing its value.
    pub fn token_for(&self, key: &CacheKey) -> SignalToken {
        self.invalidator.token(&key.tenant, &key.collection)
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &CacheKey, now: Instant) -> Option<V> {
        let live = match self.entries.get(key) {
            Some(entry) if entry.is_live(now, &self.config) => {
                if let Ok(mut last) = entry.last_access.lock() {
                    *last = now;
                }
                Some(entry.value.clone())
            }
            Some(_) => None,
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        match live {
            Some(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.remove(key);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value computed under `token`. Returns whether it was cached.
    pub fn insert(&self, key: CacheKey, value: V, token: SignalToken) -> bool {
        self.insert_at(key, value, token, Instant::now())
    }

    fn insert_at(&self, key: CacheKey, value: V, token: SignalToken, now: Instant) -> bool {
        if token.is_fired() {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            trace!(tenant = %key.tenant, collection = %key.collection, "Skipped result computed before invalidation");
            return false;
        }
        let weight = value.weight();
        if value.item_count() > self.config.skip_threshold || weight > self.config.max_size_bytes {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.remove(&key);
        self.make_room(weight, now);

        let entry = CacheEntry {
            value,
            token,
            weight,
            inserted_at: now,
            last_access: Mutex::new(now),
        };
        if let Some(previous) = self.entries.insert(key, entry) {
            self.total_weight.fetch_sub(previous.weight, Ordering::AcqRel);
        }
        self.total_weight.fetch_add(weight, Ordering::AcqRel);
        true
    }

    /// Serve from cache or compute, capturing the token first.
    pub fn get_or_compute<F>(&self, key: CacheKey, compute: F) -> VesperResult<V>
    where
        F: FnOnce() -> VesperResult<V>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let token = self.token_for(&key);
        let value = compute()?;
        self.insert(key, value.clone(), token);
        Ok(value)
    }

    fn remove(&self, key: &CacheKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.total_weight.fetch_sub(entry.weight, Ordering::AcqRel);
        }
    }

    /// Drop dead entries, then the least recently inserted ones, until
    /// `incoming` fits under the cap.
    fn make_room(&self, incoming: u64, now: Instant) {
        let cap = self.config.max_size_bytes;
        if self.total_weight.load(Ordering::Acquire) + incoming <= cap {
            return;
        }

        let dead: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_live(now, &self.config))
            .map(|e| e.key().clone())
            .collect();
        for key in dead {
            self.remove(&key);
        }

        let mut by_age: Vec<(Instant, CacheKey)> = self
            .entries
            .iter()
            .map(|e| (e.value().inserted_at, e.key().clone()))
            .collect();
        by_age.sort_by_key(|(at, _)| *at);
        for (_, key) in by_age {
            if self.total_weight.load(Ordering::Acquire) + incoming <= cap {
                break;
            }
            self.remove(&key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            memory_bytes: self.total_weight.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> CacheConfig {
        CacheConfig {
            sliding_expiration: Duration::from_secs(10),
            absolute_expiration: Duration::from_secs(60),
            max_size_bytes: 1_000,
            skip_threshold: 3,
        }
    }

    fn cache() -> ResultCache<Vec<Document>> {
        ResultCache::new(Arc::new(CacheInvalidator::new()), config())
    }

    fn docs(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| Document::new(format!("d{}", i)).with_field("t", "x"))
            .collect()
    }

    fn key(collection: &str) -> CacheKey {
        CacheKey::new(&TenantId::new("acme"), collection, "scan")
    }

    #[test]
    fn test_invalidation_evicts_entry() {
        let cache = cache();
        let k = key("articles");
        cache.insert(k.clone(), docs(2), cache.token_for(&k));
        assert_eq!(cache.get(&k).map(|d| d.len()), Some(2));

        cache.invalidator().invalidate(&k.tenant, "articles");
        assert!(cache.get(&k).is_none());
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[test]
    fn test_value_computed_before_invalidation_is_not_cached() {
        let cache = cache();
        let k = key("articles");
        let token = cache.token_for(&k);
        // A commit lands while the value is being computed.
        cache.invalidator().invalidate(&k.tenant, "articles");
        assert!(!cache.insert(k.clone(), docs(1), token));
        assert!(cache.get(&k).is_none());
        assert_eq!(cache.stats().skipped, 1);
    }

    #[test]
    fn test_oversized_results_skip_the_cache() {
        let cache = cache();
        let k = key("articles");
        assert!(!cache.insert(k.clone(), docs(4), cache.token_for(&k)));
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn test_sliding_and_absolute_expiration() {
        let cache = cache();
        let k = key("articles");
        let start = Instant::now();
        cache.insert_at(k.clone(), docs(1), cache.token_for(&k), start);

        assert!(cache.get_at(&k, start + Duration::from_secs(9)).is_some());
        assert!(cache.get_at(&k, start + Duration::from_secs(18)).is_some());
        assert!(cache.get_at(&k, start + Duration::from_secs(29)).is_none());

        cache.insert_at(k.clone(), docs(1), cache.token_for(&k), start);
        let mut t = start;
        for _ in 0..6 {
            t += Duration::from_secs(9);
            assert!(cache.get_at(&k, t).is_some());
        }
        assert!(cache.get_at(&k, start + Duration::from_secs(61)).is_none());
    }

    #[test]
    fn test_weight_cap_evicts_oldest() {
        let invalidator = Arc::new(CacheInvalidator::new());
        let cfg = CacheConfig {
            max_size_bytes: 50,
            ..config()
        };
        let cache: ResultCache<Document> = ResultCache::new(invalidator, cfg);
        let big = Document::new("a").with_field("body", "x".repeat(30));
        let start = Instant::now();

        let k1 = key("one");
        let k2 = key("two");
        cache.insert_at(k1.clone(), big.clone(), cache.token_for(&k1), start);
        cache.insert_at(k2.clone(), big, cache.token_for(&k2), start + Duration::from_secs(1));

        assert!(cache.get_at(&k1, start + Duration::from_secs(2)).is_none());
        assert!(cache.get_at(&k2, start + Duration::from_secs(2)).is_some());
        assert!(cache.stats().memory_bytes <= 50);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_get_or_compute_caches_once() {
        let cache = cache();
        let k = key("articles");
        let mut calls = 0;
        let first = cache
            .get_or_compute(k.clone(), || {
                calls += 1;
                Ok(docs(1))
            })
            .unwrap();
        let second = cache.get_or_compute(k, || Ok(docs(3))).unwrap();
        assert_eq!(calls, 1);
        assert_eq!(first, second);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// Accounted weight never exceeds the cap and always equals the sum
        /// of live entry weights.
        #[test]
        fn prop_weight_accounting(sizes in proptest::collection::vec(1usize..40, 1..30)) {
            let cfg = CacheConfig {
                sliding_expiration: Duration::from_secs(60),
                absolute_expiration: Duration::from_secs(60),
                max_size_bytes: 200,
                skip_threshold: 100,
            };
            let cache: ResultCache<Document> =
                ResultCache::new(Arc::new(CacheInvalidator::new()), cfg);
            let tenant = TenantId::new("acme");

            for (i, size) in sizes.iter().enumerate() {
                let key = CacheKey::new(&tenant, "c", format!("q{}", i % 7));
                let doc = Document::new("d").with_field("b", "x".repeat(*size));
                cache.insert(key.clone(), doc, cache.token_for(&key));
            }

            let stats = cache.stats();
            prop_assert!(stats.memory_bytes <= 200);
            let summed: u64 = cache.entries.iter().map(|e| e.value().weight).sum();
            prop_assert_eq!(stats.memory_bytes, summed);
        }
    }
}
