//! Configuration types
//!
//! Every section reads its own environment variables. Unparseable values
//! fall back to the defaults below; `validate()` rejects values that would
//! stall a background loop.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, VesperResult};

// ============================================================================
// DEFAULTS
// ============================================================================

/// Idle time after which a transaction session is reclaimed (1 minute)
pub const DEFAULT_TX_IDLE_TIMEOUT_SECS: u64 = 60;

/// Interval between reclamation sweeps
pub const DEFAULT_TX_SWEEP_INTERVAL_SECS: u64 = 10;

/// Interval between enrichment worker cycles
pub const DEFAULT_ENRICHMENT_INTERVAL_SECS: u64 = 5;

/// Tasks claimed per enrichment cycle
pub const DEFAULT_ENRICHMENT_BATCH_SIZE: usize = 50;

/// Age after which an in-progress task counts as stale
pub const DEFAULT_ENRICHMENT_STALE_MINUTES: u64 = 10;

/// Retention window for done tasks
pub const DEFAULT_ENRICHMENT_RETENTION_HOURS: u64 = 24;

/// Sliding expiration for cached results (5 minutes)
pub const DEFAULT_CACHE_SLIDING_SECS: u64 = 300;

/// Absolute expiration for cached results (1 hour)
pub const DEFAULT_CACHE_ABSOLUTE_SECS: u64 = 3600;

/// Cache size cap (64 MiB)
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Result sets with more documents than this are not cached
pub const DEFAULT_CACHE_SKIP_THRESHOLD: usize = 10_000;

/// Root directory for tenant stores
pub const DEFAULT_DATA_DIR: &str = "./data";

/// LMDB map size per tenant environment
pub const DEFAULT_MAP_SIZE_MB: usize = 1024;

/// Embedding model requested from the provider
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

/// Embedding endpoint
pub const DEFAULT_EMBEDDING_URL: &str = "http://localhost:11434";

/// Expected embedding dimensions
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 768;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|s| s.to_lowercase() != "false" && s != "0")
        .unwrap_or(default)
}

fn zero_rejected(field: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: format!("{} must be greater than 0", field),
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// Transaction session timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Idle time before a session is rolled back by the sweep
    pub idle_timeout: Duration,
    /// How often the sweep runs
    pub sweep_interval: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_TX_IDLE_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_TX_SWEEP_INTERVAL_SECS),
        }
    }
}

impl TransactionConfig {
    /// # Environment Variables
    /// - `VESPER_TX_IDLE_TIMEOUT_SECS` (default: 60)
    /// - `VESPER_TX_SWEEP_INTERVAL_SECS` (default: 10)
    pub fn from_env() -> Self {
        Self {
            idle_timeout: Duration::from_secs(env_or(
                "VESPER_TX_IDLE_TIMEOUT_SECS",
                DEFAULT_TX_IDLE_TIMEOUT_SECS,
            )),
            sweep_interval: Duration::from_secs(env_or(
                "VESPER_TX_SWEEP_INTERVAL_SECS",
                DEFAULT_TX_SWEEP_INTERVAL_SECS,
            )),
        }
    }

    pub fn development() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(2),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout.is_zero() {
            return Err(zero_rejected("idle_timeout", self.idle_timeout.as_secs()));
        }
        if self.sweep_interval.is_zero() {
            return Err(zero_rejected("sweep_interval", self.sweep_interval.as_secs()));
        }
        Ok(())
    }
}

// ============================================================================
// ENRICHMENT
// ============================================================================

/// Enrichment worker and queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Whether the worker runs at all
    pub enabled: bool,
    /// Worker cycle interval
    pub interval: Duration,
    /// Maximum tasks claimed per cycle
    pub batch_size: usize,
    /// In-progress tasks older than this are re-claimable
    pub stale_after: Duration,
    /// Done tasks older than this are purged
    pub retention: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(DEFAULT_ENRICHMENT_INTERVAL_SECS),
            batch_size: DEFAULT_ENRICHMENT_BATCH_SIZE,
            stale_after: Duration::from_secs(DEFAULT_ENRICHMENT_STALE_MINUTES * 60),
            retention: Duration::from_secs(DEFAULT_ENRICHMENT_RETENTION_HOURS * 3600),
        }
    }
}

impl EnrichmentConfig {
    /// # Environment Variables
    /// - `VESPER_ENRICHMENT_ENABLED` (default: true)
    /// - `VESPER_ENRICHMENT_INTERVAL_SECS` (default: 5)
    /// - `VESPER_ENRICHMENT_BATCH_SIZE` (default: 50)
    /// - `VESPER_ENRICHMENT_STALE_MINUTES` (default: 10)
    /// - `VESPER_ENRICHMENT_RETENTION_HOURS` (default: 24)
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("VESPER_ENRICHMENT_ENABLED", true),
            interval: Duration::from_secs(env_or(
                "VESPER_ENRICHMENT_INTERVAL_SECS",
                DEFAULT_ENRICHMENT_INTERVAL_SECS,
            )),
            batch_size: env_or("VESPER_ENRICHMENT_BATCH_SIZE", DEFAULT_ENRICHMENT_BATCH_SIZE),
            stale_after: Duration::from_secs(
                env_or(
                    "VESPER_ENRICHMENT_STALE_MINUTES",
                    DEFAULT_ENRICHMENT_STALE_MINUTES,
                ) * 60,
            ),
            retention: Duration::from_secs(
                env_or(
                    "VESPER_ENRICHMENT_RETENTION_HOURS",
                    DEFAULT_ENRICHMENT_RETENTION_HOURS,
                ) * 3600,
            ),
        }
    }

    pub fn development() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(1),
            batch_size: 10,
            stale_after: Duration::from_secs(60),
            retention: Duration::from_secs(600),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(zero_rejected("enrichment_interval", self.interval.as_secs()));
        }
        if self.batch_size == 0 {
            return Err(zero_rejected("batch_size", self.batch_size));
        }
        if self.stale_after.is_zero() {
            return Err(zero_rejected("stale_after", self.stale_after.as_secs()));
        }
        Ok(())
    }

    /// Stale window as a chrono duration for timestamp arithmetic.
    pub fn stale_after_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_after).unwrap_or_else(|_| chrono::Duration::days(36_500))
    }

    /// Retention window as a chrono duration for timestamp arithmetic.
    pub fn retention_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::days(36_500))
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Result cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// An entry not read for this long expires
    pub sliding_expiration: Duration,
    /// An entry expires this long after insertion regardless of reads
    pub absolute_expiration: Duration,
    /// Total weight cap across all entries
    pub max_size_bytes: u64,
    /// Result sets larger than this many documents bypass the cache
    pub skip_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sliding_expiration: Duration::from_secs(DEFAULT_CACHE_SLIDING_SECS),
            absolute_expiration: Duration::from_secs(DEFAULT_CACHE_ABSOLUTE_SECS),
            max_size_bytes: DEFAULT_CACHE_MAX_BYTES,
            skip_threshold: DEFAULT_CACHE_SKIP_THRESHOLD,
        }
    }
}

impl CacheConfig {
    /// # Environment Variables
    /// - `VESPER_CACHE_SLIDING_SECS` (default: 300)
    /// - `VESPER_CACHE_ABSOLUTE_SECS` (default: 3600)
    /// - `VESPER_CACHE_MAX_BYTES` (default: 64 MiB)
    /// - `VESPER_CACHE_SKIP_THRESHOLD` (default: 10000)
    pub fn from_env() -> Self {
        Self {
            sliding_expiration: Duration::from_secs(env_or(
                "VESPER_CACHE_SLIDING_SECS",
                DEFAULT_CACHE_SLIDING_SECS,
            )),
            absolute_expiration: Duration::from_secs(env_or(
                "VESPER_CACHE_ABSOLUTE_SECS",
                DEFAULT_CACHE_ABSOLUTE_SECS,
            )),
            max_size_bytes: env_or("VESPER_CACHE_MAX_BYTES", DEFAULT_CACHE_MAX_BYTES),
            skip_threshold: env_or("VESPER_CACHE_SKIP_THRESHOLD", DEFAULT_CACHE_SKIP_THRESHOLD),
        }
    }

    pub fn development() -> Self {
        Self {
            sliding_expiration: Duration::from_secs(30),
            absolute_expiration: Duration::from_secs(120),
            max_size_bytes: 8 * 1024 * 1024,
            skip_threshold: 1_000,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size_bytes == 0 {
            return Err(zero_rejected("max_size_bytes", self.max_size_bytes));
        }
        Ok(())
    }
}

// ============================================================================
// STORAGE
// ============================================================================

/// Which engine backs tenant stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Lmdb,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lmdb" => Ok(StorageBackend::Lmdb),
            "memory" | "mem" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend: {}", other)),
        }
    }
}

/// Storage location settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory; tenants live under `tenants/<id>`
    pub data_dir: PathBuf,
    /// LMDB map size per tenant, in MiB
    pub map_size_mb: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Lmdb,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            map_size_mb: DEFAULT_MAP_SIZE_MB,
        }
    }
}

impl StorageConfig {
    /// # Environment Variables
    /// - `VESPER_STORAGE`: `lmdb` or `memory` (default: lmdb)
    /// - `VESPER_DATA_DIR` (default: ./data)
    /// - `VESPER_MAP_SIZE_MB` (default: 1024)
    pub fn from_env() -> Self {
        Self {
            backend: env_or("VESPER_STORAGE", StorageBackend::Lmdb),
            data_dir: std::env::var("VESPER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR)),
            map_size_mb: env_or("VESPER_MAP_SIZE_MB", DEFAULT_MAP_SIZE_MB),
        }
    }

    pub fn development() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            map_size_mb: 64,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.map_size_mb == 0 {
            return Err(zero_rejected("map_size_mb", self.map_size_mb));
        }
        Ok(())
    }

    /// Map size in bytes.
    pub fn map_size_bytes(&self) -> usize {
        self.map_size_mb.saturating_mul(1024 * 1024)
    }
}

// ============================================================================
// EMBEDDING
// ============================================================================

/// External embedding endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_EMBEDDING_URL.to_string(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl EmbeddingConfig {
    /// # Environment Variables
    /// - `VESPER_EMBEDDING_URL` (default: http://localhost:11434)
    /// - `VESPER_EMBEDDING_MODEL` (default: nomic-embed-text)
    /// - `VESPER_EMBEDDING_DIMENSIONS` (default: 768)
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("VESPER_EMBEDDING_URL")
                .unwrap_or_else(|_| DEFAULT_EMBEDDING_URL.to_string()),
            model: std::env::var("VESPER_EMBEDDING_MODEL")
                .unwrap_or_else(|_| DEFAULT_EMBEDDING_MODEL.to_string()),
            dimensions: env_or("VESPER_EMBEDDING_DIMENSIONS", DEFAULT_EMBEDDING_DIMENSIONS),
        }
    }
}

// ============================================================================
// AGGREGATE
// ============================================================================

/// Full server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VesperConfig {
    pub transactions: TransactionConfig,
    pub enrichment: EnrichmentConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
}

impl VesperConfig {
    pub fn from_env() -> Self {
        Self {
            transactions: TransactionConfig::from_env(),
            enrichment: EnrichmentConfig::from_env(),
            cache: CacheConfig::from_env(),
            storage: StorageConfig::from_env(),
            embedding: EmbeddingConfig::from_env(),
        }
    }

    /// Short timeouts and an in-memory store.
    pub fn development() -> Self {
        Self {
            transactions: TransactionConfig::development(),
            enrichment: EnrichmentConfig::development(),
            cache: CacheConfig::development(),
            storage: StorageConfig::development(),
            embedding: EmbeddingConfig::default(),
        }
    }

    pub fn validate(&self) -> VesperResult<()> {
        self.transactions.validate()?;
        self.enrichment.validate()?;
        self.cache.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}
