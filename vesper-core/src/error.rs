//! Error types for vesper operations

use thiserror::Error;

/// Failures raised by a storage engine.
///
/// These are opaque to callers of the coordination layer: they are surfaced
/// as [`VesperError::Engine`] and never swallowed on the begin/commit/rollback
/// paths.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Storage engine is closed")]
    Closed,

    #[error("Document {id} already exists in collection {collection}")]
    DuplicateId { collection: String, id: String },

    #[error("Document {id} not found in collection {collection}")]
    DocumentNotFound { collection: String, id: String },

    #[error("I/O error: {reason}")]
    Io { reason: String },

    #[error("Backend error: {reason}")]
    Backend { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl EngineError {
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }

    pub fn io(reason: impl Into<String>) -> Self {
        Self::Io {
            reason: reason.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for the coordination layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VesperError {
    #[error("Tenant not provisioned: {tenant}")]
    NotProvisioned { tenant: String },

    #[error("Tenant already active: {tenant}")]
    AlreadyActive { tenant: String },

    #[error("Tenant not active: {tenant}")]
    NotActive { tenant: String },

    #[error("Transaction not found")]
    SessionNotFound,

    #[error("Transaction is owned by another caller")]
    SessionForbidden,

    #[error("Transaction expired after idle timeout")]
    SessionExpired,

    #[error("Invalid argument {argument}: {reason}")]
    InvalidArgument { argument: String, reason: String },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Enrichment failed: {reason}")]
    Enrichment { reason: String },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl VesperError {
    pub fn invalid_argument(argument: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument: argument.into(),
            reason: reason.into(),
        }
    }

    pub fn enrichment(reason: impl Into<String>) -> Self {
        Self::Enrichment {
            reason: reason.into(),
        }
    }

    /// True for the "begin a new transaction" family of failures.
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound | Self::SessionExpired | Self::SessionForbidden
        )
    }
}

/// Result type alias for vesper operations.
pub type VesperResult<T> = Result<T, VesperError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_converts_into_vesper_error() {
        let err: VesperError = EngineError::Closed.into();
        assert_eq!(err, VesperError::Engine(EngineError::Closed));
        assert!(format!("{}", err).contains("closed"));
    }

    #[test]
    fn test_not_provisioned_display_names_tenant() {
        let err = VesperError::NotProvisioned {
            tenant: "acme".to_string(),
        };
        assert_eq!(format!("{}", err), "Tenant not provisioned: acme");
    }

    #[test]
    fn test_session_error_classification() {
        assert!(VesperError::SessionNotFound.is_session_error());
        assert!(VesperError::SessionExpired.is_session_error());
        assert!(VesperError::SessionForbidden.is_session_error());
        assert!(!VesperError::Engine(EngineError::Closed).is_session_error());
    }

    #[test]
    fn test_duplicate_id_display() {
        let err = EngineError::DuplicateId {
            collection: "articles".to_string(),
            id: "d1".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Document d1 already exists in collection articles"
        );
    }
}
