//! Error Types for the VESPER server
//!
//! `ApiError` is what a protocol layer sees: a stable [`ErrorCode`] plus a
//! human-readable message. Storage and coordination failures are mapped onto
//! codes here so callers never match on engine internals.

use serde::{Deserialize, Serialize};
use std::fmt;
use vesper_core::{EngineError, VesperError};

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for protocol responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Authorization
    // ========================================================================
    /// Caller does not own the transaction
    Forbidden,

    // ========================================================================
    // Validation
    // ========================================================================
    /// Request contains invalid input data
    InvalidInput,

    // ========================================================================
    // Not Found
    // ========================================================================
    /// Tenant is not provisioned
    TenantNotFound,

    /// Transaction token is unknown
    TransactionNotFound,

    /// Document does not exist
    EntityNotFound,

    // ========================================================================
    // Conflict
    // ========================================================================
    /// Tenant provisioning state conflicts with the request
    TenantConflict,

    /// Document with the same id already exists
    EntityAlreadyExists,

    /// Transaction was reclaimed after its idle timeout
    TransactionExpired,

    // ========================================================================
    // Server
    // ========================================================================
    /// Storage engine failure
    DatabaseError,

    /// Enrichment provider failure
    ServiceUnavailable,

    /// Internal server error
    InternalError,
}

impl ErrorCode {
    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Forbidden => "Access forbidden",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::TenantNotFound => "Tenant not found",
            ErrorCode::TransactionNotFound => "Transaction not found",
            ErrorCode::EntityNotFound => "Entity not found",
            ErrorCode::TenantConflict => "Tenant state conflict",
            ErrorCode::EntityAlreadyExists => "Entity already exists",
            ErrorCode::TransactionExpired => "Transaction expired",
            ErrorCode::DatabaseError => "Database operation failed",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::InternalError => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error returned across the protocol boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create an error with the code's default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn tenant_not_found(tenant: impl fmt::Display) -> Self {
        Self::new(ErrorCode::TenantNotFound, format!("Tenant {} not found", tenant))
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match &err {
            EngineError::DuplicateId { .. } => {
                Self::new(ErrorCode::EntityAlreadyExists, err.to_string())
            }
            EngineError::DocumentNotFound { collection, id } => Self::new(
                ErrorCode::EntityNotFound,
                err.to_string(),
            )
            .with_details(serde_json::json!({ "collection": collection, "id": id })),
            _ => Self::new(ErrorCode::DatabaseError, err.to_string()),
        }
    }
}

impl From<VesperError> for ApiError {
    fn from(err: VesperError) -> Self {
        match err {
            VesperError::NotProvisioned { tenant } => Self::tenant_not_found(tenant),
            VesperError::AlreadyActive { tenant } => Self::new(
                ErrorCode::TenantConflict,
                format!("Tenant {} is already active", tenant),
            ),
            VesperError::NotActive { tenant } => Self::new(
                ErrorCode::TenantConflict,
                format!("Tenant {} is not active", tenant),
            ),
            VesperError::SessionNotFound => Self::from_code(ErrorCode::TransactionNotFound),
            VesperError::SessionExpired => Self::new(
                ErrorCode::TransactionExpired,
                "Transaction expired; begin a new transaction",
            ),
            VesperError::SessionForbidden => Self::new(
                ErrorCode::Forbidden,
                "Transaction is owned by another caller",
            ),
            VesperError::InvalidArgument { argument, reason } => {
                Self::invalid_input(format!("{}: {}", argument, reason))
            }
            VesperError::Engine(engine) => engine.into(),
            VesperError::Enrichment { reason } => Self::new(ErrorCode::ServiceUnavailable, reason),
            VesperError::Config(config) => Self::internal_error(config.to_string()),
        }
    }
}

/// Result type for the server's protocol-facing API.
pub type ApiResult<T> = Result<T, ApiError>;
