//! Identity types for tenants and transaction sessions

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{VesperError, VesperResult};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Number of random bytes behind a session token.
const SESSION_TOKEN_BYTES: usize = 32;

/// Longest accepted tenant identifier, in bytes.
pub const MAX_TENANT_ID_LEN: usize = 64;

/// Canonical tenant identifier.
///
/// Identifiers are trimmed and lower-cased on construction, so two spellings
/// of the same tenant always map to the same storage engine. The empty
/// identifier is reserved for the system (default) tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Normalize a raw identifier.
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    /// The system/default tenant.
    pub fn system() -> Self {
        Self(String::new())
    }

    pub fn is_system(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the identifier can name a backing store on disk.
    ///
    /// Only `[a-z0-9_-.]` is accepted and the identifier may not start with
    /// a dot. The system tenant is always valid.
    pub fn validate(&self) -> VesperResult<()> {
        if self.is_system() {
            return Ok(());
        }
        if self.0.len() > MAX_TENANT_ID_LEN {
            return Err(VesperError::invalid_argument(
                "tenant_id",
                format!("longer than {} bytes", MAX_TENANT_ID_LEN),
            ));
        }
        if self.0.starts_with('.') {
            return Err(VesperError::invalid_argument(
                "tenant_id",
                format!("'{}' may not start with '.'", self.0),
            ));
        }
        let valid = self
            .0
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(VesperError::invalid_argument(
                "tenant_id",
                format!("'{}' contains unsupported characters", self.0),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_system() {
            f.write_str("<system>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for TenantId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Opaque, unguessable transaction session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a fresh token from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Wrap a token received from a caller.
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only a prefix goes to logs.
        let shown = self.0.get(..8).unwrap_or(&self.0);
        write!(f, "{}…", shown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_normalizes() {
        assert_eq!(TenantId::new("  Acme "), TenantId::new("acme"));
        assert_eq!(TenantId::new("ACME").as_str(), "acme");
    }

    #[test]
    fn test_blank_tenant_is_system() {
        assert!(TenantId::new("").is_system());
        assert!(TenantId::new("   ").is_system());
        assert_eq!(TenantId::new(" "), TenantId::system());
        assert_eq!(TenantId::system().to_string(), "<system>");
    }

    #[test]
    fn test_validate_rejects_path_like_ids() {
        assert!(TenantId::new("../etc").validate().is_err());
        assert!(TenantId::new("a/b").validate().is_err());
        assert!(TenantId::new(".hidden").validate().is_err());
        assert!(TenantId::new("acme-eu_1.prod").validate().is_ok());
        assert!(TenantId::system().validate().is_ok());
        assert!(TenantId::new(&"t".repeat(MAX_TENANT_ID_LEN)).validate().is_ok());
        assert!(TenantId::new(&"t".repeat(MAX_TENANT_ID_LEN + 1)).validate().is_err());
    }

    #[test]
    fn test_session_tokens_are_unique_and_long() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), SESSION_TOKEN_BYTES * 2);
        assert!(!a.to_string().contains(&a.as_str()[8..]));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Normalization is idempotent.
        #[test]
        fn prop_normalize_idempotent(raw in "[ a-zA-Z0-9_-]{0,24}") {
            let once = TenantId::new(&raw);
            let twice = TenantId::new(once.as_str());
            prop_assert_eq!(once, twice);
        }

        /// Case and surrounding whitespace never change the canonical id.
        #[test]
        fn prop_case_and_padding_insensitive(raw in "[a-z0-9]{1,16}", pad in " {0,3}") {
            let padded = format!("{}{}{}", pad, raw.to_uppercase(), pad);
            prop_assert_eq!(TenantId::new(&padded), TenantId::new(&raw));
        }
    }
}
