//! Error types for cache operations
//!
//! Nothing in this crate is fatal to the host process: tier failures degrade to
//! a miss (reads) or a rejected store (writes). Only validation errors and
//! caller-supplied deadlines surface to the caller.

use crate::cache::types::TierKind;
use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Rejected input (empty/oversized query, confidence out of range)
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O, network or connection failure on a tier backend
    #[error("Tier {tier} unavailable: {message}")]
    TierUnavailable { tier: TierKind, message: String },

    /// A single tier call exceeded its per-tier timeout
    #[error("Tier {tier} timed out after {millis}ms")]
    Timeout { tier: TierKind, millis: u64 },

    /// Caller-supplied deadline passed mid-operation
    #[error("Deadline exceeded during {operation}")]
    DeadlineExceeded { operation: String },

    /// A stored entry could not be decoded
    #[error("Corrupt entry {key} in {tier} tier: {message}")]
    CorruptEntry {
        tier: TierKind,
        key: String,
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Neo4rs driver error (wrapper)
    #[error("Neo4rs driver error: {0}")]
    DriverError(#[from] neo4rs::Error),

    /// Redis client error (wrapper)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Whether the orchestrator may absorb this error as a miss or a failed
    /// best-effort write instead of surfacing it.
    pub fn is_degradable(&self) -> bool {
        !matches!(
            self,
            CacheError::Validation(_)
                | CacheError::DeadlineExceeded { .. }
                | CacheError::ConfigError(_)
        )
    }

    pub(crate) fn unavailable(tier: TierKind, message: impl Into<String>) -> Self {
        CacheError::TierUnavailable {
            tier,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::Validation("query is empty".to_string());
        assert_eq!(error.to_string(), "Validation error: query is empty");

        let timeout_error = CacheError::Timeout {
            tier: TierKind::Shared,
            millis: 50,
        };
        assert!(timeout_error.to_string().contains("timed out after 50ms"));

        let corrupt = CacheError::CorruptEntry {
            tier: TierKind::Persistent,
            key: "abc".to_string(),
            message: "bad json".to_string(),
        };
        assert!(corrupt.to_string().contains("persistent"));
    }

    #[test]
    fn test_degradable_classification() {
        assert!(CacheError::unavailable(TierKind::Shared, "refused").is_degradable());
        assert!(CacheError::Timeout {
            tier: TierKind::Persistent,
            millis: 200
        }
        .is_degradable());
        assert!(!CacheError::Validation("x".into()).is_degradable());
        assert!(!CacheError::DeadlineExceeded {
            operation: "lookup".into()
        }
        .is_degradable());
    }

    #[test]
    fn test_error_conversion() {
        let error: CacheError = "test error".into();
        assert!(matches!(error, CacheError::Other(_)));

        let error: CacheError = "test error".to_string().into();
        assert!(matches!(error, CacheError::Other(_)));
    }
}
