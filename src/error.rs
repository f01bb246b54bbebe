//! Error types for inquest-core.

use thiserror::Error;

/// Result type alias using inquest-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during investigation runs.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed caller input (bad transaction id, bad cursor, out-of-range value)
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller is not allowed to perform the operation
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A conflicting entity or state transition (duplicate active run, stale
    /// state version, illegal recommendation transition)
    #[error("conflict: {0}")]
    Conflict(String),

    /// An upstream dependency failed
    #[error("dependency failure: {service} - {message}")]
    Dependency { service: String, message: String },

    /// Timeout during an external call or tool execution
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// LLM provider error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Embedding provider error
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Persistence error
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a dependency failure error.
    pub fn dependency(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dependency {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a stale-version conflict error.
    pub fn stale_version(investigation_id: impl std::fmt::Display, expected: i64) -> Self {
        Self::Conflict(format!(
            "state version {} for investigation {} is stale",
            expected, investigation_id
        ))
    }

    /// Whether a single retry is worth attempting for this error.
    ///
    /// Transient classes: timeouts, dependency failures, and storage errors
    /// (serialization failures, connection loss). Validation and invariant
    /// errors never retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Dependency { .. } | Self::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::timeout(500).is_transient());
        assert!(Error::dependency("txn-source", "connection reset").is_transient());
        assert!(Error::Storage("database is locked".into()).is_transient());
        assert!(!Error::Validation("bad id".into()).is_transient());
        assert!(!Error::Conflict("duplicate".into()).is_transient());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = Error::dependency("embedding", "503");
        assert_eq!(err.to_string(), "dependency failure: embedding - 503");

        let err = Error::timeout(20_000);
        assert_eq!(err.to_string(), "operation timed out after 20000ms");
    }
}
