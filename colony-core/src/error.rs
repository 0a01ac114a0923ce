//! Error types
//!
//! Every fallible operation in Colony returns [`Error`]. Variants line up with
//! how callers are expected to react: validation errors are surfaced as-is,
//! conflicts are re-read and retried by the caller, quota errors send the
//! caller to another resource.

use uuid::Uuid;

/// The result type used throughout Colony.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A job definition, resource or lease request is malformed, or a
    /// requested state change is not a legal edge.
    #[error("validation error: {0}")]
    Validation(String),

    /// A conditional write matched no record.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The allocation would push a resource past its quota.
    #[error("quota exceeded on resource {resource_id}: requested {requested}, used {used}, quota {quota}")]
    QuotaExceeded {
        resource_id: Uuid,
        requested: i32,
        used: i64,
        quota: i32,
    },

    /// Dynamic task substitution failed.
    #[error("task resolution failed: {0}")]
    Resolution(String),

    /// The backing store failed.
    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A JSON column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Creates a storage error without an underlying cause.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a storage error wrapping its cause.
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true if a conditional write found nothing to update
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true if this is a quota rejection
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    /// Returns true if this is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        assert!(Error::Conflict("gone".into()).is_conflict());
        assert!(!Error::Validation("bad".into()).is_conflict());
        assert!(
            Error::QuotaExceeded {
                resource_id: Uuid::new_v4(),
                requested: 1,
                used: 10,
                quota: 10,
            }
            .is_quota_exceeded()
        );
    }

    #[test]
    fn test_storage_keeps_source() {
        let io = std::io::Error::other("disk gone");
        let err = Error::storage_with_source("write failed", io);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "storage error: write failed");
    }
}
