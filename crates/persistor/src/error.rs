//! Error types for the persistence engine.
//!
//! Errors are grouped by category and aggregated by [`StorageError`]:
//! validation failures, query-translation failures, concurrency failures
//! (optimistic conflicts and backend deadlocks), transaction misuse, and
//! errors passed through verbatim from a backend.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use thiserror::Error;

/// The primary error type for all engine operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Malformed input (filters, fetch specs, schema documents, property writes).
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Query translation errors
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Optimistic-lock and deadlock errors
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Transaction lifecycle errors
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Backend errors, passed through verbatim
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl StorageError {
    /// Returns true when this error is an optimistic-lock failure.
    ///
    /// Exhausted deadlock retries surface as a conflict too.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::Concurrency(
                ConcurrencyError::UpdateConflict { .. } | ConcurrencyError::RetriesExhausted { .. }
            )
        )
    }

    /// Returns true when the backend reported a deadlock.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, StorageError::Backend(BackendError::Deadlock { .. }))
    }
}

/// Errors raised before any I/O for malformed input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("The operator \"undefined\" is not permitted")]
    MissingIdentity { template: String },

    #[error("unknown template: {template}")]
    UnknownTemplate { template: String },

    #[error("unknown property {template}.{property}")]
    UnknownProperty { template: String, property: String },

    #[error("unknown relationship {template}.{relationship}")]
    UnknownRelationship {
        template: String,
        relationship: String,
    },

    #[error("property {template}.{property} expects {expected}, got {actual}")]
    WrongKind {
        template: String,
        property: String,
        expected: String,
        actual: String,
    },

    #[error("invalid filter: {message}")]
    InvalidFilter { message: String },

    #[error("invalid fetch specification: {message}")]
    InvalidFetchSpec { message: String },

    #[error("invalid sort specification: {message}")]
    InvalidSort { message: String },

    #[error("invalid schema: {message}")]
    InvalidSchema { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("instance {instance} does not belong to this graph")]
    UnknownInstance { instance: usize },

    #[error("instance {template}/{id} has been deleted")]
    Deleted { template: String, id: String },
}

/// Errors raised while translating a filter expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// `operator` is the compact JSON of the whole operator object.
    #[error("Can't handle {field}:{operator}")]
    UnsupportedOperator { field: String, operator: String },

    #[error("invalid regular expression for {field}: {message}")]
    InvalidRegex { field: String, message: String },
}

/// Optimistic-locking and deadlock errors.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    #[error("Update Conflict")]
    UpdateConflict {
        template: String,
        id: String,
        expected_version: i64,
        actual_version: Option<i64>,
    },

    /// The deadlock that exhausted the retry budget is kept as the source.
    #[error("Update Conflict")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        inner: BackendError,
    },
}

/// Errors related to the transaction lifecycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransactionError {
    #[error("transaction no longer valid")]
    InvalidTransaction,

    #[error("transaction rolled back: {reason}")]
    RolledBack { reason: String },

    #[error("{stage} hook failed: {message}")]
    HookFailed { stage: String, message: String },
}

/// Errors reported by a backend adapter.
///
/// Cloneable so a transaction can keep the last deadlock as its inner error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    #[error("connection pool exhausted for {backend_name}")]
    PoolExhausted { backend_name: String },

    /// Query failures carry the backend's own message.
    #[error("{message}")]
    Query {
        backend_name: String,
        message: String,
    },

    #[error("deadlock detected while accessing {target}/{id}")]
    Deadlock { target: String, id: String },

    #[error("lock timeout after {timeout_ms}ms for {target}/{id}")]
    LockTimeout {
        target: String,
        id: String,
        timeout_ms: u64,
    },

    #[error("{backend_name} cannot evaluate a {dialect} predicate")]
    UnsupportedPredicate {
        backend_name: String,
        dialect: String,
    },

    #[error("no active transaction on {backend_name} connection")]
    NoTransaction { backend_name: String },

    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl BackendError {
    /// Returns true for a backend-detected deadlock.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, BackendError::Deadlock { .. })
    }
}

/// Result type alias for engine operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for backend adapter calls.
pub type BackendResult<T> = Result<T, BackendError>;

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(BackendError::Serialization {
            message: err.to_string(),
        })
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for BackendError {
    fn from(err: rusqlite::Error) -> Self {
        BackendError::Query {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<r2d2::Error> for BackendError {
    fn from(_err: r2d2::Error) -> Self {
        BackendError::PoolExhausted {
            backend_name: "sqlite".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_update_conflict_display() {
        let err = StorageError::from(ConcurrencyError::UpdateConflict {
            template: "Address".to_string(),
            id: "a-1".to_string(),
            expected_version: 1,
            actual_version: Some(3),
        });
        assert_eq!(err.to_string(), "Update Conflict");
        assert!(err.is_conflict());
    }

    #[test]
    fn test_unsupported_operator_display() {
        let err = QueryError::UnsupportedOperator {
            field: "amount".to_string(),
            operator: r#"{"$exists":false}"#.to_string(),
        };
        assert_eq!(err.to_string(), r#"Can't handle amount:{"$exists":false}"#);
    }

    #[test]
    fn test_missing_identity_display() {
        let err = ValidationError::MissingIdentity {
            template: "Customer".to_string(),
        };
        assert_eq!(err.to_string(), "The operator \"undefined\" is not permitted");
    }

    #[test]
    fn test_backend_query_error_is_verbatim() {
        let err = BackendError::Query {
            backend_name: "sqlite".to_string(),
            message: "no such column: fieldNotAvailable".to_string(),
        };
        assert_eq!(err.to_string(), "no such column: fieldNotAvailable");
    }

    #[test]
    fn test_retries_exhausted_keeps_deadlock_source() {
        let err = ConcurrencyError::RetriesExhausted {
            attempts: 3,
            inner: BackendError::Deadlock {
                target: "customer".to_string(),
                id: "c-1".to_string(),
            },
        };
        assert_eq!(err.to_string(), "Update Conflict");
        let source = err.source().map(|s| s.to_string()).unwrap_or_default();
        assert!(source.contains("deadlock"));
        assert!(StorageError::from(err).is_conflict());
    }

    #[test]
    fn test_deadlock_classification() {
        let err = StorageError::from(BackendError::Deadlock {
            target: "customer".to_string(),
            id: "c-1".to_string(),
        });
        assert!(err.is_deadlock());
        assert!(!err.is_conflict());
    }
}
