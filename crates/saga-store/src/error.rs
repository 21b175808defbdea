use thiserror::Error;

use crate::{CorrelationId, Version};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// A concurrent writer already advanced the saga instance.
    /// The expected version did not match the stored version.
    #[error(
        "Version conflict for saga {correlation_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        correlation_id: CorrelationId,
        expected: Version,
        actual: Version,
    },

    /// No saga instance exists for the correlation id.
    #[error("Saga not found: {0}")]
    NotFound(CorrelationId),

    /// The instance violates the row constraints and was not written.
    #[error("Invalid saga instance: {0}")]
    Validation(String),

    /// The store is temporarily unreachable.
    #[error("Saga store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaStoreError {
    /// Returns true if the operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaStoreError::ConcurrencyConflict { .. } | SagaStoreError::Unavailable(_) => true,
            SagaStoreError::Database(sqlx::Error::Database(e)) => {
                e.code().is_some_and(|code| is_transient_sqlstate(&code))
            }
            SagaStoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Returns true for PostgreSQL error codes that clear up on retry:
/// serialization and deadlock aborts, lock timeouts, server shutdown or
/// restart, and lost connections.
pub fn is_transient_sqlstate(code: &str) -> bool {
    matches!(
        code,
        "40001" | "40P01" | "55P03" | "57P01" | "57P02" | "57P03" | "53300"
    ) || code.starts_with("08")
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, SagaStoreError>;
