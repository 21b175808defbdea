//! Saga error types.

use common::CorrelationId;
use saga_store::SagaStoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] SagaStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted instance names a state the machine does not know.
    #[error("Saga {correlation_id} is in unknown state '{state}'")]
    CorruptState {
        correlation_id: CorrelationId,
        state: String,
    },

    /// An incoming message cannot be read as an event envelope.
    #[error("Corrupt envelope: {0}")]
    CorruptEnvelope(String),

    /// The transition table is inconsistent.
    #[error("Invalid state machine definition: {0}")]
    InvalidDefinition(String),
}

impl SagaError {
    /// Returns true if retrying the same envelope may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the process cannot safely continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SagaError::CorruptState { .. }
                | SagaError::CorruptEnvelope(_)
                | SagaError::InvalidDefinition(_)
        )
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
