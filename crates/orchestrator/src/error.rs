//! Orchestrator and API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;
use saga_store::SagaStoreError;
use thiserror::Error;
use transport::TransportError;

use crate::config::ConfigError;

/// Errors raised while processing envelopes or running the service.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error(transparent)]
    Store(#[from] SagaStoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A lane worker stopped while messages were still being dispatched to it.
    #[error("Dispatch lane {0} is closed")]
    LaneClosed(usize),
}

impl OrchestratorError {
    /// Returns true if retrying the same envelope may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::Saga(e) => e.is_transient(),
            OrchestratorError::Store(e) => e.is_transient(),
            OrchestratorError::Transport(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the process must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            OrchestratorError::Saga(e) => e.is_fatal(),
            OrchestratorError::Config(_) | OrchestratorError::LaneClosed(_) => true,
            _ => false,
        }
    }

    /// Stable classification recorded on faulted messages.
    pub fn error_class(&self) -> &'static str {
        let store = match self {
            OrchestratorError::Store(e) | OrchestratorError::Saga(SagaError::Store(e)) => Some(e),
            _ => None,
        };
        if let Some(e) = store {
            return match e {
                SagaStoreError::ConcurrencyConflict { .. } => "VersionConflict",
                SagaStoreError::NotFound(_) => "NotFound",
                SagaStoreError::Validation(_) => "Validation",
                SagaStoreError::Unavailable(_) => "StoreUnavailable",
                SagaStoreError::Database(_) | SagaStoreError::Migration(_) => "Database",
                SagaStoreError::Serialization(_) => "Serialization",
            };
        }

        match self {
            OrchestratorError::Saga(SagaError::CorruptState { .. }) => "CorruptState",
            OrchestratorError::Saga(SagaError::CorruptEnvelope(_)) => "CorruptEnvelope",
            OrchestratorError::Saga(SagaError::InvalidDefinition(_)) => "InvalidDefinition",
            OrchestratorError::Saga(SagaError::Serialization(_))
            | OrchestratorError::Serialization(_) => "Serialization",
            OrchestratorError::Transport(TransportError::Unavailable(_)) => "TransportUnavailable",
            OrchestratorError::Transport(_) => "Transport",
            OrchestratorError::Config(_) => "Config",
            OrchestratorError::LaneClosed(_) => "LaneClosed",
            OrchestratorError::Saga(SagaError::Store(_)) | OrchestratorError::Store(_) => "Store",
        }
    }
}

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Saga store error.
    Store(SagaStoreError),
    /// Transport error.
    Transport(TransportError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Store(err) => store_error_to_response(err),
            ApiError::Transport(err) => transport_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn store_error_to_response(err: SagaStoreError) -> (StatusCode, String) {
    match &err {
        SagaStoreError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        SagaStoreError::ConcurrencyConflict { .. } => (StatusCode::CONFLICT, err.to_string()),
        e if e.is_transient() => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        _ => {
            tracing::error!(error = %err, "saga store error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn transport_error_to_response(err: TransportError) -> (StatusCode, String) {
    match &err {
        TransportError::Unavailable(_) | TransportError::Closed => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

impl From<SagaStoreError> for ApiError {
    fn from(err: SagaStoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        ApiError::Transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CorrelationId, Version};

    fn conflict() -> SagaStoreError {
        SagaStoreError::ConcurrencyConflict {
            correlation_id: CorrelationId::new(),
            expected: Version::new(1),
            actual: Version::new(2),
        }
    }

    #[test]
    fn transient_errors_are_classified() {
        assert!(OrchestratorError::from(conflict()).is_transient());
        assert!(OrchestratorError::from(SagaError::Store(conflict())).is_transient());
        assert!(
            OrchestratorError::from(TransportError::Unavailable("down".into())).is_transient()
        );
        assert!(!OrchestratorError::from(TransportError::Closed).is_transient());
    }

    #[test]
    fn corrupt_input_is_fatal() {
        let err = OrchestratorError::from(SagaError::CorruptEnvelope("bad".into()));
        assert!(err.is_fatal());
        assert!(!err.is_transient());
        assert_eq!(err.error_class(), "CorruptEnvelope");
    }

    #[test]
    fn error_class_looks_through_saga_wrapping() {
        let wrapped = OrchestratorError::from(SagaError::Store(conflict()));
        assert_eq!(wrapped.error_class(), "VersionConflict");

        let unavailable =
            OrchestratorError::from(SagaStoreError::Unavailable("maintenance".into()));
        assert_eq!(unavailable.error_class(), "StoreUnavailable");
    }
}
