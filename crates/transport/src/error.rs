use thiserror::Error;

/// Errors that can occur when talking to the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker could not be reached or refused the operation.
    /// Callers are expected to retry.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// The transport has been closed and accepts no more work.
    #[error("Transport closed")]
    Closed,

    /// A consumer is already attached to the source.
    #[error("Source already has a consumer: {0}")]
    AlreadySubscribed(String),

    /// The message body could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl TransportError {
    /// Returns true if retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
