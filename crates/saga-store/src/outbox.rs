use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CorrelationId;

/// A command staged for publication.
///
/// Outbox rows are written in the same transaction as the saga transition
/// that produced them and stay pending until a publish has been confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub correlation_id: CorrelationId,
    pub destination: String,
    pub message_type: String,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Creates a pending outbox message.
    pub fn new(
        correlation_id: CorrelationId,
        destination: impl Into<String>,
        message_type: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            destination: destination.into(),
            message_type: message_type.into(),
            body,
            created_at: Utc::now(),
            dispatched_at: None,
        }
    }

    /// Returns true if the message still has to be published.
    pub fn is_pending(&self) -> bool {
        self.dispatched_at.is_none()
    }
}
