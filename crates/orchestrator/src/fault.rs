//! Fault path for envelopes that could not be processed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use transport::{CORRELATION_ID_HEADER, Message, Transport, TransportError};

use crate::error::OrchestratorError;

/// Message type of fault records.
pub const FAULT_MESSAGE_TYPE: &str = "Fault";

/// Returns the fault destination paired with a saga queue.
pub fn error_queue(saga_queue: &str) -> String {
    format!("{saga_queue}_error")
}

/// What lands on the fault destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultRecord {
    pub message: Message,
    pub attempts: u32,
    pub error_class: String,
    pub error: String,
    pub faulted_at: DateTime<Utc>,
}

/// Publishes faulted envelopes to the error queue.
#[derive(Clone)]
pub struct FaultPublisher {
    transport: Arc<dyn Transport>,
    destination: String,
}

impl FaultPublisher {
    pub fn new(transport: Arc<dyn Transport>, saga_queue: &str) -> Self {
        Self {
            transport,
            destination: error_queue(saga_queue),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Publishes the fault record for `original`.
    pub async fn publish(
        &self,
        original: &Message,
        attempts: u32,
        error: &OrchestratorError,
    ) -> Result<(), TransportError> {
        let record = FaultRecord {
            message: original.clone(),
            attempts,
            error_class: error.error_class().to_string(),
            error: error.to_string(),
            faulted_at: Utc::now(),
        };

        let mut builder = Message::builder().message_type(FAULT_MESSAGE_TYPE);
        if let Some(correlation_id) = original.header(CORRELATION_ID_HEADER) {
            builder = builder.header(CORRELATION_ID_HEADER, correlation_id);
        }
        let fault = builder.body(&record)?.build();

        self.transport.publish(&self.destination, fault).await?;
        metrics::counter!("saga_faults_total", "error_class" => error.error_class()).increment(1);
        tracing::warn!(
            message_id = %original.id,
            attempts,
            error_class = error.error_class(),
            destination = %self.destination,
            "envelope faulted"
        );
        Ok(())
    }
}
