//! Saga event envelopes and outgoing commands.

use common::{CorrelationId, Version};
use serde::{Deserialize, Serialize};
use transport::{CORRELATION_ID_HEADER, Message, MessageId};

/// Message type of event envelopes on the saga queue.
pub const ENVELOPE_MESSAGE_TYPE: &str = "SagaEvent";

/// Message type of action requests sent to step workers.
pub const COMMAND_MESSAGE_TYPE: &str = "ActionRequest";

/// Header carrying the saga version a command was produced at.
pub const SAGA_VERSION_HEADER: &str = "saga-version";

/// Header carrying the state a command's transition left.
pub const PREVIOUS_STATE_HEADER: &str = "saga-previous-state";

/// Header carrying the state a command's transition entered.
pub const CURRENT_STATE_HEADER: &str = "saga-current-state";

/// Kinds of events the newsletter saga reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A newsletter was released; starts the saga.
    ReleaseIn,
    /// The content generator answered.
    ContentFetched,
    /// The token issuer answered.
    TokenAcquired,
    /// The delivery sender answered.
    Concluded,
    /// A step reported failure or could not be invoked.
    StepFailed,
    /// No answer arrived for a step in time.
    StepTimedOut,
}

impl EventKind {
    /// Returns the event kind name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ReleaseIn => "ReleaseIn",
            EventKind::ContentFetched => "ContentFetched",
            EventKind::TokenAcquired => "TokenAcquired",
            EventKind::Concluded => "Concluded",
            EventKind::StepFailed => "StepFailed",
            EventKind::StepTimedOut => "StepTimedOut",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event addressed to one saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<K = EventKind> {
    pub correlation_id: CorrelationId,
    pub event_kind: K,
    /// The saga version the sender believed current.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl<K> EventEnvelope<K> {
    /// Creates an envelope without version or payload.
    pub fn new(correlation_id: CorrelationId, event_kind: K) -> Self {
        Self {
            correlation_id,
            event_kind,
            version: None,
            payload: None,
        }
    }

    /// Pins the envelope to a saga version.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Attaches a payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl<K: Serialize> EventEnvelope<K> {
    /// Wraps the envelope into a transport message.
    pub fn to_message(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::builder()
            .message_type(ENVELOPE_MESSAGE_TYPE)
            .header(CORRELATION_ID_HEADER, self.correlation_id.to_string())
            .body(self)?
            .build())
    }
}

/// Request handed to an external step worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action: String,
    pub data: Option<serde_json::Value>,
    pub correlation_id: CorrelationId,
}

/// A command produced by a transition, staged in the outbox before publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingCommand {
    pub destination: String,
    pub correlation_id: CorrelationId,
    pub previous_state: String,
    pub current_state: String,
    /// Saga version after the transition that produced this command.
    pub version: Version,
    pub request: ActionRequest,
}

impl OutgoingCommand {
    /// Builds the transport message for this command.
    ///
    /// The body is the bare action request; saga bookkeeping travels in
    /// headers so workers only see `{action, data, correlationId}`.
    pub fn to_message(&self, id: MessageId) -> Result<Message, serde_json::Error> {
        Ok(Message::builder()
            .id(id)
            .message_type(COMMAND_MESSAGE_TYPE)
            .header(CORRELATION_ID_HEADER, self.correlation_id.to_string())
            .header(SAGA_VERSION_HEADER, self.version.to_string())
            .header(PREVIOUS_STATE_HEADER, self.previous_state.clone())
            .header(CURRENT_STATE_HEADER, self.current_state.clone())
            .body(&self.request)?
            .build())
    }
}

/// Shallow-merges an event payload into a saga payload.
///
/// Object keys from `incoming` overwrite keys in `current`; any other
/// incoming value replaces the saga payload outright.
pub fn merge_payload(
    current: Option<&serde_json::Value>,
    incoming: Option<&serde_json::Value>,
) -> Option<serde_json::Value> {
    match (current, incoming) {
        (current, None) => current.cloned(),
        (Some(serde_json::Value::Object(base)), Some(serde_json::Value::Object(update))) => {
            let mut merged = base.clone();
            for (key, value) in update {
                merged.insert(key.clone(), value.clone());
            }
            Some(serde_json::Value::Object(merged))
        }
        (_, Some(incoming)) => Some(incoming.clone()),
    }
}
