use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// Header carrying the correlation id of the saga a message belongs to.
pub const CORRELATION_ID_HEADER: &str = "correlation-id";

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a message ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message in flight.
///
/// The body is kept as JSON so the transport stays agnostic of the typed
/// envelopes travelling through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,

    /// Name of the typed envelope carried in the body.
    pub message_type: String,

    /// Free-form string headers.
    pub headers: HashMap<String, String>,

    /// The envelope as JSON.
    pub body: serde_json::Value,

    /// When the message was first published.
    pub sent_at: DateTime<Utc>,

    /// How many times this message has been handed out before.
    #[serde(default)]
    pub redelivery_count: u32,
}

impl Message {
    /// Creates a new message builder.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Deserializes the body into a typed envelope.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone())
    }

    /// Returns the value of a header, if present.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Builder for constructing messages.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    message_type: Option<String>,
    headers: HashMap<String, String>,
    body: Option<serde_json::Value>,
}

impl MessageBuilder {
    /// Sets the message ID. If not set, a new ID will be generated.
    pub fn id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the message type.
    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Adds a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the body from a serializable value.
    pub fn body<T: Serialize>(mut self, body: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Sets the body from a raw JSON value.
    pub fn body_raw(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Builds the message.
    pub fn build(self) -> Message {
        Message {
            id: self.id.unwrap_or_default(),
            message_type: self.message_type.unwrap_or_default(),
            headers: self.headers,
            body: self.body.unwrap_or(serde_json::Value::Null),
            sent_at: Utc::now(),
            redelivery_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[test]
    fn builder_generates_id_and_defaults() {
        let message = Message::builder().message_type("Ping").build();
        assert_eq!(message.message_type, "Ping");
        assert_eq!(message.body, serde_json::Value::Null);
        assert_eq!(message.redelivery_count, 0);
        assert!(message.headers.is_empty());
    }

    #[test]
    fn typed_body_decodes_back() {
        let message = Message::builder()
            .message_type("Ping")
            .header(CORRELATION_ID_HEADER, "abc")
            .body(&Ping { seq: 7 })
            .unwrap()
            .build();

        assert_eq!(message.header(CORRELATION_ID_HEADER), Some("abc"));
        assert_eq!(message.decode::<Ping>().unwrap(), Ping { seq: 7 });
    }

    #[test]
    fn decode_reports_shape_mismatch() {
        let message = Message::builder()
            .body_raw(serde_json::json!({"unexpected": true}))
            .build();
        assert!(message.decode::<Ping>().is_err());
    }
}
