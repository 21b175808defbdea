//! Correlation routing: from transport message to saga instance.

use common::CorrelationId;
use saga_store::{SagaInstance, SagaStore, SagaStoreExt};
use serde::de::DeserializeOwned;
use transport::{CORRELATION_ID_HEADER, Message};

use crate::error::{Result, SagaError};
use crate::events::EventEnvelope;
use crate::machine::{MachineEvent, MachineState, StateMachine};

/// Extracts the correlation id of a message.
///
/// Reads the correlation header, falling back to the `correlationId` field
/// of the body.
pub fn correlation_id(message: &Message) -> Result<CorrelationId> {
    let raw = match message.header(CORRELATION_ID_HEADER) {
        Some(header) => header,
        None => message
            .body
            .get("correlationId")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                SagaError::CorruptEnvelope(format!("message {} has no correlation id", message.id))
            })?,
    };

    raw.parse().map_err(|e| {
        SagaError::CorruptEnvelope(format!(
            "message {} has malformed correlation id '{raw}': {e}",
            message.id
        ))
    })
}

/// Decodes the event envelope carried by a message.
pub fn decode_envelope<K: DeserializeOwned>(message: &Message) -> Result<EventEnvelope<K>> {
    let envelope: EventEnvelope<K> = message
        .decode()
        .map_err(|e| SagaError::CorruptEnvelope(format!("message {}: {e}", message.id)))?;

    let routed = correlation_id(message)?;
    if routed != envelope.correlation_id {
        return Err(SagaError::CorruptEnvelope(format!(
            "message {} routed to {routed} but addressed to {}",
            message.id, envelope.correlation_id
        )));
    }

    Ok(envelope)
}

/// Resolves envelopes to the saga instance they address.
#[derive(Clone)]
pub struct CorrelationRouter<St> {
    store: St,
}

impl<St: SagaStore> CorrelationRouter<St> {
    pub fn new(store: St) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    /// Loads the addressed instance, creating it for the start event.
    ///
    /// Returns `None` when a non-start event names a saga that does not exist.
    #[tracing::instrument(
        skip(self, machine, envelope),
        fields(correlation_id = %envelope.correlation_id, event_kind = %envelope.event_kind)
    )]
    pub async fn resolve<S: MachineState, K: MachineEvent>(
        &self,
        machine: &StateMachine<S, K>,
        envelope: &EventEnvelope<K>,
    ) -> Result<Option<SagaInstance>> {
        let id = envelope.correlation_id;

        if envelope.event_kind == machine.start_event() {
            let initial = machine.initial_state().to_string();
            let instance = self.store.create_if_absent(id, &initial).await?;
            return Ok(Some(instance));
        }

        let instance = self.store.find(id).await?;
        if instance.is_none() {
            tracing::warn!("no saga for correlation id, event ignored");
        }
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::newsletter;
    use saga_store::InMemorySagaStore;
    use serde_json::json;

    #[test]
    fn correlation_from_header_or_body() {
        let id = CorrelationId::new();

        let with_header = EventEnvelope::new(id, EventKind::ReleaseIn).to_message().unwrap();
        assert_eq!(correlation_id(&with_header).unwrap(), id);

        let body_only = Message::builder()
            .body_raw(json!({"correlationId": id.to_string(), "eventKind": "ReleaseIn"}))
            .build();
        assert_eq!(correlation_id(&body_only).unwrap(), id);
    }

    #[test]
    fn missing_or_malformed_correlation_is_corrupt() {
        let missing = Message::builder().body_raw(json!({"eventKind": "ReleaseIn"})).build();
        assert!(matches!(
            correlation_id(&missing),
            Err(SagaError::CorruptEnvelope(_))
        ));

        let malformed = Message::builder()
            .header(CORRELATION_ID_HEADER, "not-a-uuid")
            .build();
        assert!(correlation_id(&malformed).unwrap_err().is_fatal());
    }

    #[test]
    fn header_and_body_must_agree() {
        let envelope = EventEnvelope::new(CorrelationId::new(), EventKind::ReleaseIn);
        let mut message = envelope.to_message().unwrap();
        message
            .headers
            .insert(CORRELATION_ID_HEADER.to_string(), CorrelationId::new().to_string());

        assert!(decode_envelope::<EventKind>(&message).is_err());
    }

    #[test]
    fn undecodable_body_is_corrupt() {
        let message = Message::builder()
            .header(CORRELATION_ID_HEADER, CorrelationId::new().to_string())
            .body_raw(json!({"eventKind": 17}))
            .build();

        assert!(matches!(
            decode_envelope::<EventKind>(&message),
            Err(SagaError::CorruptEnvelope(_))
        ));
    }

    #[tokio::test]
    async fn start_event_creates_instance_once() {
        let store = InMemorySagaStore::new();
        let router = CorrelationRouter::new(store.clone());
        let machine = newsletter::state_machine().unwrap();
        let envelope = EventEnvelope::new(CorrelationId::new(), EventKind::ReleaseIn);

        let first = router.resolve(&machine, &envelope).await.unwrap().unwrap();
        let second = router.resolve(&machine, &envelope).await.unwrap().unwrap();

        assert_eq!(first.current_state, "Initial");
        assert_eq!(first, second);
        assert_eq!(store.instance_count().await, 1);
    }

    #[tokio::test]
    async fn non_start_event_for_unknown_saga_resolves_to_none() {
        let store = InMemorySagaStore::new();
        let router = CorrelationRouter::new(store.clone());
        let machine = newsletter::state_machine().unwrap();
        let envelope = EventEnvelope::new(CorrelationId::new(), EventKind::ContentFetched);

        assert!(router.resolve(&machine, &envelope).await.unwrap().is_none());
        assert_eq!(store.instance_count().await, 0);
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_transient() {
        let store = InMemorySagaStore::new();
        store.set_unavailable(true).await;
        let router = CorrelationRouter::new(store);
        let machine = newsletter::state_machine().unwrap();
        let envelope = EventEnvelope::new(CorrelationId::new(), EventKind::ReleaseIn);

        let err = router.resolve(&machine, &envelope).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }
}
