//! Integration tests driving the newsletter saga through router, engine and store.

use common::{CorrelationId, Version};
use saga::{
    CorrelationRouter, EventEnvelope, EventKind, NewsletterMachine, NoOpReason, Outcome,
    decode_envelope, newsletter,
};
use saga_store::{InMemorySagaStore, OutboxMessage, SagaStore, SagaStoreError};
use serde_json::json;
use transport::Message;

struct TestHarness {
    machine: NewsletterMachine,
    router: CorrelationRouter<InMemorySagaStore>,
    store: InMemorySagaStore,
}

impl TestHarness {
    fn new() -> Self {
        let store = InMemorySagaStore::new();
        Self {
            machine: newsletter::state_machine().unwrap(),
            router: CorrelationRouter::new(store.clone()),
            store,
        }
    }

    /// Processes one message the way a lane worker does, minus retries.
    async fn handle(&self, message: &Message) -> Option<Outcome<saga::NewsletterState>> {
        let envelope = decode_envelope::<EventKind>(message).unwrap();
        let instance = self.router.resolve(&self.machine, &envelope).await.unwrap()?;
        let outcome = self.machine.apply(&instance, &envelope).unwrap();

        if let Outcome::Transitioned(t) = &outcome {
            let outbox = t
                .commands
                .iter()
                .map(|c| {
                    OutboxMessage::new(
                        c.correlation_id,
                        &c.destination,
                        &c.request.action,
                        serde_json::to_value(c).unwrap(),
                    )
                })
                .collect();
            self.store
                .save_with_outbox(&t.instance, instance.version, outbox)
                .await
                .unwrap();
        }
        Some(outcome)
    }

    async fn send(&self, envelope: EventEnvelope) -> Option<Outcome<saga::NewsletterState>> {
        self.handle(&envelope.to_message().unwrap()).await
    }
}

#[tokio::test]
async fn test_full_newsletter_release() {
    let h = TestHarness::new();
    let id = CorrelationId::new();

    h.send(EventEnvelope::new(id, EventKind::ReleaseIn).with_payload(json!({"newsletterId": 9})))
        .await
        .unwrap();
    for (version, kind) in [
        (1, EventKind::ContentFetched),
        (2, EventKind::TokenAcquired),
        (3, EventKind::Concluded),
    ] {
        let outcome = h
            .send(EventEnvelope::new(id, kind).with_version(Version::new(version)))
            .await
            .unwrap();
        assert!(outcome.is_transition(), "{kind} was not applied");
    }

    let saga = h.store.load(id).await.unwrap();
    assert_eq!(saga.current_state, "Concluded");
    assert_eq!(saga.previous_state, "SendingDelivery");
    assert_eq!(saga.version, Version::new(4));
    assert_eq!(saga.payload, Some(json!({"newsletterId": 9})));

    let actions: Vec<String> = h
        .store
        .outbox()
        .await
        .into_iter()
        .map(|m| m.message_type)
        .collect();
    assert_eq!(
        actions,
        vec![
            newsletter::GENERATE_CONTENT,
            newsletter::ACQUIRE_TOKEN,
            newsletter::SEND_DELIVERY
        ]
    );
}

#[tokio::test]
async fn test_duplicate_release_is_idempotent() {
    let h = TestHarness::new();
    let id = CorrelationId::new();
    let release = EventEnvelope::new(id, EventKind::ReleaseIn).to_message().unwrap();

    h.handle(&release).await.unwrap();
    let second = h.handle(&release).await.unwrap();

    assert_eq!(second, Outcome::NoOp(NoOpReason::Ignored));
    assert_eq!(h.store.load(id).await.unwrap().version, Version::new(1));
    assert_eq!(h.store.outbox().await.len(), 1);
}

#[tokio::test]
async fn test_result_for_unknown_saga_is_dropped() {
    let h = TestHarness::new();
    let outcome = h
        .send(EventEnvelope::new(CorrelationId::new(), EventKind::ContentFetched))
        .await;

    assert!(outcome.is_none());
    assert_eq!(h.store.instance_count().await, 0);
}

#[tokio::test]
async fn test_step_failure_faults_and_absorbs() {
    let h = TestHarness::new();
    let id = CorrelationId::new();

    h.send(EventEnvelope::new(id, EventKind::ReleaseIn)).await.unwrap();
    h.send(
        EventEnvelope::new(id, EventKind::StepFailed)
            .with_version(Version::new(1))
            .with_payload(json!({"reason": "generator down"})),
    )
    .await
    .unwrap();

    let late = h
        .send(EventEnvelope::new(id, EventKind::ContentFetched).with_version(Version::new(1)))
        .await
        .unwrap();
    assert!(!late.is_transition());

    let saga = h.store.load(id).await.unwrap();
    assert_eq!(saga.current_state, "Faulted");
    assert_eq!(saga.previous_state, "FetchingContent");
    assert_eq!(saga.payload, Some(json!({"reason": "generator down"})));
}

#[tokio::test]
async fn test_racing_writers_conflict() {
    let h = TestHarness::new();
    let id = CorrelationId::new();
    h.send(EventEnvelope::new(id, EventKind::ReleaseIn)).await.unwrap();

    // Two workers load the same snapshot and compute competing transitions
    let snapshot = h.store.load(id).await.unwrap();
    let fetched = EventEnvelope::new(id, EventKind::ContentFetched);
    let failed = EventEnvelope::new(id, EventKind::StepFailed);

    let a = match h.machine.apply(&snapshot, &fetched).unwrap() {
        Outcome::Transitioned(t) => t,
        other => panic!("unexpected {other:?}"),
    };
    let b = match h.machine.apply(&snapshot, &failed).unwrap() {
        Outcome::Transitioned(t) => t,
        other => panic!("unexpected {other:?}"),
    };

    h.store
        .save_with_outbox(&a.instance, snapshot.version, vec![])
        .await
        .unwrap();
    let err = h
        .store
        .save_with_outbox(&b.instance, snapshot.version, vec![])
        .await
        .unwrap_err();

    assert!(matches!(err, SagaStoreError::ConcurrencyConflict { .. }));
    assert_eq!(
        h.store.load(id).await.unwrap().current_state,
        "FetchingOAuthToken"
    );
}
