use common::{CorrelationId, Version};
use criterion::{Criterion, criterion_group, criterion_main};
use saga::{CorrelationRouter, EventEnvelope, EventKind, Outcome, newsletter};
use saga_store::{InMemorySagaStore, SagaInstance, SagaStore};
use serde_json::json;

fn bench_apply_transition(c: &mut Criterion) {
    let machine = newsletter::state_machine().unwrap();
    let instance = SagaInstance::new(CorrelationId::new(), "Initial");
    let envelope = EventEnvelope::new(instance.correlation_id, EventKind::ReleaseIn)
        .with_payload(json!({"newsletterId": 1, "segment": "weekly"}));

    c.bench_function("saga/apply_transition", |b| {
        b.iter(|| machine.apply(&instance, &envelope).unwrap());
    });
}

fn bench_apply_noop(c: &mut Criterion) {
    let machine = newsletter::state_machine().unwrap();
    let mut instance = SagaInstance::new(CorrelationId::new(), "Concluded");
    instance.version = Version::new(4);
    let envelope = EventEnvelope::new(instance.correlation_id, EventKind::ReleaseIn);

    c.bench_function("saga/apply_noop", |b| {
        b.iter(|| machine.apply(&instance, &envelope).unwrap());
    });
}

fn bench_full_saga_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let machine = newsletter::state_machine().unwrap();

    c.bench_function("saga/full_release_cycle", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemorySagaStore::new();
                let router = CorrelationRouter::new(store.clone());
                let id = CorrelationId::new();

                for kind in [
                    EventKind::ReleaseIn,
                    EventKind::ContentFetched,
                    EventKind::TokenAcquired,
                    EventKind::Concluded,
                ] {
                    let envelope = EventEnvelope::new(id, kind);
                    let instance = router.resolve(&machine, &envelope).await.unwrap().unwrap();
                    if let Outcome::Transitioned(t) = machine.apply(&instance, &envelope).unwrap() {
                        store
                            .save_with_outbox(&t.instance, instance.version, vec![])
                            .await
                            .unwrap();
                    }
                }
            });
        });
    });
}

criterion_group!(
    benches,
    bench_apply_transition,
    bench_apply_noop,
    bench_full_saga_cycle
);
criterion_main!(benches);
