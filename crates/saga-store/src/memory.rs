use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    ActiveSaga, CorrelationId, OutboxMessage, Result, SagaInstance, SagaStoreError, Version,
    store::{SagaStore, validate_for_save, validate_state_name},
};

#[derive(Default)]
struct State {
    instances: HashMap<CorrelationId, SagaInstance>,
    updated_at: HashMap<CorrelationId, DateTime<Utc>>,
    /// Pending rows only; dispatched rows are dropped.
    outbox: Vec<OutboxMessage>,
    unavailable: bool,
    failures_remaining: u32,
}

impl State {
    fn check_available(&mut self) -> Result<()> {
        if self.unavailable {
            return Err(SagaStoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            return Err(SagaStoreError::Unavailable(
                "injected transient failure".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-memory saga store implementation for testing and single-node runs.
///
/// Instances and outbox rows share one lock, so a save and its staged
/// commands become visible together.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    state: Arc<RwLock<State>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with `Unavailable` until reset.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Makes the next `count` operations fail with `Unavailable`.
    pub async fn fail_next(&self, count: u32) {
        self.state.write().await.failures_remaining = count;
    }

    /// Returns the number of stored saga instances.
    pub async fn instance_count(&self) -> usize {
        self.state.read().await.instances.len()
    }

    /// Returns the number of outbox messages not yet dispatched.
    pub async fn pending_count(&self) -> usize {
        self.state.read().await.outbox.len()
    }

    /// Returns the outbox messages not yet dispatched, in staging order.
    pub async fn outbox(&self) -> Vec<OutboxMessage> {
        self.state.read().await.outbox.clone()
    }

    /// Overrides the last-write time of an instance.
    pub async fn set_updated_at(&self, correlation_id: CorrelationId, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        if state.instances.contains_key(&correlation_id) {
            state.updated_at.insert(correlation_id, at);
        }
    }

    /// Clears all instances and outbox messages.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.instances.clear();
        state.updated_at.clear();
        state.outbox.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn load(&self, correlation_id: CorrelationId) -> Result<SagaInstance> {
        let mut state = self.state.write().await;
        state.check_available()?;

        state
            .instances
            .get(&correlation_id)
            .cloned()
            .ok_or(SagaStoreError::NotFound(correlation_id))
    }

    async fn create_if_absent(
        &self,
        correlation_id: CorrelationId,
        initial_state: &str,
    ) -> Result<SagaInstance> {
        validate_state_name(initial_state)?;

        let mut state = self.state.write().await;
        state.check_available()?;

        if let Some(existing) = state.instances.get(&correlation_id) {
            return Ok(existing.clone());
        }

        let instance = SagaInstance::new(correlation_id, initial_state);
        state.instances.insert(correlation_id, instance.clone());
        state.updated_at.insert(correlation_id, Utc::now());
        Ok(instance)
    }

    async fn save_with_outbox(
        &self,
        instance: &SagaInstance,
        expected: Version,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version> {
        validate_for_save(instance, expected)?;

        let mut state = self.state.write().await;
        state.check_available()?;

        let correlation_id = instance.correlation_id;
        let stored = state
            .instances
            .get(&correlation_id)
            .ok_or(SagaStoreError::NotFound(correlation_id))?;

        if stored.version != expected {
            return Err(SagaStoreError::ConcurrencyConflict {
                correlation_id,
                expected,
                actual: stored.version,
            });
        }

        state.instances.insert(correlation_id, instance.clone());
        state.updated_at.insert(correlation_id, Utc::now());
        state.outbox.extend(outbox);
        Ok(instance.version)
    }

    async fn pending_outbox(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>> {
        let mut state = self.state.write().await;
        state.check_available()?;

        let mut pending: Vec<OutboxMessage> = state
            .outbox
            .iter()
            .filter(|m| m.created_at <= created_before)
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        state.check_available()?;

        state.outbox.retain(|m| m.id != id);
        Ok(())
    }

    async fn list_active(&self, states: &[String]) -> Result<Vec<ActiveSaga>> {
        let mut state = self.state.write().await;
        state.check_available()?;

        let mut active: Vec<ActiveSaga> = state
            .instances
            .values()
            .filter(|instance| states.contains(&instance.current_state))
            .map(|instance| ActiveSaga {
                instance: instance.clone(),
                updated_at: state
                    .updated_at
                    .get(&instance.correlation_id)
                    .copied()
                    .unwrap_or_else(Utc::now),
            })
            .collect();
        active.sort_by_key(|saga| saga.updated_at);
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SagaStoreExt;
    use serde_json::json;

    fn advance(instance: &SagaInstance, to: &str) -> SagaInstance {
        let mut next = instance.clone();
        next.previous_state = instance.current_state.clone();
        next.current_state = to.to_string();
        next.version = instance.version.next();
        next
    }

    #[tokio::test]
    async fn create_if_absent_is_idempotent() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();

        let first = store.create_if_absent(id, "Initial").await.unwrap();
        let saved = store
            .save(&advance(&first, "FetchingContent"), first.version)
            .await
            .unwrap();
        assert_eq!(saved, Version::new(1));

        let again = store.create_if_absent(id, "Initial").await.unwrap();
        assert_eq!(again.current_state, "FetchingContent");
        assert_eq!(again.version, Version::new(1));
        assert_eq!(store.instance_count().await, 1);
    }

    #[tokio::test]
    async fn load_missing_instance_is_not_found() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();

        assert!(matches!(
            store.load(id).await,
            Err(SagaStoreError::NotFound(missing)) if missing == id
        ));
        assert!(store.find(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_save_conflicts_and_stages_nothing() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        let initial = store.create_if_absent(id, "Initial").await.unwrap();

        store
            .save(&advance(&initial, "FetchingContent"), initial.version)
            .await
            .unwrap();

        // A second writer computed its transition from the same snapshot
        let outbox = vec![OutboxMessage::new(id, "dest", "Cmd", json!({}))];
        let result = store
            .save_with_outbox(&advance(&initial, "Concluded"), initial.version, outbox)
            .await;

        match result {
            Err(SagaStoreError::ConcurrencyConflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, Version::initial());
                assert_eq!(actual, Version::new(1));
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        assert_eq!(store.pending_count().await, 0);
        assert_eq!(store.load(id).await.unwrap().current_state, "FetchingContent");
    }

    #[tokio::test]
    async fn save_of_unknown_instance_is_not_found() {
        let store = InMemorySagaStore::new();
        let instance = SagaInstance::new(CorrelationId::new(), "Initial");

        let result = store
            .save(&advance(&instance, "FetchingContent"), Version::initial())
            .await;
        assert!(matches!(result, Err(SagaStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn outbox_pending_until_marked() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        let initial = store.create_if_absent(id, "Initial").await.unwrap();

        let message = OutboxMessage::new(id, "content-generator", "ActionRequest", json!({}));
        let message_id = message.id;
        store
            .save_with_outbox(
                &advance(&initial, "FetchingContent"),
                initial.version,
                vec![message],
            )
            .await
            .unwrap();

        let pending = store.pending_outbox(Utc::now(), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, message_id);

        store.mark_dispatched(message_id).await.unwrap();
        assert!(store.pending_outbox(Utc::now(), 10).await.unwrap().is_empty());
        assert!(store.outbox().await.is_empty());

        // Marking twice is harmless
        store.mark_dispatched(message_id).await.unwrap();
        store.mark_dispatched(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn pending_outbox_respects_cutoff_and_limit() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        let mut instance = store.create_if_absent(id, "Initial").await.unwrap();

        for step in ["A", "B", "C"] {
            let next = advance(&instance, step);
            let message = OutboxMessage::new(id, "dest", step, json!({}));
            store
                .save_with_outbox(&next, instance.version, vec![message])
                .await
                .unwrap();
            instance = next;
        }

        let before_all = Utc::now() - chrono::Duration::hours(1);
        assert!(store.pending_outbox(before_all, 10).await.unwrap().is_empty());

        let limited = store.pending_outbox(Utc::now(), 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].message_type, "A");
        assert_eq!(limited[1].message_type, "B");
    }

    #[tokio::test]
    async fn dispatched_rows_do_not_accumulate() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        let mut instance = store.create_if_absent(id, "Initial").await.unwrap();

        for step in 0..50 {
            let next = advance(&instance, &format!("Step{step}"));
            let message = OutboxMessage::new(id, "dest", "Cmd", json!({ "step": step }));
            let message_id = message.id;
            store
                .save_with_outbox(&next, instance.version, vec![message])
                .await
                .unwrap();
            store.mark_dispatched(message_id).await.unwrap();
            instance = next;
        }

        assert_eq!(store.pending_count().await, 0);
        assert!(store.outbox().await.is_empty());
    }

    #[tokio::test]
    async fn list_active_filters_by_state_with_write_time() {
        let store = InMemorySagaStore::new();
        let waiting = CorrelationId::new();
        let finished = CorrelationId::new();
        let fresh = CorrelationId::new();

        for id in [waiting, finished, fresh] {
            store.create_if_absent(id, "Initial").await.unwrap();
        }
        let initial = store.load(waiting).await.unwrap();
        store
            .save(&advance(&initial, "FetchingContent"), initial.version)
            .await
            .unwrap();
        let initial = store.load(finished).await.unwrap();
        store
            .save(&advance(&initial, "Concluded"), initial.version)
            .await
            .unwrap();

        let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
        store.set_updated_at(waiting, an_hour_ago).await;

        let states = vec!["FetchingContent".to_string(), "SendingDelivery".to_string()];
        let active = store.list_active(&states).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].instance.correlation_id, waiting);
        assert_eq!(active[0].instance.version, Version::new(1));
        assert_eq!(active[0].updated_at, an_hour_ago);

        store.set_unavailable(true).await;
        assert!(store.list_active(&states).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_run_out() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();
        store.fail_next(2).await;

        for _ in 0..2 {
            let err = store.create_if_absent(id, "Initial").await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(store.create_if_absent(id, "Initial").await.is_ok());

        store.set_unavailable(true).await;
        assert!(matches!(
            store.load(id).await,
            Err(SagaStoreError::Unavailable(_))
        ));
        store.set_unavailable(false).await;
        assert!(store.load(id).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_creators_share_one_instance() {
        let store = InMemorySagaStore::new();
        let id = CorrelationId::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create_if_absent(id, "Initial").await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().version, Version::initial());
        }
        assert_eq!(store.instance_count().await, 1);
    }
}
