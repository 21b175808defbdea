use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    ActiveSaga, CorrelationId, MAX_STATE_NAME_LEN, OutboxMessage, Result, SagaInstance,
    SagaStoreError, Version,
};

/// Core trait for saga store implementations.
///
/// Writes use optimistic concurrency: a save only succeeds if the stored
/// version still equals the version the caller computed its transition
/// against. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Loads the instance for a correlation id.
    ///
    /// Fails with `NotFound` if no instance exists.
    async fn load(&self, correlation_id: CorrelationId) -> Result<SagaInstance>;

    /// Returns the existing instance, or creates one in `initial_state` at
    /// version 0. Concurrent callers observe the same single row.
    async fn create_if_absent(
        &self,
        correlation_id: CorrelationId,
        initial_state: &str,
    ) -> Result<SagaInstance>;

    /// Writes the instance and stages `outbox` messages atomically.
    ///
    /// Fails with `ConcurrencyConflict` if the stored version differs from
    /// `expected`; in that case neither the row nor the outbox is touched.
    /// Returns the new stored version.
    async fn save_with_outbox(
        &self,
        instance: &SagaInstance,
        expected: Version,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version>;

    /// Returns pending outbox messages created at or before `created_before`,
    /// oldest first.
    async fn pending_outbox(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>>;

    /// Marks an outbox message as published. Unknown ids are ignored.
    async fn mark_dispatched(&self, id: Uuid) -> Result<()>;

    /// Returns every instance whose current state is one of `states`,
    /// least recently written first.
    async fn list_active(&self, states: &[String]) -> Result<Vec<ActiveSaga>>;
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Saves an instance without staging any command.
    async fn save(&self, instance: &SagaInstance, expected: Version) -> Result<Version> {
        self.save_with_outbox(instance, expected, Vec::new()).await
    }

    /// Loads an instance, mapping `NotFound` to `None`.
    async fn find(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance>> {
        match self.load(correlation_id).await {
            Ok(instance) => Ok(Some(instance)),
            Err(SagaStoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// Blanket implementation for all SagaStore implementations
impl<T: SagaStore + ?Sized> SagaStoreExt for T {}

/// Checks a state name against the row schema.
pub fn validate_state_name(name: &str) -> Result<()> {
    if name.len() > MAX_STATE_NAME_LEN {
        return Err(SagaStoreError::Validation(format!(
            "state name '{name}' exceeds {MAX_STATE_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Validates an instance before it is written at `expected.next()`.
pub fn validate_for_save(instance: &SagaInstance, expected: Version) -> Result<()> {
    if instance.current_state.is_empty() {
        return Err(SagaStoreError::Validation(
            "current state must not be empty".to_string(),
        ));
    }
    validate_state_name(&instance.current_state)?;
    validate_state_name(&instance.previous_state)?;

    // Versions move by exactly one per accepted transition
    if instance.version != expected.next() {
        return Err(SagaStoreError::Validation(format!(
            "instance version must be {}, got {}",
            expected.next(),
            instance.version
        )));
    }

    Ok(())
}
