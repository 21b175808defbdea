//! Outbox publishing and the relay that recovers unpublished commands.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::Utc;
use saga::OutgoingCommand;
use saga_store::{OutboxMessage, SagaStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use transport::{MessageId, Transport};
use uuid::Uuid;

use crate::error::OrchestratorError;

/// Maximum rows a single relay pass publishes.
const RELAY_BATCH_SIZE: usize = 100;

/// Consecutive relay failures after which a row is backed off.
pub const RELAY_DEFER_AFTER: u32 = 3;

/// How long a repeatedly failing row sits out of relay passes.
fn deferral_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(300))
        .with_max_times(usize::MAX)
}

#[derive(Debug, Clone, Copy)]
struct Deferral {
    failures: u32,
    retry_at: Instant,
}

/// Stages a command as an outbox row.
pub fn stage(command: &OutgoingCommand) -> Result<OutboxMessage, serde_json::Error> {
    Ok(OutboxMessage::new(
        command.correlation_id,
        &command.destination,
        &command.request.action,
        serde_json::to_value(command)?,
    ))
}

/// Publishes staged outbox rows and marks them dispatched.
///
/// Rows that keep failing in relay passes are backed off, so they cannot
/// hold newer rows out of the batch.
#[derive(Clone)]
pub struct OutboxPublisher<St> {
    store: St,
    transport: Arc<dyn Transport>,
    batch_size: usize,
    deferred: Arc<Mutex<HashMap<Uuid, Deferral>>>,
}

impl<St: SagaStore> OutboxPublisher<St> {
    pub fn new(store: St, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            batch_size: RELAY_BATCH_SIZE,
            deferred: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Overrides how many rows one relay pass publishes.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn deferred(&self) -> MutexGuard<'_, HashMap<Uuid, Deferral>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of rows currently sitting out relay passes.
    pub fn deferred_count(&self) -> usize {
        let now = Instant::now();
        self.deferred()
            .values()
            .filter(|deferral| deferral.retry_at > now)
            .count()
    }

    /// Publishes one row. The row stays pending unless both the publish and
    /// the dispatch mark succeed.
    #[tracing::instrument(
        skip(self, message),
        fields(outbox_id = %message.id, correlation_id = %message.correlation_id, destination = %message.destination)
    )]
    pub async fn publish(&self, message: &OutboxMessage) -> Result<(), OrchestratorError> {
        let command: OutgoingCommand = serde_json::from_value(message.body.clone())?;
        let wire = command.to_message(MessageId::from_uuid(message.id))?;

        if let Err(e) = self.transport.publish(&message.destination, wire).await {
            metrics::counter!("outbox_publish_failures_total").increment(1);
            return Err(e.into());
        }
        self.store.mark_dispatched(message.id).await?;
        self.deferred().remove(&message.id);

        metrics::counter!("outbox_published_total").increment(1);
        tracing::debug!(action = %message.message_type, "command published");
        Ok(())
    }

    /// Republishes pending rows created at or before `now - min_age`.
    ///
    /// Failures on individual rows are logged and left for a later pass;
    /// rows deferred after repeated failures are skipped until their backoff
    /// runs out. Returns the number of rows published.
    pub async fn flush_pending(&self, min_age: Duration) -> Result<usize, OrchestratorError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(min_age).unwrap_or_else(|_| chrono::Duration::zero());
        let skipped = self.deferred_count();
        let pending = self
            .store
            .pending_outbox(cutoff, self.batch_size + skipped)
            .await?;

        let now = Instant::now();
        let due: Vec<&OutboxMessage> = {
            let deferred = self.deferred();
            pending
                .iter()
                .filter(|message| {
                    deferred
                        .get(&message.id)
                        .is_none_or(|deferral| deferral.retry_at <= now)
                })
                .take(self.batch_size)
                .collect()
        };

        let mut published = 0;
        for message in &due {
            match self.publish(message).await {
                Ok(()) => published += 1,
                Err(e) => self.record_failure(message, &e),
            }
        }

        if published > 0 {
            tracing::info!(published, pending = pending.len(), "relayed pending outbox messages");
        }
        Ok(published)
    }

    fn record_failure(&self, message: &OutboxMessage, error: &OrchestratorError) {
        let mut deferred = self.deferred();
        let deferral = deferred.entry(message.id).or_insert(Deferral {
            failures: 0,
            retry_at: Instant::now(),
        });
        deferral.failures += 1;

        if deferral.failures < RELAY_DEFER_AFTER {
            tracing::warn!(outbox_id = %message.id, error = %error, "relay publish failed, will retry");
            return;
        }

        let step = (deferral.failures - RELAY_DEFER_AFTER).min(16) as usize;
        let delay = deferral_backoff()
            .build()
            .nth(step)
            .unwrap_or(Duration::from_secs(300));
        deferral.retry_at = Instant::now() + delay;

        if deferral.failures == RELAY_DEFER_AFTER {
            metrics::counter!("outbox_deferred_total").increment(1);
        }
        tracing::error!(
            outbox_id = %message.id,
            destination = %message.destination,
            failures = deferral.failures,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "outbox row keeps failing, backing off"
        );
    }
}

/// Background task that drains the outbox on a fixed interval.
pub struct OutboxRelay<St> {
    publisher: OutboxPublisher<St>,
    poll_interval: Duration,
}

impl<St: SagaStore + Clone + 'static> OutboxRelay<St> {
    pub fn new(publisher: OutboxPublisher<St>, poll_interval: Duration) -> Self {
        Self {
            publisher,
            poll_interval,
        }
    }

    /// Spawns the relay loop.
    ///
    /// The first pass runs immediately and takes every pending row, which
    /// recovers commands left behind by a crash. Later passes skip rows
    /// younger than one poll interval so they do not race inline publishing.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                poll_ms = self.poll_interval.as_millis() as u64,
                "outbox relay started"
            );

            if let Err(e) = self.publisher.flush_pending(Duration::ZERO).await {
                tracing::error!(error = %e, "startup outbox recovery failed");
            }

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {
                        if let Err(e) = self.publisher.flush_pending(self.poll_interval).await {
                            tracing::error!(error = %e, "outbox relay pass failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("outbox relay stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CorrelationId, Version};
    use saga::events::{COMMAND_MESSAGE_TYPE, SAGA_VERSION_HEADER};
    use saga::{ActionRequest, EventEnvelope, EventKind, Outcome, newsletter};
    use saga_store::InMemorySagaStore;
    use transport::InMemoryTransport;

    async fn staged_release(store: &InMemorySagaStore) -> (CorrelationId, OutboxMessage) {
        let machine = newsletter::state_machine().unwrap();
        let id = CorrelationId::new();
        let instance = store.create_if_absent(id, "Initial").await.unwrap();
        let Outcome::Transitioned(t) = machine
            .apply(&instance, &EventEnvelope::new(id, EventKind::ReleaseIn))
            .unwrap()
        else {
            panic!("release should transition");
        };

        let row = stage(&t.commands[0]).unwrap();
        store
            .save_with_outbox(&t.instance, instance.version, vec![row.clone()])
            .await
            .unwrap();
        (id, row)
    }

    #[tokio::test]
    async fn publish_sends_command_and_marks_row() {
        let store = InMemorySagaStore::new();
        let transport = InMemoryTransport::recording();
        let publisher = OutboxPublisher::new(store.clone(), Arc::new(transport.clone()));
        let (id, row) = staged_release(&store).await;

        publisher.publish(&row).await.unwrap();

        let sent = transport.published(newsletter::CONTENT_GENERATOR);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, MessageId::from_uuid(row.id));
        assert_eq!(sent[0].message_type, COMMAND_MESSAGE_TYPE);
        assert_eq!(sent[0].header(SAGA_VERSION_HEADER), Some("1"));

        let request: ActionRequest = sent[0].decode().unwrap();
        assert_eq!(request.action, newsletter::GENERATE_CONTENT);
        assert_eq!(request.correlation_id, id);
        assert_eq!(store.pending_count().await, 0);
    }

    #[tokio::test]
    async fn failed_publish_leaves_row_pending_until_flushed() {
        let store = InMemorySagaStore::new();
        let transport = InMemoryTransport::recording();
        let publisher = OutboxPublisher::new(store.clone(), Arc::new(transport.clone()));
        let (_, row) = staged_release(&store).await;

        transport.set_fail_publish(true);
        assert!(publisher.publish(&row).await.unwrap_err().is_transient());
        assert_eq!(publisher.flush_pending(Duration::ZERO).await.unwrap(), 0);
        assert_eq!(store.pending_count().await, 1);

        transport.set_fail_publish(false);
        assert_eq!(publisher.flush_pending(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(store.pending_count().await, 0);
        assert_eq!(transport.published(newsletter::CONTENT_GENERATOR).len(), 1);
    }

    async fn staged_to(store: &InMemorySagaStore, destination: &str) -> OutboxMessage {
        let id = CorrelationId::new();
        let instance = store.create_if_absent(id, "Initial").await.unwrap();
        let mut next = instance.clone();
        next.previous_state = "Initial".to_string();
        next.current_state = "FetchingContent".to_string();
        next.version = Version::new(1);

        let row = stage(&OutgoingCommand {
            destination: destination.to_string(),
            correlation_id: id,
            previous_state: next.previous_state.clone(),
            current_state: next.current_state.clone(),
            version: next.version,
            request: ActionRequest {
                action: newsletter::GENERATE_CONTENT.to_string(),
                data: None,
                correlation_id: id,
            },
        })
        .unwrap();
        store
            .save_with_outbox(&next, instance.version, vec![row.clone()])
            .await
            .unwrap();
        row
    }

    #[tokio::test(start_paused = true)]
    async fn failing_rows_back_off_so_newer_rows_still_go_out() {
        let store = InMemorySagaStore::new();
        let transport = InMemoryTransport::recording();
        let publisher = OutboxPublisher::new(store.clone(), Arc::new(transport.clone()))
            .with_batch_size(2);
        transport.set_fail_publish_to(newsletter::CONTENT_GENERATOR, true);
        staged_to(&store, newsletter::CONTENT_GENERATOR).await;
        staged_to(&store, newsletter::CONTENT_GENERATOR).await;
        let fresh = staged_to(&store, newsletter::DELIVERY_SENDER).await;

        // The two oldest rows fill every batch until they are backed off
        for _ in 0..RELAY_DEFER_AFTER {
            assert_eq!(publisher.flush_pending(Duration::ZERO).await.unwrap(), 0);
        }
        assert_eq!(publisher.deferred_count(), 2);

        assert_eq!(publisher.flush_pending(Duration::ZERO).await.unwrap(), 1);
        let sent = transport.published(newsletter::DELIVERY_SENDER);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, MessageId::from_uuid(fresh.id));
        assert_eq!(store.pending_count().await, 2);

        // Healed rows wait out their backoff, then go out
        transport.set_fail_publish_to(newsletter::CONTENT_GENERATOR, false);
        assert_eq!(publisher.flush_pending(Duration::ZERO).await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(publisher.flush_pending(Duration::ZERO).await.unwrap(), 2);
        assert_eq!(store.pending_count().await, 0);
        assert_eq!(publisher.deferred_count(), 0);
    }

    #[tokio::test]
    async fn flush_skips_rows_younger_than_min_age() {
        let store = InMemorySagaStore::new();
        let transport = InMemoryTransport::recording();
        let publisher = OutboxPublisher::new(store.clone(), Arc::new(transport.clone()));
        staged_release(&store).await;

        assert_eq!(
            publisher.flush_pending(Duration::from_secs(60)).await.unwrap(),
            0
        );
        assert_eq!(store.pending_count().await, 1);
    }

    #[tokio::test]
    async fn relay_recovers_pending_rows_at_startup() {
        let store = InMemorySagaStore::new();
        let transport = InMemoryTransport::recording();
        let (_, _row) = staged_release(&store).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let relay = OutboxRelay::new(
            OutboxPublisher::new(store.clone(), Arc::new(transport.clone())),
            Duration::from_secs(3600),
        );
        let handle = relay.spawn(stop_rx);

        for _ in 0..100 {
            if store.pending_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.pending_count().await, 0);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn staged_row_round_trips_the_command() {
        let id = CorrelationId::new();
        let command = OutgoingCommand {
            destination: newsletter::DELIVERY_SENDER.to_string(),
            correlation_id: id,
            previous_state: "FetchingOAuthToken".to_string(),
            current_state: "SendingDelivery".to_string(),
            version: Version::new(3),
            request: ActionRequest {
                action: newsletter::SEND_DELIVERY.to_string(),
                data: None,
                correlation_id: id,
            },
        };

        let row = stage(&command).unwrap();
        assert_eq!(row.destination, newsletter::DELIVERY_SENDER);
        assert_eq!(row.message_type, newsletter::SEND_DELIVERY);
        assert_eq!(
            serde_json::from_value::<OutgoingCommand>(row.body).unwrap(),
            command
        );
    }
}
