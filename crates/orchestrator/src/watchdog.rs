//! Result watchdog: turns missing step results into timeout events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use common::{CorrelationId, Version};
use saga::{EventEnvelope, EventKind, MachineEvent, MachineState, OutgoingCommand, StateMachine};
use saga_store::{SagaStore, SagaStoreError};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use transport::Transport;

/// Retry schedule for restoring timers while the store is unreachable.
fn restore_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(usize::MAX)
}

/// One timer per saga version and awaited action.
type TimerKey = (CorrelationId, Version, String);

struct Inner {
    transport: Arc<dyn Transport>,
    saga_queue: String,
    timeout: Duration,
    timers: Mutex<HashMap<TimerKey, AbortHandle>>,
}

/// Arms one timer per dispatched command.
///
/// A timer that expires publishes `StepTimedOut` pinned to the command's
/// version, so it is dropped as stale if the saga moved on in the meantime.
/// Timers are in-process; [`Watchdog::restore`] rebuilds them from the store
/// after a restart.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    pub fn new(transport: Arc<dyn Transport>, saga_queue: impl Into<String>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                saga_queue: saga_queue.into(),
                timeout,
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<TimerKey, AbortHandle>> {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the full-length timer for a command.
    pub fn arm(&self, command: &OutgoingCommand) {
        self.arm_after(
            command.correlation_id,
            command.version,
            &command.request.action,
            self.inner.timeout,
        );
    }

    /// Starts a timer for `action` at `version` that expires after `delay`.
    ///
    /// Re-arming the same saga, version and action replaces the old timer.
    pub fn arm_after(
        &self,
        correlation_id: CorrelationId,
        version: Version,
        action: &str,
        delay: Duration,
    ) {
        let key: TimerKey = (correlation_id, version, action.to_string());
        let inner = self.inner.clone();
        let fired = key.clone();

        // Hold the map while spawning so the timer cannot remove its entry first
        let mut timers = self.timers();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner
                .timers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&fired);
            fire(&inner, &fired).await;
        });

        if let Some(previous) = timers.insert(key, task.abort_handle()) {
            previous.abort();
        }
    }

    /// Cancels every timer for commands produced at `version`.
    pub fn disarm(&self, correlation_id: CorrelationId, version: Version) {
        self.timers().retain(|(id, armed_at, _), timer| {
            let matches = *id == correlation_id && *armed_at == version;
            if matches {
                timer.abort();
            }
            !matches
        });
    }

    /// Number of timers still running.
    pub fn armed(&self) -> usize {
        self.timers().len()
    }

    /// Re-arms timers for sagas that were awaiting a step result when the
    /// previous process stopped.
    ///
    /// The deadline counts from the saga's last write; one that has already
    /// passed fires immediately. Returns the number of timers armed.
    pub async fn restore<St, S, K>(
        &self,
        store: &St,
        machine: &StateMachine<S, K>,
    ) -> Result<usize, SagaStoreError>
    where
        St: SagaStore,
        S: MachineState,
        K: MachineEvent,
    {
        let states: Vec<String> = machine
            .awaiting_states()
            .iter()
            .map(ToString::to_string)
            .collect();
        let active = store.list_active(&states).await?;

        let now = Utc::now();
        let mut restored = 0;
        for saga in active {
            let instance = &saga.instance;
            let Ok(state) = machine.state_of(instance) else {
                continue;
            };
            let elapsed = (now - saga.updated_at).to_std().unwrap_or_default();
            let remaining = self.inner.timeout.saturating_sub(elapsed);

            for spec in machine.actions_entering(state) {
                self.arm_after(instance.correlation_id, instance.version, &spec.action, remaining);
                restored += 1;
            }
        }

        tracing::info!(restored, "watchdog timers restored");
        Ok(restored)
    }

    /// Runs [`restore`](Self::restore) in the background, retrying while the
    /// store is unavailable, until it succeeds or `shutdown` flips to true.
    ///
    /// A timer restored after the saga moved on fires a stale timeout, which
    /// the saga drops.
    pub fn spawn_restore<St, S, K>(
        &self,
        store: St,
        machine: Arc<StateMachine<S, K>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        St: SagaStore + 'static,
        S: MachineState,
        K: MachineEvent,
    {
        let watchdog = self.clone();
        tokio::spawn(async move {
            let restore = (|| watchdog.restore(&store, &*machine))
                .retry(restore_backoff())
                .sleep(tokio::time::sleep)
                .when(SagaStoreError::is_transient)
                .notify(|e: &SagaStoreError, delay: Duration| {
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "watchdog restore failed, retrying"
                    );
                });

            tokio::select! {
                result = restore => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "watchdog restore failed");
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => {}
            }
        })
    }

    /// Cancels every timer.
    pub fn shutdown(&self) {
        let mut timers = self.timers();
        let count = timers.len();
        for (_, timer) in timers.drain() {
            timer.abort();
        }
        tracing::debug!(cancelled = count, "watchdog stopped");
    }
}

async fn fire(inner: &Inner, (correlation_id, version, action): &TimerKey) {
    metrics::counter!("saga_timeouts_total").increment(1);
    tracing::warn!(%correlation_id, %version, action, "step result timed out");

    let envelope = EventEnvelope::new(*correlation_id, EventKind::StepTimedOut)
        .with_version(*version)
        .with_payload(serde_json::json!({
            "action": action,
            "reason": format!("no result within {}s", inner.timeout.as_secs()),
        }));

    let published = match envelope.to_message() {
        Ok(message) => inner
            .transport
            .publish(&inner.saga_queue, message)
            .await
            .map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    if let Err(error) = published {
        tracing::error!(%correlation_id, %error, "failed to publish step timeout");
    }
}
