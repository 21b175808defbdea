//! Action relay: invokes step workers and reports their results back to the saga.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{CorrelationId, Version};
use futures_util::StreamExt;
use saga::events::SAGA_VERSION_HEADER;
use saga::{ActionRequest, EventEnvelope, EventKind, newsletter};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use transport::{Delivery, Transport, TransportError};

/// Errors reported by an action invoker.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action {action} failed: {reason}")]
    Failed { action: String, reason: String },

    #[error("unknown action: {0}")]
    Unknown(String),
}

/// Invokes the external worker behind an action.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    /// Runs the action.
    ///
    /// `Ok(Some(result))` is reported to the saga at once. `Ok(None)` means
    /// the worker accepted the request and answers out of band.
    async fn invoke(&self, request: &ActionRequest) -> Result<Option<serde_json::Value>, ActionError>;
}

/// In-process stand-in for the step workers.
///
/// Produces a deterministic result per action and supports fault injection:
/// failing actions return an error, silent actions never answer.
#[derive(Clone, Default)]
pub struct SimulatedActionInvoker {
    failing: Arc<RwLock<HashSet<String>>>,
    silent: Arc<RwLock<HashSet<String>>>,
    invocations: Arc<RwLock<Vec<ActionRequest>>>,
}

impl SimulatedActionInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures an action to fail on the next calls.
    pub fn set_failing(&self, action: &str, fail: bool) {
        toggle(&self.failing, action, fail);
    }

    /// Configures an action to accept requests without ever answering.
    pub fn set_silent(&self, action: &str, silent: bool) {
        toggle(&self.silent, action, silent);
    }

    /// Returns every request received so far.
    pub fn invocations(&self) -> Vec<ActionRequest> {
        self.invocations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn toggle(set: &RwLock<HashSet<String>>, action: &str, on: bool) {
    let mut set = set.write().unwrap_or_else(PoisonError::into_inner);
    if on {
        set.insert(action.to_string());
    } else {
        set.remove(action);
    }
}

fn contains(set: &RwLock<HashSet<String>>, action: &str) -> bool {
    set.read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(action)
}

#[async_trait]
impl ActionInvoker for SimulatedActionInvoker {
    async fn invoke(&self, request: &ActionRequest) -> Result<Option<serde_json::Value>, ActionError> {
        self.invocations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if contains(&self.failing, &request.action) {
            return Err(ActionError::Failed {
                action: request.action.clone(),
                reason: "simulated failure".to_string(),
            });
        }
        if contains(&self.silent, &request.action) {
            return Ok(None);
        }

        let id = request.correlation_id;
        let result = match request.action.as_str() {
            newsletter::GENERATE_CONTENT => json!({ "contentUri": format!("memory://newsletters/{id}/content") }),
            newsletter::ACQUIRE_TOKEN => json!({ "tokenRef": format!("token-{id}") }),
            newsletter::SEND_DELIVERY => json!({ "deliveryId": format!("delivery-{id}") }),
            other => return Err(ActionError::Unknown(other.to_string())),
        };
        Ok(Some(result))
    }
}

/// Consumes command destinations and turns invocations into saga events.
pub struct ActionRelay {
    transport: Arc<dyn Transport>,
    invoker: Arc<dyn ActionInvoker>,
    saga_queue: String,
    prefetch: usize,
}

impl ActionRelay {
    pub fn new(
        transport: Arc<dyn Transport>,
        invoker: Arc<dyn ActionInvoker>,
        saga_queue: impl Into<String>,
        prefetch: usize,
    ) -> Self {
        Self {
            transport,
            invoker,
            saga_queue: saga_queue.into(),
            prefetch,
        }
    }

    /// Subscribes to each destination and spawns one consumer per destination.
    pub async fn spawn(
        self,
        destinations: &[&str],
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, TransportError> {
        let relay = Arc::new(self);
        let mut handles = Vec::with_capacity(destinations.len());

        for destination in destinations {
            let mut deliveries = relay.transport.subscribe(destination, relay.prefetch).await?;
            let relay = relay.clone();
            let mut shutdown = shutdown.clone();
            let destination = destination.to_string();

            handles.push(tokio::spawn(async move {
                tracing::info!(%destination, "action relay consuming");
                loop {
                    tokio::select! {
                        next = deliveries.next() => match next {
                            Some(delivery) => relay.handle(delivery).await,
                            None => break,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                tracing::info!(%destination, "action relay stopped");
            }));
        }

        Ok(handles)
    }

    #[tracing::instrument(skip(self, delivery), fields(message_id = %delivery.message().id))]
    async fn handle(&self, delivery: Delivery) {
        let request: ActionRequest = match delivery.message().decode() {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(error = %e, "undecodable action request dropped");
                if let Err(e) = delivery.nack(false).await {
                    tracing::warn!(error = %e, "failed to reject action request");
                }
                return;
            }
        };
        let version = delivery
            .message()
            .header(SAGA_VERSION_HEADER)
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(Version::new);

        metrics::counter!("action_invocations_total", "action" => request.action.clone())
            .increment(1);

        let envelope = match self.invoker.invoke(&request).await {
            Ok(Some(result)) => match newsletter::result_event(&request.action) {
                Some(kind) => Some(envelope(request.correlation_id, kind, version, result)),
                None => Some(step_failed(&request, version, "no result event for action")),
            },
            Ok(None) => None,
            Err(e) => {
                metrics::counter!("action_failures_total", "action" => request.action.clone())
                    .increment(1);
                tracing::warn!(action = %request.action, error = %e, "action invocation failed");
                Some(step_failed(&request, version, &e.to_string()))
            }
        };

        let reported = match envelope {
            Some(envelope) => self.report(&envelope).await,
            None => Ok(()),
        };

        let settled = match reported {
            Ok(()) => delivery.ack().await,
            Err(e) => {
                tracing::error!(error = %e, "failed to report action outcome, requeueing");
                delivery.nack(true).await
            }
        };
        if let Err(e) = settled {
            tracing::warn!(error = %e, "failed to settle action request");
        }
    }

    async fn report(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        let message = envelope.to_message()?;
        self.transport.publish(&self.saga_queue, message).await
    }
}

fn envelope(
    correlation_id: CorrelationId,
    kind: EventKind,
    version: Option<Version>,
    payload: serde_json::Value,
) -> EventEnvelope {
    let envelope = EventEnvelope::new(correlation_id, kind).with_payload(payload);
    match version {
        Some(version) => envelope.with_version(version),
        None => envelope,
    }
}

fn step_failed(request: &ActionRequest, version: Option<Version>, reason: &str) -> EventEnvelope {
    envelope(
        request.correlation_id,
        EventKind::StepFailed,
        version,
        json!({ "action": request.action, "reason": reason }),
    )
}
