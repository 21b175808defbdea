//! Per-envelope processing: route, apply, persist with outbox, publish.

use std::sync::Arc;

use async_trait::async_trait;
use saga::{CorrelationRouter, EventEnvelope, NewsletterMachine, Outcome, decode_envelope};
use saga_store::{OutboxMessage, SagaStore};
use transport::Message;

use crate::error::OrchestratorError;
use crate::outbox::{OutboxPublisher, stage};
use crate::retry::EnvelopeHandler;
use crate::watchdog::Watchdog;

/// Applies saga envelopes under the persist-then-publish discipline.
///
/// The transition and its commands commit together; publishing happens
/// afterwards and a failed publish leaves the commands to the outbox relay.
pub struct SagaProcessor<St> {
    machine: Arc<NewsletterMachine>,
    router: CorrelationRouter<St>,
    publisher: OutboxPublisher<St>,
    watchdog: Option<Watchdog>,
}

impl<St: SagaStore> SagaProcessor<St> {
    pub fn new(
        machine: Arc<NewsletterMachine>,
        router: CorrelationRouter<St>,
        publisher: OutboxPublisher<St>,
    ) -> Self {
        Self {
            machine,
            router,
            publisher,
            watchdog: None,
        }
    }

    /// Arms a result timer for every dispatched command.
    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    #[tracing::instrument(
        skip(self, envelope),
        fields(correlation_id = %envelope.correlation_id, event_kind = %envelope.event_kind)
    )]
    async fn process(&self, envelope: &EventEnvelope) -> Result<(), OrchestratorError> {
        let Some(instance) = self.router.resolve(&self.machine, envelope).await? else {
            metrics::counter!("saga_noop_total", "reason" => "unknown_saga").increment(1);
            return Ok(());
        };

        let transition = match self.machine.apply(&instance, envelope)? {
            Outcome::NoOp(reason) => {
                metrics::counter!("saga_noop_total", "reason" => reason.as_str()).increment(1);
                tracing::debug!(
                    state = %instance.current_state,
                    reason = reason.as_str(),
                    "event ignored"
                );
                return Ok(());
            }
            Outcome::Transitioned(transition) => transition,
        };

        let staged = transition
            .commands
            .iter()
            .map(stage)
            .collect::<Result<Vec<OutboxMessage>, _>>()?;

        self.router
            .store()
            .save_with_outbox(&transition.instance, instance.version, staged.clone())
            .await?;

        metrics::counter!(
            "saga_transitions_total",
            "from" => transition.from.as_str(),
            "to" => transition.to.as_str()
        )
        .increment(1);
        tracing::info!(
            from = %transition.from,
            to = %transition.to,
            version = %transition.instance.version,
            commands = staged.len(),
            "saga transitioned"
        );

        if let Some(watchdog) = &self.watchdog {
            watchdog.disarm(instance.correlation_id, instance.version);
            for command in &transition.commands {
                watchdog.arm(command);
            }
        }

        for message in &staged {
            if let Err(e) = self.publisher.publish(message).await {
                tracing::warn!(
                    outbox_id = %message.id,
                    error = %e,
                    "command publish failed, left for outbox relay"
                );
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<St: SagaStore> EnvelopeHandler for SagaProcessor<St> {
    async fn handle(&self, message: &Message) -> Result<(), OrchestratorError> {
        let envelope: EventEnvelope = decode_envelope(message)?;
        self.process(&envelope).await
    }
}
