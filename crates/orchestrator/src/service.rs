//! Composition root: wires transport, store, dispatcher and background tasks.

use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use saga::{CorrelationRouter, newsletter};
use saga_store::SagaStore;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use transport::Transport;

use crate::action::{ActionInvoker, ActionRelay};
use crate::config::Config;
use crate::dispatcher::PartitionedDispatcher;
use crate::error::OrchestratorError;
use crate::fault::FaultPublisher;
use crate::outbox::{OutboxPublisher, OutboxRelay};
use crate::processor::SagaProcessor;
use crate::retry::RetryLayer;
use crate::watchdog::Watchdog;

/// The saga orchestrator service.
///
/// Consumes the saga queue until the shutdown future resolves or a fatal
/// error occurs, then drains in-flight work within the configured grace
/// period and closes the transport.
pub struct Orchestrator<St> {
    config: Config,
    store: St,
    transport: Arc<dyn Transport>,
    invoker: Option<Arc<dyn ActionInvoker>>,
}

impl<St> Orchestrator<St>
where
    St: SagaStore + Clone + 'static,
{
    pub fn new(config: Config, store: St, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            store,
            transport,
            invoker: None,
        }
    }

    /// Runs step workers in-process, consuming the command destinations.
    pub fn with_action_invoker(mut self, invoker: Arc<dyn ActionInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Runs until `shutdown` resolves. Returns `Err` for fatal errors.
    pub async fn run<F>(self, shutdown: F) -> Result<(), OrchestratorError>
    where
        F: Future<Output = ()> + Send,
    {
        let config = self.config;
        let machine = Arc::new(newsletter::state_machine()?);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Sagas left waiting by a previous run get their deadlines back
        let watchdog = Watchdog::new(
            self.transport.clone(),
            config.saga_queue.clone(),
            config.action_timeout,
        );
        tasks.push(watchdog.spawn_restore(
            self.store.clone(),
            machine.clone(),
            stop_rx.clone(),
        ));

        let publisher = OutboxPublisher::new(self.store.clone(), self.transport.clone());
        tasks.push(
            OutboxRelay::new(publisher.clone(), config.outbox_poll_interval)
                .spawn(stop_rx.clone()),
        );

        if let Some(invoker) = self.invoker {
            let relay = ActionRelay::new(
                self.transport.clone(),
                invoker,
                config.saga_queue.clone(),
                config.prefetch_count,
            );
            tasks.extend(relay.spawn(&newsletter::DESTINATIONS, stop_rx.clone()).await?);
        }

        let processor = SagaProcessor::new(
            machine.clone(),
            CorrelationRouter::new(self.store.clone()),
            publisher,
        )
        .with_watchdog(watchdog.clone());
        let layer = Arc::new(RetryLayer::new(processor, config.retry_policy()));
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let dispatcher = PartitionedDispatcher::start(
            config.dispatcher_config(),
            layer,
            FaultPublisher::new(self.transport.clone(), &config.saga_queue),
            fatal_tx,
        );

        let mut deliveries = self
            .transport
            .subscribe(&config.saga_queue, config.concurrent_message_limit)
            .await?;
        tracing::info!(
            saga = machine.name(),
            queue = %config.saga_queue,
            lanes = dispatcher.lane_count(),
            "orchestrator consuming"
        );

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown requested, stopping intake");
                    break Ok(());
                }
                Some(error) = fatal_rx.recv() => {
                    break Err(error);
                }
                next = deliveries.next() => match next {
                    // A saturated lane must not hold off shutdown or a fatal
                    // report; the abandoned delivery is requeued on drop.
                    Some(delivery) => tokio::select! {
                        dispatched = dispatcher.dispatch(delivery) => {
                            if let Err(e) = dispatched {
                                if e.is_fatal() {
                                    break Err(e);
                                }
                                tracing::error!(error = %e, "dispatch failed");
                            }
                        }
                        () = &mut shutdown => {
                            tracing::info!("shutdown requested while dispatch was blocked");
                            break Ok(());
                        }
                        Some(error) = fatal_rx.recv() => {
                            break Err(error);
                        }
                    },
                    None => {
                        tracing::warn!("saga queue subscription ended");
                        break Ok(());
                    }
                },
            }
        };

        drop(deliveries);
        dispatcher.shutdown(config.shutdown_grace).await;
        let _ = stop_tx.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        watchdog.shutdown();
        if let Err(e) = self.transport.close().await {
            tracing::warn!(error = %e, "transport close failed");
        }

        match &result {
            Ok(()) => tracing::info!("orchestrator stopped"),
            Err(e) => tracing::error!(
                error = %e,
                error_class = e.error_class(),
                "orchestrator stopped on fatal error"
            ),
        }
        result
    }
}
