//! Partitioned dispatch: per-correlation ordering across a fixed set of lanes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::CorrelationId;
use futures_util::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use transport::Delivery;

use crate::error::OrchestratorError;
use crate::fault::FaultPublisher;
use crate::retry::{Disposition, EnvelopeHandler, RetryLayer};

/// Lane layout and in-flight limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub lane_count: usize,
    /// Messages that may queue on one lane before dispatch blocks.
    pub lane_capacity: usize,
    /// Messages in flight across all lanes.
    pub concurrency_limit: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lane_count: 5,
            lane_capacity: 5,
            concurrency_limit: 20,
        }
    }
}

/// Maps a correlation id onto a lane.
pub fn lane_for(correlation_id: CorrelationId, lane_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    correlation_id.hash(&mut hasher);
    (hasher.finish() % lane_count.max(1) as u64) as usize
}

type LaneItem = (Delivery, OwnedSemaphorePermit);

/// Routes deliveries to sequential lane workers.
///
/// Every message of one saga lands on the same lane and lanes never process
/// two messages at once, so a saga sees its messages strictly in arrival order.
pub struct PartitionedDispatcher {
    lanes: Vec<mpsc::Sender<LaneItem>>,
    permits: Arc<Semaphore>,
    workers: Vec<JoinHandle<()>>,
}

impl PartitionedDispatcher {
    /// Spawns one worker per lane.
    ///
    /// Fatal errors stop the lane that hit them and are reported on `fatal_tx`.
    pub fn start<H>(
        config: DispatcherConfig,
        layer: Arc<RetryLayer<H>>,
        faults: FaultPublisher,
        fatal_tx: mpsc::UnboundedSender<OrchestratorError>,
    ) -> Self
    where
        H: EnvelopeHandler + 'static,
    {
        let lane_count = config.lane_count.max(1);
        let mut lanes = Vec::with_capacity(lane_count);
        let mut workers = Vec::with_capacity(lane_count);

        for lane in 0..lane_count {
            let (tx, rx) = mpsc::channel(config.lane_capacity.max(1));
            lanes.push(tx);
            workers.push(tokio::spawn(run_lane(
                lane,
                rx,
                layer.clone(),
                faults.clone(),
                fatal_tx.clone(),
            )));
        }

        tracing::info!(
            lanes = lane_count,
            lane_capacity = config.lane_capacity,
            concurrency_limit = config.concurrency_limit,
            "dispatcher started"
        );

        Self {
            lanes,
            permits: Arc::new(Semaphore::new(config.concurrency_limit.max(1))),
            workers,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Hands a delivery to its lane, waiting while the lane or the global
    /// in-flight limit is saturated.
    pub async fn dispatch(&self, delivery: Delivery) -> Result<(), OrchestratorError> {
        let correlation_id = match saga::correlation_id(delivery.message()) {
            Ok(id) => id,
            Err(e) => {
                if let Err(nack) = delivery.nack(true).await {
                    tracing::warn!(error = %nack, "failed to requeue unroutable message");
                }
                return Err(e.into());
            }
        };

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::LaneClosed(0))?;

        let lane = lane_for(correlation_id, self.lanes.len());
        self.lanes[lane]
            .send((delivery, permit))
            .await
            .map_err(|_| OrchestratorError::LaneClosed(lane))
    }

    /// Stops intake and waits up to `grace` for queued work; stragglers are aborted.
    pub async fn shutdown(self, grace: Duration) {
        drop(self.lanes);
        let aborts: Vec<_> = self.workers.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(grace, join_all(self.workers))
            .await
            .is_err()
        {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "dispatcher did not drain in time, aborting lanes"
            );
            for abort in aborts {
                abort.abort();
            }
        } else {
            tracing::info!("dispatcher drained");
        }
    }
}

#[tracing::instrument(name = "lane", skip(rx, layer, faults, fatal_tx))]
async fn run_lane<H: EnvelopeHandler>(
    lane: usize,
    mut rx: mpsc::Receiver<LaneItem>,
    layer: Arc<RetryLayer<H>>,
    faults: FaultPublisher,
    fatal_tx: mpsc::UnboundedSender<OrchestratorError>,
) {
    while let Some((delivery, _permit)) = rx.recv().await {
        let started = Instant::now();
        let outcome = match layer.process(delivery.message()).await {
            Ok(Disposition::Completed) => {
                settle(delivery.ack().await);
                "completed"
            }
            Ok(Disposition::Faulted { attempts, error }) => {
                match faults.publish(delivery.message(), attempts, &error).await {
                    Ok(()) => settle(delivery.ack().await),
                    Err(e) => {
                        tracing::error!(error = %e, "fault publish failed, requeueing envelope");
                        settle(delivery.nack(true).await);
                    }
                }
                "faulted"
            }
            Err(error) => {
                tracing::error!(error = %error, "fatal error, stopping lane");
                settle(delivery.nack(true).await);
                let _ = fatal_tx.send(error);
                break;
            }
        };

        metrics::histogram!("saga_envelope_duration_seconds", "outcome" => outcome)
            .record(started.elapsed().as_secs_f64());
    }

    tracing::debug!("lane stopped");
}

fn settle(result: transport::Result<()>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to settle delivery");
    }
}
