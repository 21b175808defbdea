//! Retry middleware: re-runs a whole envelope on transient failure.
//!
//! The schedule is driven by `backon`; [`RetryPolicy`] adapts the configured
//! intervals into a backoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, Retryable};
use transport::Message;

use crate::error::OrchestratorError;

/// Escalating backoff with a bounded number of attempts.
///
/// The delay before attempt `n + 1` is the `n`-th interval; once the list
/// runs out its last entry repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    intervals: Vec<Duration>,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(intervals: Vec<Duration>, max_attempts: u32) -> Self {
        Self {
            intervals,
            max_attempts: max_attempts.max(1),
        }
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self::new(Vec::new(), 1)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay before the next attempt, or `None` when `attempts`
    /// already made exhaust the policy.
    pub fn delay_after(&self, attempts: u32) -> Option<Duration> {
        if attempts == 0 || attempts >= self.max_attempts {
            return None;
        }
        let index = (attempts as usize - 1).min(self.intervals.len().saturating_sub(1));
        Some(self.intervals.get(index).copied().unwrap_or_default())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            7,
        )
    }
}

/// The delays of one retry chain, as handed to `backon`.
#[derive(Debug)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    attempts: u32,
}

impl Iterator for RetrySchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.attempts += 1;
        self.policy.delay_after(self.attempts)
    }
}

impl BackoffBuilder for RetryPolicy {
    type Backoff = RetrySchedule;

    fn build(self) -> Self::Backoff {
        RetrySchedule {
            policy: self,
            attempts: 0,
        }
    }
}

/// Processes one message from the saga queue.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), OrchestratorError>;
}

/// What the dispatcher must do with a message after retries.
#[derive(Debug)]
pub enum Disposition {
    /// Processed (including ignored); acknowledge.
    Completed,
    /// Gave up; route to the fault destination.
    Faulted {
        attempts: u32,
        error: OrchestratorError,
    },
}

/// Wraps a handler with the retry policy.
pub struct RetryLayer<H> {
    inner: H,
    policy: RetryPolicy,
}

impl<H: EnvelopeHandler> RetryLayer<H> {
    pub fn new(inner: H, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// Runs the handler until it succeeds, fails permanently or runs out of
    /// attempts. Fatal errors are returned as `Err`.
    #[tracing::instrument(skip(self, message), fields(message_id = %message.id))]
    pub async fn process(&self, message: &Message) -> Result<Disposition, OrchestratorError> {
        let attempts = AtomicU32::new(0);
        let result = (|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            self.inner.handle(message)
        })
        .retry(self.policy.clone())
        .sleep(tokio::time::sleep)
        .when(|e: &OrchestratorError| e.is_transient() && !e.is_fatal())
        .notify(|e: &OrchestratorError, delay: Duration| {
            metrics::counter!("saga_retries_total", "error_class" => e.error_class())
                .increment(1);
            tracing::warn!(
                attempt = attempts.load(Ordering::SeqCst),
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "transient failure, retrying envelope"
            );
        })
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        match result {
            Ok(()) => Ok(Disposition::Completed),
            Err(e) if e.is_fatal() => Err(e),
            Err(error) => {
                tracing::error!(attempts, error = %error, "giving up on envelope");
                Ok(Disposition::Faulted { attempts, error })
            }
        }
    }
}
