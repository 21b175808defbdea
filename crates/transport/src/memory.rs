use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};

use crate::{
    Acknowledger, Delivery, DeliveryStream, Message, Result, Transport, TransportError,
};

struct Queue {
    tx: mpsc::UnboundedSender<Message>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
    attached: Arc<AtomicBool>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            attached: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    /// Kept only by transports built with [`InMemoryTransport::recording`].
    journal: Option<Vec<(String, Message)>>,
    fail_publish: bool,
    failing_destinations: HashSet<String>,
}

struct Inner {
    state: Mutex<State>,
    closed: watch::Sender<bool>,
}

/// In-memory transport for tests and single-process deployments.
///
/// Each destination is an unbounded FIFO queue with at most one consumer.
/// Unsettled deliveries go back to the tail of their queue, so redelivered
/// messages may overtake nothing but may be overtaken by newer ones.
///
/// Settled messages are not retained unless the transport was built with
/// [`InMemoryTransport::recording`].
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                closed,
            }),
        }
    }
}

impl InMemoryTransport {
    /// Creates a new in-memory transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport that also keeps every successful publish for
    /// [`published`](Self::published).
    pub fn recording() -> Self {
        let transport = Self::default();
        transport.state().journal = Some(Vec::new());
        transport
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every subsequent publish fail with `Unavailable` until reset.
    pub fn set_fail_publish(&self, fail: bool) {
        self.state().fail_publish = fail;
    }

    /// Makes publishes to one destination fail with `Unavailable` until reset.
    pub fn set_fail_publish_to(&self, destination: &str, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_destinations.insert(destination.to_string());
        } else {
            state.failing_destinations.remove(destination);
        }
    }

    /// Returns every message successfully published to a destination, in
    /// order. Always empty unless the transport is recording.
    pub fn published(&self, destination: &str) -> Vec<Message> {
        self.state()
            .journal
            .iter()
            .flatten()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Returns the total number of recorded publishes.
    pub fn published_count(&self) -> usize {
        self.state().journal.as_ref().map_or(0, Vec::len)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, destination: &str, message: Message) -> Result<()> {
        if *self.inner.closed.borrow() {
            return Err(TransportError::Closed);
        }

        let mut state = self.state();
        if state.fail_publish || state.failing_destinations.contains(destination) {
            return Err(TransportError::Unavailable(format!(
                "publish to {destination} rejected"
            )));
        }

        let queue = state
            .queues
            .entry(destination.to_string())
            .or_insert_with(Queue::new);
        queue
            .tx
            .send(message.clone())
            .map_err(|_| TransportError::Closed)?;
        if let Some(journal) = state.journal.as_mut() {
            journal.push((destination.to_string(), message));
        }

        tracing::trace!(destination, "message published");
        Ok(())
    }

    async fn subscribe(&self, source: &str, prefetch: usize) -> Result<DeliveryStream> {
        if *self.inner.closed.borrow() {
            return Err(TransportError::Closed);
        }

        let (tx, rx, attached) = {
            let mut state = self.state();
            let queue = state
                .queues
                .entry(source.to_string())
                .or_insert_with(Queue::new);
            (queue.tx.clone(), queue.rx.clone(), queue.attached.clone())
        };

        if attached.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadySubscribed(source.to_string()));
        }

        let consumer = Consumer {
            tx,
            rx,
            permits: Arc::new(Semaphore::new(prefetch.max(1))),
            closed: self.inner.closed.subscribe(),
            _guard: AttachGuard(attached),
        };

        let deliveries = stream::unfold(consumer, |mut consumer| async move {
            let permit = consumer.permits.clone().acquire_owned().await.ok()?;
            let message = {
                let mut rx = consumer.rx.lock().await;
                tokio::select! {
                    message = rx.recv() => message,
                    () = wait_closed(&mut consumer.closed) => None,
                }
            }?;

            let acker = MemoryAcker {
                queue: consumer.tx.clone(),
                message: Some(message.clone()),
                _permit: permit,
            };
            Some((Delivery::new(message, Box::new(acker)), consumer))
        });

        tracing::debug!(source, prefetch, "consumer attached");
        Ok(Box::pin(deliveries))
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.send_replace(true);
        tracing::debug!("in-memory transport closed");
        Ok(())
    }
}

struct Consumer {
    tx: mpsc::UnboundedSender<Message>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
    permits: Arc<Semaphore>,
    closed: watch::Receiver<bool>,
    _guard: AttachGuard,
}

/// Frees the source for a new consumer once the stream is dropped.
struct AttachGuard(Arc<AtomicBool>);

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

struct MemoryAcker {
    queue: mpsc::UnboundedSender<Message>,
    message: Option<Message>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn requeue(&mut self) {
        if let Some(mut message) = self.message.take() {
            message.redelivery_count += 1;
            // The receiver lives as long as the queue entry, so this only
            // fails when the whole transport is gone.
            let _ = self.queue.send(message);
        }
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        self.message = None;
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<()> {
        if requeue {
            self.requeue();
        } else {
            self.message = None;
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.requeue();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::*;

    fn message(seq: u32) -> Message {
        Message::builder()
            .message_type("Test")
            .body_raw(serde_json::json!({ "seq": seq }))
            .build()
    }

    fn seq(delivery: &Delivery) -> u64 {
        delivery.message().body["seq"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn publish_then_consume_in_order() {
        let transport = InMemoryTransport::recording();
        for i in 0..3 {
            transport.publish("q", message(i)).await.unwrap();
        }

        let mut stream = transport.subscribe("q", 10).await.unwrap();
        for expected in 0..3 {
            let delivery = stream.next().await.unwrap();
            assert_eq!(seq(&delivery), expected);
            delivery.ack().await.unwrap();
        }
        assert_eq!(transport.published("q").len(), 3);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let transport = InMemoryTransport::new();
        transport.publish("q", message(1)).await.unwrap();

        let mut stream = transport.subscribe("q", 1).await.unwrap();
        let first = stream.next().await.unwrap();
        first.nack(true).await.unwrap();

        let second = stream.next().await.unwrap();
        assert_eq!(seq(&second), 1);
        assert_eq!(second.message().redelivery_count, 1);
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn nack_without_requeue_discards() {
        let transport = InMemoryTransport::new();
        transport.publish("q", message(1)).await.unwrap();
        transport.publish("q", message(2)).await.unwrap();

        let mut stream = transport.subscribe("q", 1).await.unwrap();
        stream.next().await.unwrap().nack(false).await.unwrap();
        let next = stream.next().await.unwrap();
        assert_eq!(seq(&next), 2);
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let transport = InMemoryTransport::new();
        transport.publish("q", message(5)).await.unwrap();

        let mut stream = transport.subscribe("q", 1).await.unwrap();
        drop(stream.next().await.unwrap());

        let again = stream.next().await.unwrap();
        assert_eq!(seq(&again), 5);
        assert_eq!(again.message().redelivery_count, 1);
    }

    #[tokio::test]
    async fn prefetch_bounds_outstanding_deliveries() {
        let transport = InMemoryTransport::new();
        for i in 0..3 {
            transport.publish("q", message(i)).await.unwrap();
        }

        let mut stream = transport.subscribe("q", 2).await.unwrap();
        let a = stream.next().await.unwrap();
        let _b = stream.next().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err(), "third delivery must wait for a settle");

        a.ack().await.unwrap();
        let c = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seq(&c), 2);
    }

    #[tokio::test]
    async fn second_consumer_is_rejected_until_first_detaches() {
        let transport = InMemoryTransport::new();
        let stream = transport.subscribe("q", 1).await.unwrap();

        let err = transport.subscribe("q", 1).await.err().unwrap();
        assert!(matches!(err, TransportError::AlreadySubscribed(_)));

        drop(stream);
        assert!(transport.subscribe("q", 1).await.is_ok());
    }

    #[tokio::test]
    async fn failing_publish_is_transient_and_not_recorded() {
        let transport = InMemoryTransport::recording();
        transport.set_fail_publish(true);

        let err = transport.publish("q", message(1)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(transport.published_count(), 0);

        transport.set_fail_publish(false);
        transport.publish("q", message(1)).await.unwrap();
        assert_eq!(transport.published_count(), 1);
    }

    #[tokio::test]
    async fn failing_destination_leaves_others_working() {
        let transport = InMemoryTransport::recording();
        transport.set_fail_publish_to("down", true);

        assert!(transport.publish("down", message(1)).await.is_err());
        transport.publish("up", message(2)).await.unwrap();
        assert_eq!(transport.published("up").len(), 1);

        transport.set_fail_publish_to("down", false);
        transport.publish("down", message(3)).await.unwrap();
        assert_eq!(transport.published("down").len(), 1);
    }

    #[tokio::test]
    async fn settled_messages_are_not_retained_by_default() {
        let transport = InMemoryTransport::new();
        let mut stream = transport.subscribe("q", 10).await.unwrap();

        for i in 0..1000 {
            transport.publish("q", message(i)).await.unwrap();
            stream.next().await.unwrap().ack().await.unwrap();
        }

        assert_eq!(transport.published_count(), 0);
        assert!(transport.published("q").is_empty());
        assert!(transport.state().journal.is_none());
    }

    #[tokio::test]
    async fn close_ends_streams_and_rejects_publish() {
        let transport = InMemoryTransport::new();
        let mut stream = transport.subscribe("q", 1).await.unwrap();

        transport.close().await.unwrap();

        assert!(stream.next().await.is_none());
        assert!(matches!(
            transport.publish("q", message(1)).await,
            Err(TransportError::Closed)
        ));
    }
}
