use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{Delivery, Message, Result};

/// A stream of deliveries from one source.
///
/// Dropping the stream detaches the consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Core trait for transport implementations.
///
/// Delivery is at-least-once: a message is handed out again until a
/// consumer acknowledges it. Implementations must be thread-safe.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes a message to a destination.
    async fn publish(&self, destination: &str, message: Message) -> Result<()>;

    /// Attaches a consumer to a source.
    ///
    /// At most `prefetch` deliveries are outstanding (handed out but not yet
    /// settled) at any time.
    async fn subscribe(&self, source: &str, prefetch: usize) -> Result<DeliveryStream>;

    /// Disconnects from the broker. Further publishes fail with `Closed`.
    async fn close(&self) -> Result<()>;
}
