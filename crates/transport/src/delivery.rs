use async_trait::async_trait;

use crate::{Message, Result};

/// Settles a delivery with the transport it came from.
///
/// Implementations that are dropped without being settled must hand the
/// message back to the transport for redelivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirms the message was processed; it will not be delivered again.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Rejects the message. With `requeue` the transport delivers it again,
    /// otherwise it is discarded.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer, together with the handle used to settle it.
pub struct Delivery {
    message: Message,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Creates a delivery.
    pub fn new(message: Message, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    /// Returns the delivered message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Acknowledges the delivery.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledges the delivery.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
