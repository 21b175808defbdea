//! Transport abstraction for the saga orchestrator.
//!
//! A transport moves [`Message`]s between named destinations with
//! at-least-once delivery. Consumers receive [`Delivery`] values and must
//! settle each one explicitly with `ack` or `nack`; a delivery dropped
//! without settlement is handed out again.
//!
//! No ordering is promised across independent publishes. Per-key ordering is
//! the job of the dispatcher sitting on top of a subscription.

pub mod bus;
pub mod delivery;
pub mod error;
pub mod memory;
pub mod message;

pub use bus::{DeliveryStream, Transport};
pub use delivery::{Acknowledger, Delivery};
pub use error::{Result, TransportError};
pub use memory::InMemoryTransport;
pub use message::{CORRELATION_ID_HEADER, Message, MessageBuilder, MessageId};
