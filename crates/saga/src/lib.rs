//! Saga orchestration engine for newsletter releases.
//!
//! This crate holds everything that decides *what* happens to a saga:
//! a generic, immutable transition table ([`StateMachine`]), the newsletter
//! workflow declared on top of it, the envelopes and commands exchanged
//! with step workers, and the router that maps incoming messages to
//! persisted saga instances.
//!
//! The newsletter saga follows these steps:
//! 1. Generate content
//! 2. Acquire a delivery token
//! 3. Send the delivery
//!
//! A failed or unanswered step moves the saga to `Faulted`.

pub mod error;
pub mod events;
pub mod machine;
pub mod newsletter;
pub mod router;
pub mod state;

pub use error::SagaError;
pub use events::{ActionRequest, EventEnvelope, EventKind, OutgoingCommand};
pub use machine::{
    ActionSpec, MachineEvent, MachineState, NoOpReason, Outcome, StateMachine, Transition,
};
pub use newsletter::NewsletterMachine;
pub use router::{CorrelationRouter, correlation_id, decode_envelope};
pub use state::NewsletterState;
