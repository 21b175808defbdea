//! Generic table-driven state machine.
//!
//! A machine is declared once through [`StateMachineBuilder`], validated, and
//! never changes afterwards. Applying an event to a saga instance is a pure
//! function: it either yields the advanced instance plus the commands to
//! dispatch, or a no-op with the reason the event was dropped.

use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::str::FromStr;

use common::Version;
use saga_store::SagaInstance;

use crate::error::{Result, SagaError};
use crate::events::{ActionRequest, EventEnvelope, OutgoingCommand, merge_payload};

/// A state type usable by [`StateMachine`].
///
/// States are persisted by their `Display` form and read back with `FromStr`.
pub trait MachineState:
    Copy + Eq + Hash + Debug + Display + FromStr + Send + Sync + 'static
{
}

impl<T> MachineState for T where
    T: Copy + Eq + Hash + Debug + Display + FromStr + Send + Sync + 'static
{
}

/// An event kind type usable by [`StateMachine`].
pub trait MachineEvent: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static {}

impl<T> MachineEvent for T where T: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static {}

/// An action dispatched when a transition fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    pub action: String,
    pub destination: String,
}

impl ActionSpec {
    pub fn new(action: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Clone)]
enum Reaction<S> {
    Transition { to: S, actions: Vec<ActionSpec> },
    Ignore,
}

/// Why an event left the saga untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// The current state declares nothing for this event kind.
    Undeclared,
    /// The current state explicitly ignores this event kind.
    Ignored,
    /// The envelope was produced against an older or newer saga version.
    Stale { expected: Version, received: Version },
}

impl NoOpReason {
    /// Short label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            NoOpReason::Undeclared => "undeclared",
            NoOpReason::Ignored => "ignored",
            NoOpReason::Stale { .. } => "stale",
        }
    }
}

/// An accepted transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
    /// The instance as it must be persisted.
    pub instance: SagaInstance,
    /// Commands to stage alongside the instance.
    pub commands: Vec<OutgoingCommand>,
}

/// Result of applying an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<S> {
    Transitioned(Transition<S>),
    NoOp(NoOpReason),
}

impl<S> Outcome<S> {
    /// Returns true if the event changed the saga.
    pub fn is_transition(&self) -> bool {
        matches!(self, Outcome::Transitioned(_))
    }
}

/// Immutable transition table over states `S` and event kinds `K`.
#[derive(Debug, Clone)]
pub struct StateMachine<S, K> {
    name: String,
    initial: S,
    start_event: K,
    terminal: HashSet<S>,
    table: HashMap<(S, K), Reaction<S>>,
}

impl<S: MachineState, K: MachineEvent> StateMachine<S, K> {
    /// Starts declaring a machine.
    pub fn builder(name: impl Into<String>, initial: S, start_event: K) -> StateMachineBuilder<S, K> {
        StateMachineBuilder {
            name: name.into(),
            initial,
            start_event,
            terminal: HashSet::new(),
            table: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> S {
        self.initial
    }

    /// The event kind that creates saga instances.
    pub fn start_event(&self) -> K {
        self.start_event
    }

    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    /// Non-terminal states entered by a transition that dispatches actions,
    /// in name order. A saga in one of these states awaits a step result.
    pub fn awaiting_states(&self) -> Vec<S> {
        let mut states: Vec<S> = self
            .table
            .values()
            .filter_map(|reaction| match reaction {
                Reaction::Transition { to, actions }
                    if !actions.is_empty() && !self.is_terminal(*to) =>
                {
                    Some(*to)
                }
                _ => None,
            })
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        states.sort_by_key(|state| state.to_string());
        states
    }

    /// Actions dispatched by the transitions into `state`, deduplicated.
    pub fn actions_entering(&self, state: S) -> Vec<ActionSpec> {
        let mut actions: Vec<ActionSpec> = Vec::new();
        for reaction in self.table.values() {
            if let Reaction::Transition { to, actions: specs } = reaction
                && *to == state
            {
                for spec in specs {
                    if !actions.contains(spec) {
                        actions.push(spec.clone());
                    }
                }
            }
        }
        actions.sort_by(|a, b| a.action.cmp(&b.action));
        actions
    }

    /// Parses the current state of a persisted instance.
    pub fn state_of(&self, instance: &SagaInstance) -> Result<S> {
        instance
            .current_state
            .parse()
            .map_err(|_| SagaError::CorruptState {
                correlation_id: instance.correlation_id,
                state: instance.current_state.clone(),
            })
    }

    /// Applies an event to an instance.
    ///
    /// Never mutates `instance`; an accepted transition returns the successor
    /// at `instance.version + 1`.
    pub fn apply(&self, instance: &SagaInstance, envelope: &EventEnvelope<K>) -> Result<Outcome<S>> {
        if envelope.correlation_id != instance.correlation_id {
            return Err(SagaError::CorruptEnvelope(format!(
                "envelope for {} applied to saga {}",
                envelope.correlation_id, instance.correlation_id
            )));
        }

        let from = self.state_of(instance)?;
        let (to, actions) = match self.table.get(&(from, envelope.event_kind)) {
            None => return Ok(Outcome::NoOp(NoOpReason::Undeclared)),
            Some(Reaction::Ignore) => return Ok(Outcome::NoOp(NoOpReason::Ignored)),
            Some(Reaction::Transition { to, actions }) => (*to, actions),
        };

        if let Some(received) = envelope.version
            && received != instance.version
        {
            return Ok(Outcome::NoOp(NoOpReason::Stale {
                expected: instance.version,
                received,
            }));
        }

        let next = SagaInstance {
            correlation_id: instance.correlation_id,
            current_state: to.to_string(),
            previous_state: from.to_string(),
            version: instance.version.next(),
            payload: merge_payload(instance.payload.as_ref(), envelope.payload.as_ref()),
        };

        let commands = actions
            .iter()
            .map(|spec| OutgoingCommand {
                destination: spec.destination.clone(),
                correlation_id: next.correlation_id,
                previous_state: next.previous_state.clone(),
                current_state: next.current_state.clone(),
                version: next.version,
                request: ActionRequest {
                    action: spec.action.clone(),
                    data: next.payload.clone(),
                    correlation_id: next.correlation_id,
                },
            })
            .collect();

        Ok(Outcome::Transitioned(Transition {
            from,
            to,
            instance: next,
            commands,
        }))
    }
}

/// Builder for [`StateMachine`].
///
/// Declaration mistakes are collected and reported together by [`build`].
///
/// [`build`]: StateMachineBuilder::build
#[derive(Debug)]
pub struct StateMachineBuilder<S, K> {
    name: String,
    initial: S,
    start_event: K,
    terminal: HashSet<S>,
    table: HashMap<(S, K), Reaction<S>>,
    errors: Vec<String>,
}

impl<S: MachineState, K: MachineEvent> StateMachineBuilder<S, K> {
    /// Marks a state as terminal; it may only ignore events.
    pub fn terminal(mut self, state: S) -> Self {
        self.terminal.insert(state);
        self
    }

    /// Declares a transition that dispatches nothing.
    pub fn transition(self, from: S, on: K, to: S) -> Self {
        self.transition_dispatching(from, on, to, Vec::<ActionSpec>::new())
    }

    /// Declares a transition that dispatches one command per action.
    pub fn transition_dispatching(
        mut self,
        from: S,
        on: K,
        to: S,
        actions: impl IntoIterator<Item = ActionSpec>,
    ) -> Self {
        let actions = actions.into_iter().collect();
        self.declare(from, on, Reaction::Transition { to, actions });
        self
    }

    /// Declares that `state` drops `on` silently.
    pub fn ignore(mut self, state: S, on: K) -> Self {
        self.declare(state, on, Reaction::Ignore);
        self
    }

    fn declare(&mut self, from: S, on: K, reaction: Reaction<S>) {
        if self.table.insert((from, on), reaction).is_some() {
            self.errors
                .push(format!("more than one rule for ({from}, {on})"));
        }
    }

    /// Validates the table and freezes it.
    pub fn build(mut self) -> Result<StateMachine<S, K>> {
        if self.terminal.contains(&self.initial) {
            self.errors
                .push(format!("initial state {} is terminal", self.initial));
        }

        match self.table.get(&(self.initial, self.start_event)) {
            Some(Reaction::Transition { to, .. }) if *to != self.initial => {}
            _ => self.errors.push(format!(
                "start event {} must leave initial state {}",
                self.start_event, self.initial
            )),
        }

        let mut terminal_exits: Vec<String> = self
            .table
            .iter()
            .filter(|((from, _), reaction)| {
                self.terminal.contains(from) && matches!(reaction, Reaction::Transition { .. })
            })
            .map(|((from, on), _)| format!("terminal state {from} has a transition on {on}"))
            .collect();
        terminal_exits.sort();
        self.errors.extend(terminal_exits);

        if !self.errors.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "{}: {}",
                self.name,
                self.errors.join("; ")
            )));
        }

        Ok(StateMachine {
            name: self.name,
            initial: self.initial,
            start_event: self.start_event,
            terminal: self.terminal,
            table: self.table,
        })
    }
}
