//! Newsletter saga states.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The state of a newsletter saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Initial ──► FetchingContent ──► FetchingOAuthToken ──► SendingDelivery ──► Concluded
///                    │                    │                     │
///                    └────────────────────┴─────────────────────┴──► Faulted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NewsletterState {
    /// Saga row exists but no release has been accepted yet.
    #[default]
    Initial,

    /// Waiting for the generated content.
    FetchingContent,

    /// Waiting for the delivery credential.
    FetchingOAuthToken,

    /// Waiting for the delivery confirmation.
    SendingDelivery,

    /// Delivery finished (terminal state).
    Concluded,

    /// A step failed or never answered (terminal state).
    Faulted,
}

impl NewsletterState {
    /// All states, in workflow order.
    pub const ALL: [NewsletterState; 6] = [
        NewsletterState::Initial,
        NewsletterState::FetchingContent,
        NewsletterState::FetchingOAuthToken,
        NewsletterState::SendingDelivery,
        NewsletterState::Concluded,
        NewsletterState::Faulted,
    ];

    /// States in which an external step is outstanding.
    pub const WORKING: [NewsletterState; 3] = [
        NewsletterState::FetchingContent,
        NewsletterState::FetchingOAuthToken,
        NewsletterState::SendingDelivery,
    ];

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NewsletterState::Concluded | NewsletterState::Faulted)
    }

    /// Returns the state name as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            NewsletterState::Initial => "Initial",
            NewsletterState::FetchingContent => "FetchingContent",
            NewsletterState::FetchingOAuthToken => "FetchingOAuthToken",
            NewsletterState::SendingDelivery => "SendingDelivery",
            NewsletterState::Concluded => "Concluded",
            NewsletterState::Faulted => "Faulted",
        }
    }
}

impl std::fmt::Display for NewsletterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when a persisted state name is not a known state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownState(pub String);

impl std::fmt::Display for UnknownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown state '{}'", self.0)
    }
}

impl std::error::Error for UnknownState {}

impl FromStr for NewsletterState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NewsletterState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}
