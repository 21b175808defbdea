//! Newsletter release saga: content, credential, delivery.

use crate::error::Result;
use crate::events::EventKind;
use crate::machine::{ActionSpec, StateMachine};
use crate::state::NewsletterState;

/// The saga type identifier for newsletter releases.
pub const SAGA_TYPE: &str = "Newsletter";

/// Action: produce the newsletter content.
pub const GENERATE_CONTENT: &str = "GENERATE_CONTENT";

/// Action: obtain a credential for the delivery provider.
pub const ACQUIRE_TOKEN: &str = "ACQUIRE_TOKEN";

/// Action: hand the newsletter to the delivery provider.
pub const SEND_DELIVERY: &str = "SEND_DELIVERY";

pub const CONTENT_GENERATOR: &str = "content-generator";
pub const OAUTH_TOKEN_ISSUER: &str = "oauth-token-issuer";
pub const DELIVERY_SENDER: &str = "delivery-sender";

/// Every destination the newsletter saga sends commands to.
pub const DESTINATIONS: [&str; 3] = [CONTENT_GENERATOR, OAUTH_TOKEN_ISSUER, DELIVERY_SENDER];

pub type NewsletterMachine = StateMachine<NewsletterState, EventKind>;

/// Builds the newsletter transition table.
pub fn state_machine() -> Result<NewsletterMachine> {
    use NewsletterState::{FetchingContent, FetchingOAuthToken, Initial, SendingDelivery};

    let mut builder = StateMachine::builder(SAGA_TYPE, Initial, EventKind::ReleaseIn)
        .terminal(NewsletterState::Concluded)
        .terminal(NewsletterState::Faulted)
        .transition_dispatching(
            Initial,
            EventKind::ReleaseIn,
            FetchingContent,
            [ActionSpec::new(GENERATE_CONTENT, CONTENT_GENERATOR)],
        )
        .transition_dispatching(
            FetchingContent,
            EventKind::ContentFetched,
            FetchingOAuthToken,
            [ActionSpec::new(ACQUIRE_TOKEN, OAUTH_TOKEN_ISSUER)],
        )
        .transition_dispatching(
            FetchingOAuthToken,
            EventKind::TokenAcquired,
            SendingDelivery,
            [ActionSpec::new(SEND_DELIVERY, DELIVERY_SENDER)],
        )
        .transition(
            SendingDelivery,
            EventKind::Concluded,
            NewsletterState::Concluded,
        );

    for state in NewsletterState::WORKING {
        builder = builder
            .transition(state, EventKind::StepFailed, NewsletterState::Faulted)
            .transition(state, EventKind::StepTimedOut, NewsletterState::Faulted);
    }

    // Re-releasing a running or finished newsletter never restarts it
    for state in NewsletterState::ALL {
        if state != Initial {
            builder = builder.ignore(state, EventKind::ReleaseIn);
        }
    }

    builder.build()
}

/// Maps an action to the event its successful result is reported as.
pub fn result_event(action: &str) -> Option<EventKind> {
    match action {
        GENERATE_CONTENT => Some(EventKind::ContentFetched),
        ACQUIRE_TOKEN => Some(EventKind::TokenAcquired),
        SEND_DELIVERY => Some(EventKind::Concluded),
        _ => None,
    }
}
