use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationId, Version};

/// Longest state name the row schema accepts.
pub const MAX_STATE_NAME_LEN: usize = 64;

/// The persisted record of one workflow run.
///
/// State names are stored as plain strings so the store stays independent of
/// any particular state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaInstance {
    pub correlation_id: CorrelationId,
    pub current_state: String,
    /// Empty until the first transition.
    pub previous_state: String,
    pub version: Version,
    pub payload: Option<serde_json::Value>,
}

impl SagaInstance {
    /// Creates a fresh instance sitting in `initial_state` at version 0.
    pub fn new(correlation_id: CorrelationId, initial_state: impl Into<String>) -> Self {
        Self {
            correlation_id,
            current_state: initial_state.into(),
            previous_state: String::new(),
            version: Version::initial(),
            payload: None,
        }
    }

    /// Returns true if no transition has been committed yet.
    pub fn is_new(&self) -> bool {
        self.version == Version::initial()
    }
}

/// A stored instance together with the time it was last written.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSaga {
    pub instance: SagaInstance,
    pub updated_at: DateTime<Utc>,
}
