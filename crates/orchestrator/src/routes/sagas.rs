//! Saga release and status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::CorrelationId;
use saga::{EventEnvelope, EventKind};
use saga_store::{SagaStore, SagaStoreExt};
use serde::{Deserialize, Serialize};
use transport::Transport;

use crate::error::ApiError;

/// Shared state for the saga endpoints.
pub struct AppState<St> {
    pub store: St,
    pub transport: Arc<dyn Transport>,
    pub saga_queue: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub correlation_id: Option<CorrelationId>,
    pub payload: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseAccepted {
    pub correlation_id: CorrelationId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaStatusResponse {
    pub correlation_id: CorrelationId,
    pub current_state: String,
    pub previous_state: String,
    pub version: i64,
    pub payload: Option<serde_json::Value>,
}

/// POST /sagas: publishes `ReleaseIn` for a new or given saga.
///
/// The body is optional; the saga itself is created when the envelope is
/// consumed, so the response only acknowledges the publish.
#[tracing::instrument(skip(state, body))]
pub async fn release<St: SagaStore + 'static>(
    State(state): State<Arc<AppState<St>>>,
    body: Bytes,
) -> Result<(StatusCode, Json<ReleaseAccepted>), ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ReleaseRequest::default()
    } else {
        serde_json::from_slice::<ReleaseRequest>(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid release request: {e}")))?
    };

    let correlation_id = request.correlation_id.unwrap_or_default();
    let mut envelope = EventEnvelope::new(correlation_id, EventKind::ReleaseIn);
    if let Some(payload) = request.payload {
        envelope = envelope.with_payload(payload);
    }

    let message = envelope
        .to_message()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    state.transport.publish(&state.saga_queue, message).await?;

    tracing::info!(%correlation_id, "release requested");
    Ok((StatusCode::ACCEPTED, Json(ReleaseAccepted { correlation_id })))
}

/// GET /sagas/{id}: returns the persisted saga instance.
#[tracing::instrument(skip(state))]
pub async fn get<St: SagaStore + 'static>(
    State(state): State<Arc<AppState<St>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatusResponse>, ApiError> {
    let correlation_id: CorrelationId = id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))?;

    let instance = state
        .store
        .find(correlation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {correlation_id} not found")))?;

    Ok(Json(SagaStatusResponse {
        correlation_id: instance.correlation_id,
        current_state: instance.current_state,
        previous_state: instance.previous_state,
        version: instance.version.as_i64(),
        payload: instance.payload,
    }))
}
