//! Saga orchestrator service for newsletter releases.
//!
//! Consumes saga envelopes from the transport, partitions them by
//! correlation id, applies them to persisted saga instances under retry,
//! and publishes the resulting commands through a transactional outbox.
//! A small admin HTTP surface exposes health, Prometheus metrics and saga
//! status.

pub mod action;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fault;
pub mod outbox;
pub mod processor;
pub mod retry;
pub mod routes;
pub mod service;
pub mod watchdog;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga_store::SagaStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, LogFormat};
pub use error::{ApiError, OrchestratorError};
pub use service::Orchestrator;

use routes::sagas::AppState;

/// Creates the admin router.
pub fn create_app<St: SagaStore + 'static>(
    state: Arc<AppState<St>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/sagas", post(routes::sagas::release::<St>))
        .route("/sagas/{id}", get(routes::sagas::get::<St>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
