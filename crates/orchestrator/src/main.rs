//! Orchestrator entry point.

use std::process::ExitCode;
use std::sync::Arc;

use orchestrator::action::SimulatedActionInvoker;
use orchestrator::routes::sagas::AppState;
use orchestrator::{Config, LogFormat, Orchestrator, OrchestratorError};
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use transport::{InMemoryTransport, Transport};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Runs the admin server and the orchestrator until shutdown or a fatal error.
async fn serve<St: SagaStore + Clone + 'static>(
    config: Config,
    store: St,
    transport: Arc<dyn Transport>,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
) -> Result<(), OrchestratorError> {
    let (signal_tx, signal_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    });

    let state = Arc::new(AppState {
        store: store.clone(),
        transport: transport.clone(),
        saga_queue: config.saga_queue.clone(),
    });
    let app = orchestrator::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting admin server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    let (http_stop_tx, http_stop_rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(stopped(http_stop_rx))
            .await
    });

    let result = Orchestrator::new(config, store, transport)
        .with_action_invoker(Arc::new(SimulatedActionInvoker::new()))
        .run(stopped(signal_rx))
        .await;

    let _ = http_stop_tx.send(true);
    match server.await {
        Ok(Ok(())) => tracing::info!("admin server shut down gracefully"),
        Ok(Err(e)) => tracing::error!(error = %e, "admin server error"),
        Err(e) => tracing::error!(error = %e, "admin server task failed"),
    }

    result
}

#[tokio::main]
async fn main() -> ExitCode {
    // 1. Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // 2. Initialize tracing
    init_tracing(&config);

    // 3. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 4. Build transport and store, then run
    let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
    let result = match config.database_url.clone() {
        Some(url) => {
            let pool = match PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(&url)
                .await
            {
                Ok(pool) => pool,
                Err(e) => {
                    tracing::error!(error = %e, "failed to connect to database");
                    return ExitCode::FAILURE;
                }
            };
            let store = PostgresSagaStore::new(pool);
            if let Err(e) = store.run_migrations().await {
                tracing::error!(error = %e, "failed to run migrations");
                return ExitCode::FAILURE;
            }
            serve(config, store, transport, metrics_handle).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, saga state is kept in memory");
            serve(config, InMemorySagaStore::new(), transport, metrics_handle).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "orchestrator failed");
            ExitCode::FAILURE
        }
    }
}
