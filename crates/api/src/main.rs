//! API server entry point.

use std::sync::Arc;

use api::AppState;
use api::config::Config;
use inventory::{Clock, ExpirationReconciler, SystemClock};
use inventory_store::{InMemoryInventoryStore, InventoryStore, PostgresInventoryStore};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::postgres::PgPoolOptions;
use sync::{LoggingPublisher, OutboxRelay};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

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

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
    config.log_ignored();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the store
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.saga_workers as u32 + 4)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresInventoryStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL inventory store");
            serve(store, config, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory inventory store");
            serve(InMemoryInventoryStore::new(), config, metrics_handle).await;
        }
    }
}

async fn serve<S: InventoryStore>(store: S, config: Config, metrics_handle: PrometheusHandle) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = Arc::new(AppState::new(store.clone(), clock.clone(), &config));

    // 4. Resume sagas interrupted by the previous shutdown, before taking new work
    match state.orchestrator.recover().await {
        Ok(report) => tracing::info!(
            resumed = report.resumed,
            flagged = report.flagged,
            failed = report.failed,
            "saga recovery complete"
        ),
        Err(e) => tracing::error!(error = %e, "saga recovery failed"),
    }

    // 5. Start background workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = Arc::new(ExpirationReconciler::new(
        state.manager.clone(),
        clock.clone(),
        config.reconciler_settings(),
    ));
    let relay = Arc::new(OutboxRelay::new(
        store,
        LoggingPublisher,
        clock,
        config.relay_settings(),
    ));
    let workers = vec![
        tokio::spawn(reconciler.run(shutdown_rx.clone())),
        tokio::spawn(
            state
                .orchestrator
                .clone()
                .run_release_retries(config.release_retry_interval(), shutdown_rx.clone()),
        ),
        tokio::spawn(relay.run(shutdown_rx)),
    ];

    // 6. Start server
    let app = api::create_app(state.clone(), metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Stop background workers; sagas spawned after this fail with PoolClosed
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "background worker panicked");
        }
    }
    state.orchestrator.pool().close();

    tracing::info!("server shut down gracefully");
}
