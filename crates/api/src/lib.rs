//! HTTP API server for the inventory reservation engine.
//!
//! Exposes stock queries and adjustments, direct reservation operations,
//! inbound event ingestion and saga inspection, with structured logging
//! (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use inventory::{Clock, ReservationManager};
use inventory_store::InventoryStore;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{SagaOrchestrator, SagaWorkerPool};
use sync::{EventSynchronizer, ProductCacheView};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState<S> {
    pub manager: ReservationManager<S>,
    pub orchestrator: SagaOrchestrator<S>,
    pub synchronizer: EventSynchronizer<S>,
    pub clock: Arc<dyn Clock>,
}

impl<S: InventoryStore> AppState<S> {
    /// Wires the engine components over one store.
    pub fn new(store: S, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let manager = ReservationManager::new(store, clock.clone(), config.reservation_policy());
        let orchestrator = SagaOrchestrator::new(
            manager.clone(),
            clock.clone(),
            SagaWorkerPool::new(config.saga_workers),
            config.saga_settings(),
        );
        let synchronizer =
            EventSynchronizer::new(orchestrator.clone(), ProductCacheView::new(), clock.clone());
        Self {
            manager,
            orchestrator,
            synchronizer,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        self.manager.ledger().store()
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: InventoryStore>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/stock/{sku}", get(routes::stock::get::<S>))
        .route("/stock/{sku}/receipts", post(routes::stock::receive::<S>))
        .route("/stock/{sku}/adjustment", put(routes::stock::adjust::<S>))
        .route("/reservations", post(routes::reservations::create::<S>))
        .route("/reservations/{id}", get(routes::reservations::get::<S>))
        .route(
            "/reservations/{id}/confirm",
            post(routes::reservations::confirm::<S>),
        )
        .route(
            "/reservations/{id}/cancel",
            post(routes::reservations::cancel::<S>),
        )
        .route("/events", post(routes::events::ingest::<S>))
        .route("/orders/{order_id}/sagas", get(routes::sagas::for_order::<S>))
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
