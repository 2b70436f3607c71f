//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use inventory_store::InventoryStore;
use serde::Serialize;
use sync::ReadModel;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub saga_workers: usize,
    pub saga_workers_available: usize,
    pub cached_products: usize,
}

/// GET /health — returns process health and saga pool headroom.
pub async fn check<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    let pool = state.orchestrator.pool();
    Json(HealthResponse {
        status: "ok",
        saga_workers: pool.size(),
        saga_workers_available: pool.available(),
        cached_products: state.synchronizer.products().count(),
    })
}
