//! Saga inspection.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::OrderId;
use inventory_store::{InventoryStore, SagaRecord};

use crate::AppState;
use crate::error::ApiError;

/// GET /orders/{order_id}/sagas — every saga run for an order.
#[tracing::instrument(skip(state))]
pub async fn for_order<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(order_id): Path<String>,
) -> Result<Json<Vec<SagaRecord>>, ApiError> {
    let order_id = OrderId::new(order_id);
    let sagas = state.orchestrator.sagas_for_order(&order_id).await?;
    if sagas.is_empty() {
        return Err(ApiError::NotFound(format!("No sagas for order {order_id}")));
    }
    Ok(Json(sagas))
}
