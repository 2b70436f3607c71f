//! Stock level queries, receipts and manual adjustments.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{Sku, WarehouseId};
use inventory::Adjustment;
use inventory_store::{InventoryStore, StockItem, StockLevel};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct ReceiptRequest {
    pub quantity: i64,
    /// Supplier document the receipt is booked against. Replaying it is a no-op.
    pub reference_id: String,
    #[serde(default)]
    pub warehouse_id: Option<String>,
}

#[derive(Deserialize)]
pub struct AdjustmentRequest {
    pub available: i64,
    pub reason: String,
}

/// GET /stock/{sku} — current available, reserved and incoming quantities.
#[tracing::instrument(skip(state))]
pub async fn get<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(sku): Path<String>,
) -> Result<Json<StockLevel>, ApiError> {
    let level = state
        .manager
        .ledger()
        .get_stock_level(&Sku::new(sku))
        .await?;
    Ok(Json(level))
}

/// POST /stock/{sku}/receipts — books received stock.
#[tracing::instrument(skip(state, req))]
pub async fn receive<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(sku): Path<String>,
    Json(req): Json<ReceiptRequest>,
) -> Result<(StatusCode, Json<StockItem>), ApiError> {
    if req.reference_id.trim().is_empty() {
        return Err(ApiError::BadRequest("reference_id is required".into()));
    }
    let warehouse_id = req
        .warehouse_id
        .map(WarehouseId::new)
        .unwrap_or_else(WarehouseId::default_warehouse);
    let item = state
        .manager
        .ledger()
        .receive(&Sku::new(sku), warehouse_id, req.quantity, &req.reference_id)
        .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// PUT /stock/{sku}/adjustment — overwrites available with a counted value.
#[tracing::instrument(skip(state, req))]
pub async fn adjust<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(sku): Path<String>,
    Json(req): Json<AdjustmentRequest>,
) -> Result<Json<Adjustment>, ApiError> {
    if req.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("reason is required".into()));
    }
    let adjustment = state
        .manager
        .ledger()
        .adjust(&Sku::new(sku), req.available, &req.reason)
        .await?;
    Ok(Json(adjustment))
}
