//! Direct reservation operations.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{CustomerId, OrderId, ReservationId, Sku};
use inventory::{CANCELLED_REASON, ReserveRequest};
use inventory_store::{InventoryStore, Reservation};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct CreateReservationRequest {
    pub order_id: String,
    pub sku: String,
    pub quantity: i64,
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Overrides the default hold duration.
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /reservations — holds stock for one order line.
#[tracing::instrument(skip(state, req))]
pub async fn create<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateReservationRequest>,
) -> Result<(StatusCode, Json<Reservation>), ApiError> {
    let mut request = ReserveRequest::new(
        OrderId::new(req.order_id),
        Sku::new(req.sku),
        req.quantity,
    );
    if let Some(customer_id) = req.customer_id {
        request = request.customer(CustomerId::new(customer_id));
    }
    if let Some(ttl_secs) = req.ttl_secs {
        let ttl = chrono::Duration::try_seconds(ttl_secs)
            .filter(|ttl| *ttl > chrono::Duration::zero())
            .ok_or_else(|| {
                ApiError::BadRequest(format!("ttl_secs must be a positive duration, got {ttl_secs}"))
            })?;
        request = request.ttl(ttl);
    }

    let reservation = state.manager.reserve(request).await?;
    // The hold is committed; a lost event is not worth failing the request over.
    if let Err(e) = state.manager.publish_reserved(&reservation).await {
        tracing::warn!(reservation_id = %reservation.id, error = %e, "failed to record InventoryReserved");
    }
    Ok((StatusCode::CREATED, Json(reservation)))
}

/// GET /reservations/{id}
#[tracing::instrument(skip(state))]
pub async fn get<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Reservation>, ApiError> {
    let reservation = state.manager.get(parse_reservation_id(&id)?).await?;
    Ok(Json(reservation))
}

/// POST /reservations/{id}/confirm — consumes the held stock.
#[tracing::instrument(skip(state))]
pub async fn confirm<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Reservation>, ApiError> {
    let reservation = state.manager.confirm(parse_reservation_id(&id)?).await?;
    Ok(Json(reservation))
}

/// POST /reservations/{id}/cancel — releases the held stock.
#[tracing::instrument(skip(state, req))]
pub async fn cancel<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    req: Option<Json<CancelRequest>>,
) -> Result<Json<Reservation>, ApiError> {
    let Json(req) = req.unwrap_or_default();
    let reason = req.reason.as_deref().unwrap_or(CANCELLED_REASON);
    let reservation = state
        .manager
        .cancel(parse_reservation_id(&id)?, reason)
        .await?;
    Ok(Json(reservation))
}

fn parse_reservation_id(id: &str) -> Result<ReservationId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid reservation id: {e}")))
}
