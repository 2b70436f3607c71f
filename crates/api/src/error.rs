//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use inventory::InventoryError;
use inventory_store::StoreError;
use saga::SagaError;
use sync::SyncError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Stock or reservation rule violation.
    Inventory(InventoryError),
    /// Saga execution error.
    Saga(SagaError),
    /// Inbound event handling failed; the sender should redeliver.
    Sync(SyncError),
    /// Internal server error.
    Internal(String),
}

impl ApiError {
    fn status_and_message(self) -> (StatusCode, String) {
        match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Inventory(err) => (inventory_status(&err), err.to_string()),
            ApiError::Saga(err) => (saga_status(&err), err.to_string()),
            ApiError::Sync(err) => (sync_status(&err), err.to_string()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        if status.is_server_error() {
            tracing::error!(error = %message, %status, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn inventory_status(err: &InventoryError) -> StatusCode {
    match err {
        InventoryError::InsufficientStock { .. }
        | InventoryError::InvalidReservationState { .. }
        | InventoryError::ItemNotActive { .. }
        | InventoryError::HoldReleased { .. } => StatusCode::CONFLICT,
        InventoryError::StockItemNotFound(_) | InventoryError::ReservationNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        InventoryError::InvalidQuantity(_) | InventoryError::InvalidTtl(_) => {
            StatusCode::BAD_REQUEST
        }
        InventoryError::Store(store) => store_status(store),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn saga_status(err: &SagaError) -> StatusCode {
    match err {
        SagaError::InsufficientStock(_) => StatusCode::CONFLICT,
        SagaError::InvalidOrder(_) => StatusCode::BAD_REQUEST,
        SagaError::SagaNotFound(_) => StatusCode::NOT_FOUND,
        SagaError::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
        SagaError::Inventory(inner) => inventory_status(inner),
        SagaError::Store(inner) => store_status(inner),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn sync_status(err: &SyncError) -> StatusCode {
    if err.is_retryable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::BAD_REQUEST
    }
}

impl From<InventoryError> for ApiError {
    fn from(err: InventoryError) -> Self {
        ApiError::Inventory(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::Sync(err)
    }
}
