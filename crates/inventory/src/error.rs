//! Inventory error types.

use common::{ReservationId, Sku};
use inventory_store::{ReservationStatus, StockStatus, StoreError};
use thiserror::Error;

/// Errors that can occur during stock and reservation operations.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// Not enough available stock to satisfy the request.
    #[error("Insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        sku: Sku,
        requested: i64,
        available: i64,
    },

    /// The item does not accept new reservations.
    #[error("Stock item {sku} is {status}")]
    ItemNotActive { sku: Sku, status: StockStatus },

    #[error("Stock item not found: {0}")]
    StockItemNotFound(Sku),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// The requested transition is not allowed from the reservation's current state.
    #[error("Cannot {operation} reservation {id} in state {status}")]
    InvalidReservationState {
        id: ReservationId,
        status: ReservationStatus,
        operation: &'static str,
    },

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(i64),

    /// The hold duration is not positive or pushes the expiry out of range.
    #[error("Invalid reservation TTL: {0} seconds")]
    InvalidTtl(i64),

    /// The hold booked under this reference was already released; the
    /// reference cannot hold stock again.
    #[error("Hold {reference_id} on {sku} was already released")]
    HoldReleased { sku: Sku, reference_id: String },

    /// Stored quantities disagree with what an operation expects. Never retried.
    #[error("Ledger inconsistency for {sku}: {detail}")]
    LedgerInconsistency { sku: Sku, detail: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl InventoryError {
    /// Returns true if the same call may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            InventoryError::Store(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns true for rejections the caller must surface, not retry.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            InventoryError::InsufficientStock { .. }
                | InventoryError::ItemNotActive { .. }
                | InventoryError::InvalidReservationState { .. }
                | InventoryError::InvalidQuantity(_)
                | InventoryError::InvalidTtl(_)
                | InventoryError::HoldReleased { .. }
        )
    }
}

/// Result type for inventory operations.
pub type Result<T> = std::result::Result<T, InventoryError>;
