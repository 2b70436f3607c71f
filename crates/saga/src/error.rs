//! Saga error types.

use common::{OrderId, SagaId, Sku};
use inventory::InventoryError;
use inventory_store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One line item that could not be covered by available stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub sku: Sku,
    pub requested: i64,
    pub available: i64,
}

impl std::fmt::Display for Shortfall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (requested {}, available {})",
            self.sku, self.requested, self.available
        )
    }
}

/// Errors that can occur during saga execution.
#[derive(Debug, Error)]
pub enum SagaError {
    /// One or more line items cannot be covered.
    #[error("Insufficient stock: {}", list(.0))]
    InsufficientStock(Vec<Shortfall>),

    /// A saga step kept timing out until its attempts ran out.
    #[error("Step {step} timed out after {attempts} attempts")]
    StepTimeout { step: &'static str, attempts: u32 },

    /// The order was cancelled while its reservation saga was running.
    #[error("Order {0} was cancelled")]
    OrderCancelled(OrderId),

    /// The order request itself is unusable.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// The worker pool has been shut down.
    #[error("Saga worker pool closed")]
    PoolClosed,

    /// An inventory operation failed.
    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    /// A store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SagaError {
    /// Returns true if re-running the failed call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaError::Inventory(e) => e.is_retryable(),
            SagaError::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// The itemized shortfall, if this is a stock rejection.
    pub fn shortfalls(&self) -> &[Shortfall] {
        match self {
            SagaError::InsufficientStock(shortfalls) => shortfalls,
            _ => &[],
        }
    }
}

fn list(shortfalls: &[Shortfall]) -> String {
    shortfalls
        .iter()
        .map(Shortfall::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_stock_lists_every_item() {
        let err = SagaError::InsufficientStock(vec![
            Shortfall {
                sku: Sku::new("SKU-1"),
                requested: 3,
                available: 1,
            },
            Shortfall {
                sku: Sku::new("SKU-2"),
                requested: 1,
                available: 0,
            },
        ]);
        assert_eq!(
            err.to_string(),
            "Insufficient stock: SKU-1 (requested 3, available 1), SKU-2 (requested 1, available 0)"
        );
        assert_eq!(err.shortfalls().len(), 2);
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_store_errors_are_retryable() {
        let err = SagaError::from(StoreError::Unavailable("down".into()));
        assert!(err.is_retryable());
        let err = SagaError::from(InventoryError::Store(StoreError::Unavailable("down".into())));
        assert!(err.is_retryable());
    }

    #[test]
    fn timeouts_are_not_retried_again() {
        let err = SagaError::StepTimeout {
            step: "RESERVING_INVENTORY",
            attempts: 3,
        };
        assert!(!err.is_retryable());
    }
}
