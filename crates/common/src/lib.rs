//! Shared types for the inventory reservation engine.

pub mod types;

pub use types::{CustomerId, EventId, OrderId, ReservationId, SagaId, Sku, WarehouseId};
