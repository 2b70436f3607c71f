//! Persistence for the inventory reservation engine.
//!
//! Every table the engine owns is reached through one of the storage traits in
//! [`store`]. Quantity mutations go through [`StockStore::apply_change`], a
//! conditional update that appends the matching movement in the same atomic step.

pub mod envelope;
pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod query;
pub mod saga;
pub mod store;

pub use common::{CustomerId, EventId, OrderId, ReservationId, SagaId, Sku, WarehouseId};
pub use envelope::{EventEnvelope, EventEnvelopeBuilder, OutboxMessage, OutboxStatus};
pub use error::{Result, StoreError};
pub use memory::InMemoryInventoryStore;
pub use model::{
    LedgerUpdate, MovementType, Reservation, ReservationStatus, StockChange, StockItem,
    StockLevel, StockMovement, StockStatus, Thresholds,
};
pub use postgres::PostgresInventoryStore;
pub use query::MovementQuery;
pub use saga::{LineItem, SagaRecord, SagaStatus, Version};
pub use store::{
    InboxStore, InventoryStore, OutboxStore, ReservationStore, SagaStore, StockStore,
};
