//! Event synchronization between the inventory engine and its neighbours.
//!
//! Inbound, [`EventSynchronizer`] decodes order and catalog events, drops
//! redeliveries by event id and routes the rest to the saga orchestrator or
//! the [`ProductCacheView`]. Outbound, [`OutboxRelay`] drains the outbox to an
//! [`EventPublisher`] with at-least-once delivery, ordered by sequence within
//! each partition key.

pub mod error;
pub mod inbound;
pub mod product_cache;
pub mod publisher;
pub mod read_model;
pub mod relay;
pub mod synchronizer;

pub use error::{Result, SyncError};
pub use inbound::{
    InboundEvent, ORDER_CANCELLED, ORDER_CREATED, OrderCancelledData, OrderCreatedData,
    PRODUCT_CHANGED, ProductChangedData,
};
pub use product_cache::{CachedProduct, ProductCacheView};
pub use publisher::{EventPublisher, InMemoryPublisher, LoggingPublisher};
pub use read_model::ReadModel;
pub use relay::{OutboxRelay, RelayReport, RelaySettings};
pub use synchronizer::{Disposition, EventSynchronizer};
