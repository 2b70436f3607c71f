use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{EventId, OrderId, ReservationId, SagaId, Sku};

use crate::envelope::{EventEnvelope, OutboxMessage, OutboxStatus};
use crate::Result;
use crate::model::{
    LedgerUpdate, Reservation, ReservationStatus, StockChange, StockItem, StockMovement,
    StockStatus, Thresholds,
};
use crate::query::MovementQuery;
use crate::saga::{SagaRecord, Version};

/// Storage for stock items and their movement ledger.
///
/// Implementations must make [`apply_change`](StockStore::apply_change) atomic:
/// the precondition check, the quantity update and the movement append either all
/// happen or none do, and concurrent calls on the same SKU are linearized.
#[async_trait]
pub trait StockStore: Send + Sync {
    /// Applies `change` to `sku` if its precondition holds.
    ///
    /// A change whose `(reference_id, movement type)` pair was already applied
    /// returns [`LedgerUpdate::Duplicate`] without touching quantities. Fails with
    /// `NotFound` when the item does not exist, except for receipts, which create it.
    async fn apply_change(
        &self,
        sku: &Sku,
        change: StockChange,
        reference_id: &str,
        reason: Option<&str>,
    ) -> Result<LedgerUpdate>;

    /// Adds `qty` to the item's incoming quantity (purchase orders in transit).
    async fn add_incoming(&self, sku: &Sku, qty: i64) -> Result<StockItem>;

    async fn set_status(&self, sku: &Sku, status: StockStatus) -> Result<StockItem>;

    async fn set_thresholds(&self, sku: &Sku, thresholds: Thresholds) -> Result<StockItem>;

    async fn get_item(&self, sku: &Sku) -> Result<Option<StockItem>>;

    async fn list_items(&self) -> Result<Vec<StockItem>>;

    /// Returns movements matching `query`, oldest first.
    async fn movements(&self, query: MovementQuery) -> Result<Vec<StockMovement>>;
}

/// Storage for reservation rows.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Inserts a reservation row. Inserting an id that already exists is a no-op.
    async fn insert_reservation(&self, reservation: &Reservation) -> Result<()>;

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>>;

    async fn reservations_for_order(&self, order_id: &OrderId) -> Result<Vec<Reservation>>;

    /// Active reservations whose `expires_at` is before `now`, oldest expiry first.
    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>>;

    /// Terminal reservations whose ledger effect has not been applied yet.
    async fn unsettled_reservations(&self, limit: usize) -> Result<Vec<Reservation>>;

    /// Compare-and-set status transition.
    ///
    /// Moves the reservation from `from` to `to` and clears `settled`. Returns the
    /// updated row, or `None` if the current status is not `from`.
    async fn transition_reservation(
        &self,
        id: ReservationId,
        from: ReservationStatus,
        to: ReservationStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Reservation>>;

    /// Records that the ledger effect of the reservation's status has been applied.
    async fn mark_settled(&self, id: ReservationId) -> Result<()>;

    /// Marks an unsettled reservation for manual reconciliation, excluding it
    /// from `unsettled_reservations`.
    async fn flag_reservation(&self, id: ReservationId) -> Result<()>;
}

/// Storage for saga progress rows.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts a new saga. Returns false if a saga of the same type already exists
    /// for the same correlation id.
    async fn insert_saga(&self, saga: &SagaRecord) -> Result<bool>;

    /// Persists `saga`, which must carry its new version, if the stored row is at
    /// `expected`.
    async fn update_saga(&self, saga: &SagaRecord, expected: Version) -> Result<()>;

    async fn get_saga(&self, id: SagaId) -> Result<Option<SagaRecord>>;

    async fn find_saga(&self, order_id: &OrderId, saga_type: &str) -> Result<Option<SagaRecord>>;

    async fn sagas_for_order(&self, order_id: &OrderId) -> Result<Vec<SagaRecord>>;

    /// Sagas that are neither terminal nor flagged for manual reconciliation.
    async fn unfinished_sagas(&self) -> Result<Vec<SagaRecord>>;
}

/// Storage for processed inbound event ids.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Records `event_id` as processed. Returns false if it was already recorded.
    async fn try_mark_processed(
        &self,
        event_id: EventId,
        event_type: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Forgets a processed mark so that a redelivery is handled again.
    async fn unmark_processed(&self, event_id: EventId) -> Result<()>;

    async fn is_processed(&self, event_id: EventId) -> Result<bool>;
}

/// Storage for outbound events awaiting publication.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Enqueues an envelope, assigning the next sequence for its partition key.
    async fn enqueue(&self, envelope: EventEnvelope) -> Result<OutboxMessage>;

    /// Claims up to `limit` claimable messages for `worker_id`, oldest first.
    ///
    /// Claimed messages are moved to `InFlight` with a lease ending at
    /// `now + lease`, and their attempt counter is incremented. A message is not
    /// claimed while an earlier message of its partition is waiting for a retry
    /// or held by another lease.
    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>>;

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Returns the message to `Pending`, retrying no earlier than `next_attempt_at`.
    async fn reschedule(&self, id: i64, error: &str, next_attempt_at: DateTime<Utc>)
    -> Result<()>;

    /// Gives up on the message permanently.
    async fn mark_failed(&self, id: i64, error: &str) -> Result<()>;

    async fn outbox_messages(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxMessage>>;

    /// Deletes published messages published before `before` and failed
    /// messages whose event occurred before it. Returns the number removed.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Every table the engine owns, behind one cloneable handle.
pub trait InventoryStore:
    StockStore + ReservationStore + SagaStore + InboxStore + OutboxStore + Clone + 'static
{
}

impl<T> InventoryStore for T where
    T: StockStore + ReservationStore + SagaStore + InboxStore + OutboxStore + Clone + 'static
{
}
