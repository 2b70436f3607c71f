use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{EventId, OrderId, ReservationId, SagaId, Sku};
use tokio::sync::RwLock;

use crate::envelope::{EventEnvelope, OutboxMessage, OutboxStatus};
use crate::model::{
    LedgerUpdate, MovementType, Reservation, ReservationStatus, StockChange, StockItem,
    StockMovement, StockStatus, Thresholds,
};
use crate::query::MovementQuery;
use crate::saga::{SagaRecord, Version};
use crate::store::{InboxStore, OutboxStore, ReservationStore, SagaStore, StockStore};
use crate::{Result, StoreError};

/// Items, movements and the applied-reference index share one lock so that a
/// ledger change is a single critical section.
#[derive(Default)]
struct LedgerState {
    items: HashMap<Sku, StockItem>,
    movements: Vec<StockMovement>,
    applied: HashSet<(String, MovementType)>,
}

#[derive(Default)]
struct OutboxState {
    messages: Vec<OutboxMessage>,
    sequences: HashMap<String, i64>,
    last_id: i64,
}

#[derive(Default)]
struct Faults {
    stock_failures: AtomicU32,
    stock_latency_ms: AtomicU64,
}

/// In-memory store implementation for tests and single-process deployments.
///
/// Provides the same atomicity guarantees as the PostgreSQL implementation within
/// one process.
#[derive(Clone, Default)]
pub struct InMemoryInventoryStore {
    ledger: Arc<RwLock<LedgerState>>,
    reservations: Arc<RwLock<HashMap<ReservationId, Reservation>>>,
    sagas: Arc<RwLock<HashMap<SagaId, SagaRecord>>>,
    inbox: Arc<RwLock<HashMap<EventId, (String, DateTime<Utc>)>>>,
    outbox: Arc<RwLock<OutboxState>>,
    faults: Arc<Faults>,
}

impl InMemoryInventoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` ledger changes fail with `Unavailable`.
    pub fn inject_stock_failures(&self, count: u32) {
        self.faults.stock_failures.store(count, Ordering::SeqCst);
    }

    /// Delays every ledger change by `latency`.
    pub fn set_stock_latency(&self, latency: StdDuration) {
        self.faults
            .stock_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Returns the total number of movements recorded.
    pub async fn movement_count(&self) -> usize {
        self.ledger.read().await.movements.len()
    }

    async fn simulate_faults(&self) -> Result<()> {
        let latency = self.faults.stock_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(StdDuration::from_millis(latency)).await;
        }
        let injected = self
            .faults
            .stock_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected stock failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StockStore for InMemoryInventoryStore {
    async fn apply_change(
        &self,
        sku: &Sku,
        change: StockChange,
        reference_id: &str,
        reason: Option<&str>,
    ) -> Result<LedgerUpdate> {
        self.simulate_faults().await?;

        let now = Utc::now();
        let movement_type = change.movement_type();
        let mut ledger = self.ledger.write().await;

        if ledger
            .applied
            .contains(&(reference_id.to_string(), movement_type))
        {
            return Ok(LedgerUpdate::Duplicate);
        }

        let before = match (ledger.items.get(sku), &change) {
            (Some(item), _) => item.clone(),
            (None, StockChange::Receive { warehouse_id, .. }) => {
                StockItem::new(sku.clone(), warehouse_id.clone(), now)
            }
            (None, _) => return Err(StoreError::not_found("stock item", sku)),
        };

        let mut after = before.clone();
        if !change.apply_to(&mut after, now) {
            return Ok(LedgerUpdate::Rejected(before));
        }

        let movement = StockMovement {
            id: ledger.movements.len() as i64 + 1,
            sku: sku.clone(),
            movement_type,
            quantity: change.quantity(&before),
            available_delta: after.available - before.available,
            reserved_delta: after.reserved - before.reserved,
            available_after: after.available,
            reserved_after: after.reserved,
            reference_id: reference_id.to_string(),
            reason: reason.map(str::to_string),
            recorded_at: now,
        };

        ledger.items.insert(sku.clone(), after.clone());
        ledger.movements.push(movement.clone());
        ledger
            .applied
            .insert((reference_id.to_string(), movement_type));

        Ok(LedgerUpdate::Applied {
            before,
            after,
            movement,
        })
    }

    async fn add_incoming(&self, sku: &Sku, qty: i64) -> Result<StockItem> {
        let mut ledger = self.ledger.write().await;
        let item = ledger
            .items
            .get_mut(sku)
            .ok_or_else(|| StoreError::not_found("stock item", sku))?;
        item.incoming += qty;
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn set_status(&self, sku: &Sku, status: StockStatus) -> Result<StockItem> {
        let mut ledger = self.ledger.write().await;
        let item = ledger
            .items
            .get_mut(sku)
            .ok_or_else(|| StoreError::not_found("stock item", sku))?;
        item.status = status;
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn set_thresholds(&self, sku: &Sku, thresholds: Thresholds) -> Result<StockItem> {
        let mut ledger = self.ledger.write().await;
        let item = ledger
            .items
            .get_mut(sku)
            .ok_or_else(|| StoreError::not_found("stock item", sku))?;
        item.thresholds = thresholds;
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn get_item(&self, sku: &Sku) -> Result<Option<StockItem>> {
        Ok(self.ledger.read().await.items.get(sku).cloned())
    }

    async fn list_items(&self) -> Result<Vec<StockItem>> {
        let ledger = self.ledger.read().await;
        let mut items: Vec<_> = ledger.items.values().cloned().collect();
        items.sort_by(|a, b| a.sku.cmp(&b.sku));
        Ok(items)
    }

    async fn movements(&self, query: MovementQuery) -> Result<Vec<StockMovement>> {
        let ledger = self.ledger.read().await;
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(ledger
            .movements
            .iter()
            .filter(|m| query.matches(m))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReservationStore for InMemoryInventoryStore {
    async fn insert_reservation(&self, reservation: &Reservation) -> Result<()> {
        self.reservations
            .write()
            .await
            .entry(reservation.id)
            .or_insert_with(|| reservation.clone());
        Ok(())
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        Ok(self.reservations.read().await.get(&id).cloned())
    }

    async fn reservations_for_order(&self, order_id: &OrderId) -> Result<Vec<Reservation>> {
        let reservations = self.reservations.read().await;
        let mut found: Vec<_> = reservations
            .values()
            .filter(|r| &r.order_id == order_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>> {
        let reservations = self.reservations.read().await;
        let mut expired: Vec<_> = reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Active && r.is_past_expiry(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn unsettled_reservations(&self, limit: usize) -> Result<Vec<Reservation>> {
        let reservations = self.reservations.read().await;
        let mut unsettled: Vec<_> = reservations
            .values()
            .filter(|r| r.status.is_terminal() && !r.settled && !r.needs_attention)
            .cloned()
            .collect();
        unsettled.sort_by_key(|r| r.updated_at);
        unsettled.truncate(limit);
        Ok(unsettled)
    }

    async fn transition_reservation(
        &self,
        id: ReservationId,
        from: ReservationStatus,
        to: ReservationStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Reservation>> {
        let mut reservations = self.reservations.write().await;
        let reservation = reservations
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("reservation", id))?;
        if reservation.status != from {
            return Ok(None);
        }
        reservation.status = to;
        reservation.reason = reason.map(str::to_string);
        reservation.settled = false;
        reservation.updated_at = at;
        Ok(Some(reservation.clone()))
    }

    async fn mark_settled(&self, id: ReservationId) -> Result<()> {
        let mut reservations = self.reservations.write().await;
        let reservation = reservations
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("reservation", id))?;
        reservation.settled = true;
        Ok(())
    }

    async fn flag_reservation(&self, id: ReservationId) -> Result<()> {
        let mut reservations = self.reservations.write().await;
        let reservation = reservations
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("reservation", id))?;
        reservation.needs_attention = true;
        Ok(())
    }
}

#[async_trait]
impl SagaStore for InMemoryInventoryStore {
    async fn insert_saga(&self, saga: &SagaRecord) -> Result<bool> {
        let mut sagas = self.sagas.write().await;
        let exists = sagas.values().any(|s| {
            s.correlation_id == saga.correlation_id && s.saga_type == saga.saga_type
        });
        if exists {
            return Ok(false);
        }
        sagas.insert(saga.id, saga.clone());
        Ok(true)
    }

    async fn update_saga(&self, saga: &SagaRecord, expected: Version) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        let stored = sagas
            .get_mut(&saga.id)
            .ok_or_else(|| StoreError::not_found("saga", saga.id))?;
        if stored.version != expected {
            return Err(StoreError::ConcurrencyConflict {
                entity: "saga",
                id: saga.id.to_string(),
                expected,
                actual: stored.version,
            });
        }
        *stored = saga.clone();
        Ok(())
    }

    async fn get_saga(&self, id: SagaId) -> Result<Option<SagaRecord>> {
        Ok(self.sagas.read().await.get(&id).cloned())
    }

    async fn find_saga(&self, order_id: &OrderId, saga_type: &str) -> Result<Option<SagaRecord>> {
        let sagas = self.sagas.read().await;
        Ok(sagas
            .values()
            .find(|s| &s.correlation_id == order_id && s.saga_type == saga_type)
            .cloned())
    }

    async fn sagas_for_order(&self, order_id: &OrderId) -> Result<Vec<SagaRecord>> {
        let sagas = self.sagas.read().await;
        let mut found: Vec<_> = sagas
            .values()
            .filter(|s| &s.correlation_id == order_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }

    async fn unfinished_sagas(&self) -> Result<Vec<SagaRecord>> {
        let sagas = self.sagas.read().await;
        let mut found: Vec<_> = sagas
            .values()
            .filter(|s| !s.status.is_terminal() && !s.needs_attention)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }
}

#[async_trait]
impl InboxStore for InMemoryInventoryStore {
    async fn try_mark_processed(
        &self,
        event_id: EventId,
        event_type: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inbox = self.inbox.write().await;
        if inbox.contains_key(&event_id) {
            return Ok(false);
        }
        inbox.insert(event_id, (event_type.to_string(), at));
        Ok(true)
    }

    async fn unmark_processed(&self, event_id: EventId) -> Result<()> {
        self.inbox.write().await.remove(&event_id);
        Ok(())
    }

    async fn is_processed(&self, event_id: EventId) -> Result<bool> {
        Ok(self.inbox.read().await.contains_key(&event_id))
    }
}

#[async_trait]
impl OutboxStore for InMemoryInventoryStore {
    async fn enqueue(&self, envelope: EventEnvelope) -> Result<OutboxMessage> {
        let mut outbox = self.outbox.write().await;
        let sequence = {
            let next = outbox
                .sequences
                .entry(envelope.partition_key.clone())
                .or_insert(0);
            *next += 1;
            *next
        };
        outbox.last_id += 1;
        let message = OutboxMessage {
            id: outbox.last_id,
            next_attempt_at: envelope.timestamp,
            envelope,
            sequence,
            status: OutboxStatus::Pending,
            attempts: 0,
            locked_by: None,
            locked_until: None,
            published_at: None,
            last_error: None,
        };
        outbox.messages.push(message.clone());
        Ok(message)
    }

    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>> {
        let mut outbox = self.outbox.write().await;
        let mut claimed = Vec::new();
        let mut blocked = HashSet::new();
        for message in outbox.messages.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            let key = &message.envelope.partition_key;
            if blocked.contains(key) {
                continue;
            }
            if !message.is_claimable(now) {
                if matches!(message.status, OutboxStatus::Pending | OutboxStatus::InFlight) {
                    blocked.insert(key.clone());
                }
                continue;
            }
            message.status = OutboxStatus::InFlight;
            message.attempts += 1;
            message.locked_by = Some(worker_id.to_string());
            message.locked_until = Some(now + lease);
            claimed.push(message.clone());
        }
        Ok(claimed)
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut outbox = self.outbox.write().await;
        let message = find_message(&mut outbox, id)?;
        message.status = OutboxStatus::Published;
        message.published_at = Some(at);
        message.locked_by = None;
        message.locked_until = None;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut outbox = self.outbox.write().await;
        let message = find_message(&mut outbox, id)?;
        message.status = OutboxStatus::Pending;
        message.next_attempt_at = next_attempt_at;
        message.last_error = Some(error.to_string());
        message.locked_by = None;
        message.locked_until = None;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let mut outbox = self.outbox.write().await;
        let message = find_message(&mut outbox, id)?;
        message.status = OutboxStatus::Failed;
        message.last_error = Some(error.to_string());
        message.locked_by = None;
        message.locked_until = None;
        Ok(())
    }

    async fn outbox_messages(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxMessage>> {
        let outbox = self.outbox.read().await;
        Ok(outbox
            .messages
            .iter()
            .filter(|m| status.is_none_or(|s| m.status == s))
            .cloned()
            .collect())
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut outbox = self.outbox.write().await;
        let count = outbox.messages.len();
        outbox.messages.retain(|m| match m.status {
            OutboxStatus::Published => m.published_at.is_none_or(|at| at >= before),
            OutboxStatus::Failed => m.envelope.timestamp >= before,
            OutboxStatus::Pending | OutboxStatus::InFlight => true,
        });
        Ok((count - outbox.messages.len()) as u64)
    }
}

fn find_message(outbox: &mut OutboxState, id: i64) -> Result<&mut OutboxMessage> {
    outbox
        .messages
        .iter_mut()
        .find(|m| m.id == id)
        .ok_or_else(|| StoreError::not_found("outbox message", id))
}
