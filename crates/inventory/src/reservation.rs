//! Reservation lifecycle on top of the stock ledger.
//!
//! A terminal transition is a compare-and-set on the reservation row followed by
//! the ledger effect (`settle`). The row records whether the effect has been
//! applied, so an interrupted transition is finished later by the reconciler.

use std::sync::Arc;

use chrono::Duration;
use common::{CustomerId, OrderId, ReservationId, Sku};
use inventory_store::{InventoryStore, Reservation, ReservationStatus, StoreError};

use crate::clock::Clock;
use crate::error::{InventoryError, Result};
use crate::events::{
    InventoryConfirmedData, InventoryEvent, InventoryReleasedData, InventoryReservedData,
};
use crate::ledger::StockLedger;
use crate::outbox::EventOutbox;

pub const EXPIRED_REASON: &str = "expired";
pub const CANCELLED_REASON: &str = "cancelled";
pub const COMPENSATED_REASON: &str = "compensated";

/// Reservation defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationPolicy {
    pub default_ttl: Duration,
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            default_ttl: Duration::minutes(30),
        }
    }
}

/// Parameters of a reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    /// Caller-chosen id. Retrying a request with the same id reserves once.
    pub id: Option<ReservationId>,
    pub order_id: OrderId,
    pub sku: Sku,
    pub quantity: i64,
    pub customer_id: Option<CustomerId>,
    /// Falls back to the policy's default TTL.
    pub ttl: Option<Duration>,
}

impl ReserveRequest {
    pub fn new(order_id: OrderId, sku: Sku, quantity: i64) -> Self {
        Self {
            id: None,
            order_id,
            sku,
            quantity,
            customer_id: None,
            ttl: None,
        }
    }

    pub fn with_id(mut self, id: ReservationId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn customer(mut self, customer_id: CustomerId) -> Self {
        self.customer_id = Some(customer_id);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Public reservation operations.
#[derive(Clone)]
pub struct ReservationManager<S> {
    store: S,
    ledger: StockLedger<S>,
    outbox: EventOutbox<S>,
    clock: Arc<dyn Clock>,
    policy: ReservationPolicy,
}

impl<S: InventoryStore> ReservationManager<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, policy: ReservationPolicy) -> Self {
        Self {
            ledger: StockLedger::new(store.clone(), clock.clone()),
            outbox: EventOutbox::new(store.clone(), clock.clone()),
            store,
            clock,
            policy,
        }
    }

    pub fn ledger(&self) -> &StockLedger<S> {
        &self.ledger
    }

    pub fn policy(&self) -> ReservationPolicy {
        self.policy
    }

    /// Reserves stock and records an active reservation.
    #[tracing::instrument(skip(self), fields(order_id = %request.order_id, sku = %request.sku))]
    pub async fn reserve(&self, request: ReserveRequest) -> Result<Reservation> {
        let now = self.clock.now();
        let id = request.id.unwrap_or_default();
        if request.id.is_some()
            && let Some(existing) = self.store.get_reservation(id).await?
        {
            return Ok(existing);
        }
        let reference_id = id.to_string();
        let ttl = request.ttl.unwrap_or(self.policy.default_ttl);
        let expires_at = (ttl > Duration::zero())
            .then(|| now.checked_add_signed(ttl))
            .flatten()
            .ok_or(InventoryError::InvalidTtl(ttl.num_seconds()))?;

        let reserved = self
            .ledger
            .try_reserve(&request.sku, request.quantity, &reference_id)
            .await;
        if let Err(e) = reserved {
            metrics::counter!("inventory_reservations_total", "outcome" => "rejected")
                .increment(1);
            return Err(e);
        }

        let reservation = Reservation::active(
            id,
            request.sku,
            request.order_id,
            request.customer_id,
            request.quantity,
            expires_at,
            now,
        );
        if let Err(e) = self.store.insert_reservation(&reservation).await {
            tracing::error!(reservation_id = %id, error = %e, "reservation row not recorded, releasing hold");
            if let Err(release_err) = self
                .ledger
                .release(&reservation.sku, reservation.quantity, &reference_id)
                .await
            {
                tracing::error!(
                    reservation_id = %id,
                    error = %release_err,
                    "hold without reservation row; audit will report it"
                );
            }
            return Err(e.into());
        }

        metrics::counter!("inventory_reservations_total", "outcome" => "reserved").increment(1);
        tracing::info!(reservation_id = %id, quantity = reservation.quantity, "stock reserved");
        Ok(reservation)
    }

    /// Publishes `InventoryReserved` for an active reservation.
    pub async fn publish_reserved(&self, reservation: &Reservation) -> Result<()> {
        self.outbox
            .record(&InventoryEvent::InventoryReserved(InventoryReservedData {
                reservation_id: reservation.id,
                order_id: reservation.order_id.clone(),
                sku: reservation.sku.clone(),
                quantity: reservation.quantity,
                expires_at: reservation.expires_at,
            }))
            .await?;
        Ok(())
    }

    /// Confirms an active reservation, consuming its reserved stock.
    ///
    /// Succeeds even past the TTL as long as the reconciler has not expired it yet.
    /// Confirming a confirmed reservation returns it unchanged.
    #[tracing::instrument(skip(self))]
    pub async fn confirm(&self, id: ReservationId) -> Result<Reservation> {
        let reservation = self
            .transition(id, ReservationStatus::Confirmed, None, "confirm")
            .await?;
        Ok(reservation)
    }

    /// Cancels an active reservation and releases its stock.
    ///
    /// Cancelling a cancelled or expired reservation is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: ReservationId, reason: &str) -> Result<Reservation> {
        self.transition(id, ReservationStatus::Cancelled, Some(reason), "cancel")
            .await
    }

    /// Expires an active reservation. Returns `None` if it is no longer active.
    #[tracing::instrument(skip(self))]
    pub async fn expire(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let now = self.clock.now();
        let Some(reservation) = self
            .store
            .transition_reservation(
                id,
                ReservationStatus::Active,
                ReservationStatus::Expired,
                Some(EXPIRED_REASON),
                now,
            )
            .await
            .map_err(|e| not_found_as_reservation(e, id))?
        else {
            return Ok(None);
        };
        metrics::counter!("inventory_reservations_expired_total").increment(1);
        Ok(Some(self.settle(reservation).await?))
    }

    /// Undoes a confirmed reservation by returning its units to available stock.
    ///
    /// The reservation itself stays confirmed; the restock is keyed by the
    /// reservation id so a replay books it once.
    #[tracing::instrument(skip(self, reservation), fields(reservation_id = %reservation.id))]
    pub async fn compensate_confirmed(&self, reservation: &Reservation) -> Result<()> {
        if reservation.status != ReservationStatus::Confirmed {
            return Err(InventoryError::InvalidReservationState {
                id: reservation.id,
                status: reservation.status,
                operation: "compensate",
            });
        }
        self.ledger
            .restock(
                &reservation.sku,
                reservation.quantity,
                &reservation.id.to_string(),
            )
            .await?;
        self.outbox
            .record(&InventoryEvent::InventoryReleased(InventoryReleasedData {
                reservation_id: reservation.id,
                order_id: reservation.order_id.clone(),
                sku: reservation.sku.clone(),
                quantity: reservation.quantity,
                reason: COMPENSATED_REASON.to_string(),
            }))
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: ReservationId) -> Result<Reservation> {
        self.store
            .get_reservation(id)
            .await?
            .ok_or(InventoryError::ReservationNotFound(id))
    }

    pub async fn for_order(&self, order_id: &OrderId) -> Result<Vec<Reservation>> {
        Ok(self.store.reservations_for_order(order_id).await?)
    }

    /// Applies the ledger effect of a terminal reservation and marks it settled.
    ///
    /// Safe to repeat: every ledger call is keyed by the reservation id.
    pub async fn settle(&self, reservation: Reservation) -> Result<Reservation> {
        if reservation.settled {
            return Ok(reservation);
        }
        let reference_id = reservation.id.to_string();
        let event = match reservation.status {
            ReservationStatus::Active => return Ok(reservation),
            ReservationStatus::Confirmed => {
                self.ledger
                    .confirm(&reservation.sku, reservation.quantity, &reference_id)
                    .await?;
                InventoryEvent::InventoryConfirmed(InventoryConfirmedData {
                    reservation_id: reservation.id,
                    order_id: reservation.order_id.clone(),
                    sku: reservation.sku.clone(),
                    quantity: reservation.quantity,
                })
            }
            ReservationStatus::Cancelled | ReservationStatus::Expired => {
                self.ledger
                    .release(&reservation.sku, reservation.quantity, &reference_id)
                    .await?;
                let reason = if reservation.status == ReservationStatus::Expired {
                    EXPIRED_REASON
                } else {
                    CANCELLED_REASON
                };
                InventoryEvent::InventoryReleased(InventoryReleasedData {
                    reservation_id: reservation.id,
                    order_id: reservation.order_id.clone(),
                    sku: reservation.sku.clone(),
                    quantity: reservation.quantity,
                    reason: reason.to_string(),
                })
            }
        };
        self.outbox.record(&event).await?;
        self.store.mark_settled(reservation.id).await?;

        tracing::info!(
            reservation_id = %reservation.id,
            status = %reservation.status,
            "reservation settled"
        );
        Ok(Reservation {
            settled: true,
            ..reservation
        })
    }

    async fn transition(
        &self,
        id: ReservationId,
        to: ReservationStatus,
        reason: Option<&str>,
        operation: &'static str,
    ) -> Result<Reservation> {
        let current = self.get(id).await?;
        let moved = match current.status {
            ReservationStatus::Active => self
                .store
                .transition_reservation(id, ReservationStatus::Active, to, reason, self.clock.now())
                .await
                .map_err(|e| not_found_as_reservation(e, id))?,
            _ => None,
        };

        // Lost the race or already terminal: judge by the state that won.
        let reservation = match moved {
            Some(reservation) => reservation,
            None => {
                let latest = self.get(id).await?;
                if !already_done(latest.status, to) {
                    return Err(InventoryError::InvalidReservationState {
                        id,
                        status: latest.status,
                        operation,
                    });
                }
                latest
            }
        };
        self.settle(reservation).await
    }
}

/// Whether a reservation in `status` already satisfies a request to reach `to`.
fn already_done(status: ReservationStatus, to: ReservationStatus) -> bool {
    match to {
        ReservationStatus::Confirmed => status == ReservationStatus::Confirmed,
        ReservationStatus::Cancelled | ReservationStatus::Expired => status.releases_stock(),
        ReservationStatus::Active => false,
    }
}

fn not_found_as_reservation(err: StoreError, id: ReservationId) -> InventoryError {
    match err {
        StoreError::NotFound { .. } => InventoryError::ReservationNotFound(id),
        other => InventoryError::Store(other),
    }
}
