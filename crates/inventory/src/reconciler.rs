//! Periodic sweep that expires abandoned reservations, finishes interrupted
//! settlements and re-derives stock alerts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use common::{ReservationId, Sku};
use inventory_store::InventoryStore;
use serde::Serialize;
use tokio::sync::{Mutex, watch};

use crate::clock::Clock;
use crate::error::{InventoryError, Result};
use crate::ledger::AlertLevel;
use crate::outbox::EventOutbox;
use crate::reservation::ReservationManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub interval: StdDuration,
    /// Maximum reservations handled per phase of one sweep.
    pub batch_size: usize,
    /// Non-retryable settlement failures after which a reservation is flagged.
    pub max_settle_failures: u32,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(300),
            batch_size: 500,
            max_settle_failures: 3,
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub repaired: usize,
    pub flagged: usize,
    pub alerts: usize,
    pub failures: usize,
}

/// Reservation garbage collector.
///
/// Overlapping sweeps (several instances, or a sweep racing a live confirm) are
/// safe: expiry is a compare-and-set and every ledger effect is keyed by the
/// reservation id.
pub struct ExpirationReconciler<S> {
    store: S,
    manager: ReservationManager<S>,
    outbox: EventOutbox<S>,
    clock: Arc<dyn Clock>,
    settings: ReconcilerSettings,
    alert_levels: Mutex<HashMap<Sku, AlertLevel>>,
    settle_failures: Mutex<HashMap<ReservationId, u32>>,
}

impl<S: InventoryStore> ExpirationReconciler<S> {
    pub fn new(
        manager: ReservationManager<S>,
        clock: Arc<dyn Clock>,
        settings: ReconcilerSettings,
    ) -> Self {
        let store = manager.ledger().store().clone();
        Self {
            outbox: EventOutbox::new(store.clone(), clock.clone()),
            store,
            manager,
            clock,
            settings,
            alert_levels: Mutex::new(HashMap::new()),
            settle_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one sweep.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let started = std::time::Instant::now();
        let mut report = SweepReport::default();

        let expired = self
            .store
            .expired_reservations(self.clock.now(), self.settings.batch_size)
            .await?;
        for reservation in expired {
            match self.manager.expire(reservation.id).await {
                Ok(Some(_)) => report.expired += 1,
                Ok(None) => {}
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(reservation_id = %reservation.id, error = %e, "failed to expire reservation");
                }
            }
        }

        let unsettled = self
            .store
            .unsettled_reservations(self.settings.batch_size)
            .await?;
        for reservation in unsettled {
            let id = reservation.id;
            match self.manager.settle(reservation).await {
                Ok(_) => {
                    report.repaired += 1;
                    self.settle_failures.lock().await.remove(&id);
                }
                Err(e) if e.is_retryable() => {
                    report.failures += 1;
                    tracing::warn!(reservation_id = %id, error = %e, "failed to settle reservation");
                }
                Err(e) => {
                    report.failures += 1;
                    if self.count_settle_failure(id, &e).await {
                        report.flagged += 1;
                    }
                }
            }
        }

        report.alerts = self.derive_alerts().await?;

        metrics::counter!("reconciler_expired_total").increment(report.expired as u64);
        metrics::counter!("reconciler_repaired_total").increment(report.repaired as u64);
        metrics::histogram!("reconciler_sweep_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        if report != SweepReport::default() {
            tracing::info!(
                expired = report.expired,
                repaired = report.repaired,
                flagged = report.flagged,
                alerts = report.alerts,
                failures = report.failures,
                "reconciler sweep complete"
            );
        }
        Ok(report)
    }

    /// Records a settlement failure that retrying will not fix. Returns true if
    /// the reservation was flagged for manual reconciliation.
    async fn count_settle_failure(&self, id: ReservationId, error: &InventoryError) -> bool {
        let mut failures = self.settle_failures.lock().await;
        let count = failures.entry(id).or_insert(0);
        *count += 1;
        if *count < self.settings.max_settle_failures {
            tracing::warn!(reservation_id = %id, failures = *count, error = %error, "failed to settle reservation");
            return false;
        }
        let count = *count;
        failures.remove(&id);
        drop(failures);

        match self.store.flag_reservation(id).await {
            Ok(()) => {
                metrics::counter!("reconciler_flagged_total").increment(1);
                tracing::error!(
                    reservation_id = %id,
                    failures = count,
                    error = %error,
                    "reservation flagged for manual reconciliation"
                );
                true
            }
            Err(e) => {
                tracing::warn!(reservation_id = %id, error = %e, "failed to flag reservation");
                false
            }
        }
    }

    /// Emits an alert for every item whose level changed to low or out since the
    /// last sweep in this process.
    async fn derive_alerts(&self) -> Result<usize> {
        let items = self.store.list_items().await?;
        let mut levels = self.alert_levels.lock().await;
        let mut emitted = 0;
        for item in items {
            let level = AlertLevel::of(&item);
            let previous = levels.insert(item.sku.clone(), level);
            if previous == Some(level) {
                continue;
            }
            if let Some(event) = level.alert(&item) {
                self.outbox.record_or_warn(&event).await;
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    /// Sweeps on the configured interval until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.settings.interval, "expiration reconciler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "reconciler sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("expiration reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::reservation::{ReservationPolicy, ReserveRequest};
    use chrono::{Duration, Utc};
    use common::{OrderId, WarehouseId};
    use inventory_store::{InMemoryInventoryStore, ReservationStatus};

    async fn setup() -> (
        ExpirationReconciler<InMemoryInventoryStore>,
        ReservationManager<InMemoryInventoryStore>,
        ManualClock,
        Sku,
    ) {
        let clock = ManualClock::new(Utc::now());
        let manager = ReservationManager::new(
            InMemoryInventoryStore::new(),
            Arc::new(clock.clone()),
            ReservationPolicy::default(),
        );
        let sku = Sku::new("SKU-1");
        manager
            .ledger()
            .receive(&sku, WarehouseId::default_warehouse(), 100, "receipt-1")
            .await
            .unwrap();
        let reconciler = ExpirationReconciler::new(
            manager.clone(),
            Arc::new(clock.clone()),
            ReconcilerSettings::default(),
        );
        (reconciler, manager, clock, sku)
    }

    #[tokio::test]
    async fn sweep_leaves_live_reservations_alone() {
        let (reconciler, manager, _, sku) = setup().await;
        let reservation = manager
            .reserve(ReserveRequest::new(OrderId::new("ORD-1"), sku, 3))
            .await
            .unwrap();

        let report = reconciler.sweep_once().await.unwrap();

        assert_eq!(report.expired, 0);
        let stored = manager.get(reservation.id).await.unwrap();
        assert_eq!(stored.status, ReservationStatus::Active);
    }

    #[tokio::test]
    async fn overlapping_sweeps_release_once() {
        let (reconciler, manager, clock, sku) = setup().await;
        manager
            .reserve(ReserveRequest::new(OrderId::new("ORD-1"), sku.clone(), 4).ttl(Duration::seconds(1)))
            .await
            .unwrap();
        clock.advance(Duration::seconds(5));

        let (first, second) = tokio::join!(reconciler.sweep_once(), reconciler.sweep_once());

        assert_eq!(first.unwrap().expired + second.unwrap().expired, 1);
        let level = manager.ledger().get_stock_level(&sku).await.unwrap();
        assert_eq!((level.available, level.reserved), (100, 0));
    }

    #[tokio::test]
    async fn inconsistent_settlement_is_flagged_after_repeated_failures() {
        let (reconciler, manager, _, sku) = setup().await;
        let reservation = manager
            .reserve(ReserveRequest::new(OrderId::new("ORD-1"), sku.clone(), 4))
            .await
            .unwrap();
        // Drain the reserved units under another reference so the confirm cannot apply.
        manager.ledger().release(&sku, 4, "stray-release").await.unwrap();
        let confirm = manager.confirm(reservation.id).await;
        assert!(matches!(confirm, Err(InventoryError::LedgerInconsistency { .. })));

        let first = reconciler.sweep_once().await.unwrap();
        let second = reconciler.sweep_once().await.unwrap();
        let third = reconciler.sweep_once().await.unwrap();
        let fourth = reconciler.sweep_once().await.unwrap();

        assert_eq!((first.failures, first.flagged), (1, 0));
        assert_eq!((second.failures, second.flagged), (1, 0));
        assert_eq!((third.failures, third.flagged), (1, 1));
        assert_eq!((fourth.failures, fourth.flagged), (0, 0));
        let stored = manager.get(reservation.id).await.unwrap();
        assert_eq!(stored.status, ReservationStatus::Confirmed);
        assert!(!stored.settled);
        assert!(stored.needs_attention);
    }

    #[tokio::test]
    async fn sweep_derives_alert_once_per_level_change() {
        let (reconciler, manager, _, sku) = setup().await;
        manager.ledger().adjust(&sku, 4, "recount").await.unwrap();

        let first = reconciler.sweep_once().await.unwrap();
        let second = reconciler.sweep_once().await.unwrap();

        assert_eq!(first.alerts, 1);
        assert_eq!(second.alerts, 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (reconciler, _, _, _) = setup().await;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::new(reconciler).run(rx));
        tx.send(true).unwrap();

        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
