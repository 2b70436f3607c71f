//! Saga orchestrator for order reservation and cancellation.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use common::{CustomerId, OrderId, ReservationId, SagaId};
use inventory::{
    CANCELLED_REASON, COMPENSATED_REASON, Clock, InventoryError, ReservationManager,
    ReserveRequest,
};
use inventory_store::{
    InventoryStore, LineItem, Reservation, ReservationStatus, SagaRecord, SagaStatus,
};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{Result, SagaError, Shortfall};
use crate::pool::SagaWorkerPool;
use crate::retry::{RetryConfig, run_step};
use crate::steps::{
    CANCELLATION_SAGA, RESERVATION_SAGA, ReservationStep, STEP_RELEASE_INVENTORY,
};

/// Orchestrator tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SagaSettings {
    pub retry: RetryConfig,
    /// Re-drives allowed per saga before it is flagged for manual reconciliation.
    pub max_recovery_attempts: u32,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_recovery_attempts: 3,
        }
    }
}

/// Where a saga run ended.
#[derive(Debug, Clone, Serialize)]
pub struct SagaOutcome {
    pub saga: SagaRecord,
    /// Line items that could not be covered, when stock rejected the order.
    pub shortfalls: Vec<Shortfall>,
}

impl SagaOutcome {
    fn of(saga: SagaRecord) -> Self {
        Self {
            saga,
            shortfalls: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.saga.status == SagaStatus::Completed
    }
}

/// Counts from one recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub resumed: usize,
    pub flagged: usize,
    pub failed: usize,
}

/// Drives reservation and cancellation sagas.
///
/// Each saga persists its record after every step, so a crashed run is resumed
/// from its last completed step by [`recover`](SagaOrchestrator::recover).
/// Saga records are written by nothing else.
#[derive(Clone)]
pub struct SagaOrchestrator<S> {
    store: S,
    manager: ReservationManager<S>,
    clock: Arc<dyn Clock>,
    pool: SagaWorkerPool,
    settings: SagaSettings,
}

impl<S: InventoryStore> SagaOrchestrator<S> {
    pub fn new(
        manager: ReservationManager<S>,
        clock: Arc<dyn Clock>,
        pool: SagaWorkerPool,
        settings: SagaSettings,
    ) -> Self {
        Self {
            store: manager.ledger().store().clone(),
            manager,
            clock,
            pool,
            settings,
        }
    }

    pub fn manager(&self) -> &ReservationManager<S> {
        &self.manager
    }

    pub fn pool(&self) -> &SagaWorkerPool {
        &self.pool
    }

    /// Reserves every line item of a new order.
    ///
    /// A second call for the same order returns the first saga's current state.
    /// A stock rejection is not an error: the saga compensates and the outcome
    /// carries the itemized shortfall.
    #[tracing::instrument(skip(self, line_items, customer_id), fields(saga_type = RESERVATION_SAGA))]
    pub async fn start_reservation(
        &self,
        order_id: OrderId,
        line_items: Vec<LineItem>,
        customer_id: Option<CustomerId>,
    ) -> Result<SagaOutcome> {
        if line_items.is_empty() {
            return Err(SagaError::InvalidOrder("order has no line items".into()));
        }
        if let Some(item) = line_items.iter().find(|item| item.quantity <= 0) {
            return Err(SagaError::InvalidOrder(format!(
                "line item {} has quantity {}",
                item.sku, item.quantity
            )));
        }

        self.pool
            .run(self.begin_reservation(order_id, line_items, customer_id))
            .await
    }

    async fn begin_reservation(
        &self,
        order_id: OrderId,
        line_items: Vec<LineItem>,
        customer_id: Option<CustomerId>,
    ) -> Result<SagaOutcome> {
        let saga = SagaRecord::start(
            order_id.clone(),
            RESERVATION_SAGA,
            line_items,
            customer_id,
            self.clock.now(),
        );
        if !self.store.insert_saga(&saga).await? {
            tracing::info!("reservation saga already exists for order");
            return self.existing(&order_id, RESERVATION_SAGA).await;
        }
        metrics::counter!("saga_executions_total", "saga_type" => RESERVATION_SAGA).increment(1);
        tracing::info!(saga_id = %saga.id, "saga started");

        self.drive_reservation(saga).await
    }

    /// Releases everything held for an order.
    ///
    /// Always accepted: releases that fail here leave the saga running so that
    /// [`run_release_retries`](SagaOrchestrator::run_release_retries) retries
    /// them, and a hold that is never released still expires.
    #[tracing::instrument(skip(self), fields(saga_type = CANCELLATION_SAGA))]
    pub async fn cancel_order(&self, order_id: OrderId, reason: &str) -> Result<SagaOutcome> {
        self.pool.run(self.begin_cancellation(order_id, reason)).await
    }

    async fn begin_cancellation(&self, order_id: OrderId, reason: &str) -> Result<SagaOutcome> {
        let saga = SagaRecord::start(
            order_id.clone(),
            CANCELLATION_SAGA,
            Vec::new(),
            None,
            self.clock.now(),
        );
        let saga = if self.store.insert_saga(&saga).await? {
            metrics::counter!("saga_executions_total", "saga_type" => CANCELLATION_SAGA)
                .increment(1);
            tracing::info!(saga_id = %saga.id, "saga started");
            saga
        } else {
            let existing = self.find(&order_id, CANCELLATION_SAGA).await?;
            if existing.status.is_terminal() || existing.needs_attention {
                return Ok(SagaOutcome::of(existing));
            }
            existing
        };

        self.drive_cancellation(saga, reason.to_string()).await
    }

    /// Re-drives every saga that is neither finished nor flagged.
    ///
    /// A saga that has already been re-driven `max_recovery_attempts` times is
    /// flagged `needs_attention` instead.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let sagas = self.store.unfinished_sagas().await?;
        let report = self.redrive(sagas).await;
        metrics::counter!("saga_recovered_total").increment(report.resumed as u64);
        Ok(report)
    }

    /// Re-drives cancellation sagas parked with deferred releases.
    ///
    /// A cancellation still being driven has no failure reason yet and is left
    /// alone. Every pass counts against `max_recovery_attempts`.
    #[tracing::instrument(skip(self))]
    pub async fn retry_deferred_releases(&self) -> Result<RecoveryReport> {
        let deferred: Vec<_> = self
            .store
            .unfinished_sagas()
            .await?
            .into_iter()
            .filter(|saga| saga.saga_type == CANCELLATION_SAGA && saga.failure_reason.is_some())
            .collect();
        if deferred.is_empty() {
            return Ok(RecoveryReport::default());
        }
        let report = self.redrive(deferred).await;
        tracing::info!(
            resumed = report.resumed,
            flagged = report.flagged,
            failed = report.failed,
            "deferred releases retried"
        );
        Ok(report)
    }

    /// Retries deferred releases on `interval` until `shutdown` flips to true.
    pub async fn run_release_retries(
        self,
        interval: StdDuration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(?interval, "release retry loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.retry_deferred_releases().await {
                        tracing::error!(error = %e, "release retry pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("release retry loop stopped");
    }

    async fn redrive(&self, sagas: Vec<SagaRecord>) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let mut handles = Vec::new();

        for mut saga in sagas {
            if saga.recovery_attempts >= self.settings.max_recovery_attempts {
                saga.needs_attention = true;
                saga.failure_reason = Some(format!(
                    "gave up after {} recovery attempts",
                    saga.recovery_attempts
                ));
                match self.save(&mut saga).await {
                    Ok(()) => {
                        report.flagged += 1;
                        metrics::counter!("saga_needs_attention_total").increment(1);
                        tracing::error!(saga_id = %saga.id, order_id = %saga.correlation_id, "saga flagged for manual reconciliation");
                    }
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(saga_id = %saga.id, error = %e, "failed to flag saga");
                    }
                }
                continue;
            }

            saga.recovery_attempts += 1;
            if let Err(e) = self.save(&mut saga).await {
                report.failed += 1;
                tracing::warn!(saga_id = %saga.id, error = %e, "failed to claim saga for recovery");
                continue;
            }
            tracing::info!(
                saga_id = %saga.id,
                saga_type = %saga.saga_type,
                status = %saga.status,
                last_step = saga.last_completed_step().unwrap_or("none"),
                "resuming saga"
            );
            let orchestrator = self.clone();
            handles.push((saga.id, self.pool.spawn(async move { orchestrator.resume(saga).await })));
        }

        for (saga_id, handle) in handles {
            match handle.await {
                Ok(Ok(_)) => report.resumed += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(%saga_id, error = %e, "saga recovery failed");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(%saga_id, error = %e, "saga recovery task panicked");
                }
            }
        }
        report
    }

    pub async fn get_saga(&self, id: SagaId) -> Result<SagaRecord> {
        self.store
            .get_saga(id)
            .await?
            .ok_or(SagaError::SagaNotFound(id))
    }

    pub async fn sagas_for_order(&self, order_id: &OrderId) -> Result<Vec<SagaRecord>> {
        Ok(self.store.sagas_for_order(order_id).await?)
    }

    async fn resume(&self, saga: SagaRecord) -> Result<SagaOutcome> {
        if saga.saga_type == CANCELLATION_SAGA {
            return self
                .drive_cancellation(saga, CANCELLED_REASON.to_string())
                .await;
        }
        match saga.status {
            SagaStatus::Running => self.drive_reservation(saga).await,
            SagaStatus::Failed | SagaStatus::Compensating => self.compensate(saga).await,
            SagaStatus::Completed | SagaStatus::Compensated => Ok(SagaOutcome::of(saga)),
        }
    }

    async fn drive_reservation(&self, mut saga: SagaRecord) -> Result<SagaOutcome> {
        let started = std::time::Instant::now();

        for step in ReservationStep::ALL {
            if saga.has_completed(step.name()) {
                continue;
            }
            tracing::info!(saga_id = %saga.id, step = step.name(), "saga step started");
            let result = match step {
                ReservationStep::Validate => self.validate(&saga).await,
                ReservationStep::Reserve => self.reserve_items(&mut saga).await,
                ReservationStep::Publish => self.publish_reserved(&saga).await,
            };
            match result {
                Ok(()) => {
                    saga.completed_steps.push(step.name().to_string());
                    self.save(&mut saga).await?;
                    tracing::info!(saga_id = %saga.id, step = step.name(), "saga step completed");
                }
                Err(e) => {
                    let outcome = self.fail(saga, step, e).await;
                    metrics::histogram!("saga_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    return outcome;
                }
            }
        }

        saga.status = SagaStatus::Completed;
        self.save(&mut saga).await?;
        metrics::counter!("saga_completed").increment(1);
        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(saga_id = %saga.id, reservations = saga.reservation_ids.len(), "saga completed");
        Ok(SagaOutcome::of(saga))
    }

    /// Fail-fast check of every line item against available stock.
    async fn validate(&self, saga: &SagaRecord) -> Result<()> {
        let step = ReservationStep::Validate.name();
        let ledger = self.manager.ledger();
        let mut shortfalls = Vec::new();

        for item in &saga.line_items {
            let found = run_step(step, &self.settings.retry, || ledger.get_item(&item.sku)).await;
            let available = match found {
                Ok(stock) => stock.available,
                Err(SagaError::Inventory(InventoryError::StockItemNotFound(_))) => 0,
                Err(e) => return Err(e),
            };
            if available < item.quantity {
                shortfalls.push(Shortfall {
                    sku: item.sku.clone(),
                    requested: item.quantity,
                    available,
                });
            }
        }

        if shortfalls.is_empty() {
            Ok(())
        } else {
            Err(SagaError::InsufficientStock(shortfalls))
        }
    }

    async fn reserve_items(&self, saga: &mut SagaRecord) -> Result<()> {
        let step = ReservationStep::Reserve.name();

        // Fix the reservation ids before touching stock so a re-driven step
        // reserves each line once.
        if saga.reservation_ids.len() != saga.line_items.len() {
            saga.reservation_ids = saga.line_items.iter().map(|_| ReservationId::new()).collect();
            self.save(saga).await?;
        }

        let ttl = self.manager.policy().default_ttl;
        for (item, id) in saga.line_items.iter().zip(saga.reservation_ids.iter().copied()) {
            if self.is_cancelling(&saga.correlation_id).await? {
                return Err(SagaError::OrderCancelled(saga.correlation_id.clone()));
            }
            let mut request =
                ReserveRequest::new(saga.correlation_id.clone(), item.sku.clone(), item.quantity)
                    .with_id(id)
                    .ttl(ttl);
            if let Some(customer_id) = &saga.customer_id {
                request = request.customer(customer_id.clone());
            }

            let reserved = run_step(step, &self.settings.retry, || {
                self.manager.reserve(request.clone())
            })
            .await;
            match reserved {
                Ok(reservation) => {
                    tracing::debug!(reservation_id = %reservation.id, sku = %item.sku, "line item reserved");
                }
                Err(SagaError::Inventory(InventoryError::InsufficientStock {
                    sku,
                    requested,
                    available,
                })) => {
                    return Err(SagaError::InsufficientStock(vec![Shortfall {
                        sku,
                        requested,
                        available,
                    }]));
                }
                Err(e) => return Err(e),
            }
        }
        if self.is_cancelling(&saga.correlation_id).await? {
            return Err(SagaError::OrderCancelled(saga.correlation_id.clone()));
        }
        Ok(())
    }

    async fn publish_reserved(&self, saga: &SagaRecord) -> Result<()> {
        let step = ReservationStep::Publish.name();
        for id in &saga.reservation_ids {
            let reservation = self.manager.get(*id).await?;
            run_step(step, &self.settings.retry, || {
                self.manager.publish_reserved(&reservation)
            })
            .await?;
        }
        Ok(())
    }

    async fn fail(
        &self,
        mut saga: SagaRecord,
        step: ReservationStep,
        error: SagaError,
    ) -> Result<SagaOutcome> {
        let shortfalls = error.shortfalls().to_vec();
        saga.status = SagaStatus::Failed;
        saga.failure_reason = Some(format!("{step}: {error}"));
        self.save(&mut saga).await?;
        metrics::counter!("saga_failed", "step" => step.name()).increment(1);
        tracing::warn!(
            saga_id = %saga.id,
            order_id = %saga.correlation_id,
            step = step.name(),
            reason = %error,
            "saga failed"
        );

        let mut outcome = self.compensate(saga).await?;
        outcome.shortfalls = shortfalls;
        Ok(outcome)
    }

    /// Releases every active reservation held for the saga's order.
    ///
    /// Published events are not retracted. A release that keeps failing flags
    /// the saga for manual reconciliation instead of looping.
    async fn compensate(&self, mut saga: SagaRecord) -> Result<SagaOutcome> {
        if saga.status != SagaStatus::Compensating {
            saga.status = SagaStatus::Compensating;
            self.save(&mut saga).await?;
        }
        tracing::info!(saga_id = %saga.id, "compensating saga");

        match self.release_active(&saga.correlation_id, COMPENSATED_REASON).await {
            Ok(released) => {
                saga.status = SagaStatus::Compensated;
                self.save(&mut saga).await?;
                metrics::counter!("saga_compensated").increment(1);
                tracing::info!(saga_id = %saga.id, released, "saga compensated");
            }
            Err(e) => {
                saga.needs_attention = true;
                saga.failure_reason = Some(match saga.failure_reason.take() {
                    Some(reason) => format!("{reason}; compensation failed: {e}"),
                    None => format!("compensation failed: {e}"),
                });
                self.save(&mut saga).await?;
                metrics::counter!("saga_compensation_failed").increment(1);
                tracing::error!(
                    saga_id = %saga.id,
                    order_id = %saga.correlation_id,
                    error = %e,
                    "saga compensation failed, flagged for manual reconciliation"
                );
            }
        }
        Ok(SagaOutcome::of(saga))
    }

    async fn release_active(&self, order_id: &OrderId, reason: &str) -> Result<usize> {
        let step = ReservationStep::Reserve.name();
        let mut released = 0;
        for reservation in self.manager.for_order(order_id).await? {
            if reservation.status != ReservationStatus::Active {
                continue;
            }
            run_step(step, &self.settings.retry, || {
                self.manager.cancel(reservation.id, reason)
            })
            .await?;
            released += 1;
        }
        Ok(released)
    }

    async fn drive_cancellation(&self, mut saga: SagaRecord, reason: String) -> Result<SagaOutcome> {
        let started = std::time::Instant::now();
        tracing::info!(saga_id = %saga.id, step = STEP_RELEASE_INVENTORY, "saga step started");

        let reservations = self.manager.for_order(&saga.correlation_id).await?;
        let mut deferred = 0;
        for reservation in &reservations {
            if let Err(e) = self.release_one(reservation, &reason).await {
                deferred += 1;
                tracing::warn!(
                    saga_id = %saga.id,
                    reservation_id = %reservation.id,
                    error = %e,
                    "release deferred"
                );
            }
        }
        saga.reservation_ids = reservations.iter().map(|r| r.id).collect();

        if deferred > 0 {
            saga.failure_reason = Some(format!("{deferred} releases deferred"));
            self.save(&mut saga).await?;
            return Ok(SagaOutcome::of(saga));
        }

        saga.completed_steps.push(STEP_RELEASE_INVENTORY.to_string());
        saga.status = SagaStatus::Completed;
        saga.failure_reason = None;
        self.save(&mut saga).await?;
        metrics::counter!("saga_completed").increment(1);
        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(saga_id = %saga.id, reservations = reservations.len(), "order stock released");
        Ok(SagaOutcome::of(saga))
    }

    /// Cancels an active hold or returns the units of a confirmed one.
    async fn release_one(&self, reservation: &Reservation, reason: &str) -> Result<()> {
        let retry = &self.settings.retry;
        match reservation.status {
            ReservationStatus::Active => {
                run_step(STEP_RELEASE_INVENTORY, retry, || {
                    self.manager.cancel(reservation.id, reason)
                })
                .await?;
            }
            ReservationStatus::Confirmed => {
                run_step(STEP_RELEASE_INVENTORY, retry, || {
                    self.manager.compensate_confirmed(reservation)
                })
                .await?;
            }
            ReservationStatus::Cancelled | ReservationStatus::Expired if !reservation.settled => {
                run_step(STEP_RELEASE_INVENTORY, retry, || {
                    self.manager.settle(reservation.clone())
                })
                .await?;
            }
            ReservationStatus::Cancelled | ReservationStatus::Expired => {}
        }
        Ok(())
    }

    async fn is_cancelling(&self, order_id: &OrderId) -> Result<bool> {
        Ok(self
            .store
            .find_saga(order_id, CANCELLATION_SAGA)
            .await?
            .is_some())
    }

    async fn find(&self, order_id: &OrderId, saga_type: &str) -> Result<SagaRecord> {
        self.store
            .find_saga(order_id, saga_type)
            .await?
            .ok_or_else(|| SagaError::InvalidOrder(format!("no {saga_type} saga for {order_id}")))
    }

    async fn existing(&self, order_id: &OrderId, saga_type: &str) -> Result<SagaOutcome> {
        Ok(SagaOutcome::of(self.find(order_id, saga_type).await?))
    }

    /// Persists `saga` at the next version.
    async fn save(&self, saga: &mut SagaRecord) -> Result<()> {
        let expected = saga.version;
        saga.version = expected.next();
        saga.updated_at = self.clock.now();
        if let Err(e) = self.store.update_saga(saga, expected).await {
            saga.version = expected;
            return Err(e.into());
        }
        Ok(())
    }
}
