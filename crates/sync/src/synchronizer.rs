//! Deduplicating handler for events from the order and catalog subsystems.

use std::sync::Arc;

use inventory::{CANCELLED_REASON, Clock};
use inventory_store::{EventEnvelope, InventoryStore};
use saga::{SagaError, SagaOrchestrator};
use serde::Serialize;

use crate::error::{Result, SyncError};
use crate::inbound::InboundEvent;
use crate::product_cache::ProductCacheView;

/// What became of an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    /// The event was handled.
    Applied,
    /// The event id had already been processed.
    Duplicate,
    /// The event can never be applied. Redelivering it is pointless.
    Rejected { reason: String },
}

/// Routes inbound events to the saga orchestrator and the product cache.
///
/// Every event id is handled at most once. The id is recorded before the event
/// is dispatched and forgotten again when dispatch fails in a way a redelivery
/// could fix, so the transport's redelivery gets a second chance.
#[derive(Clone)]
pub struct EventSynchronizer<S> {
    store: S,
    orchestrator: SagaOrchestrator<S>,
    products: ProductCacheView,
    clock: Arc<dyn Clock>,
}

impl<S: InventoryStore> EventSynchronizer<S> {
    pub fn new(
        orchestrator: SagaOrchestrator<S>,
        products: ProductCacheView,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: orchestrator.manager().ledger().store().clone(),
            orchestrator,
            products,
            clock,
        }
    }

    pub fn orchestrator(&self) -> &SagaOrchestrator<S> {
        &self.orchestrator
    }

    pub fn products(&self) -> &ProductCacheView {
        &self.products
    }

    /// Handles one delivery of an inbound event.
    ///
    /// Returns an error only when the event should be redelivered.
    #[tracing::instrument(
        skip(self, envelope),
        fields(event_id = %envelope.event_id, event_type = %envelope.event_type)
    )]
    pub async fn handle(&self, envelope: &EventEnvelope) -> Result<Disposition> {
        let event = match InboundEvent::decode(envelope) {
            Ok(event) => event,
            Err(e) => return Ok(self.reject(envelope, &e)),
        };

        let first = self
            .store
            .try_mark_processed(envelope.event_id, &envelope.event_type, self.clock.now())
            .await?;
        if !first {
            metrics::counter!("inbound_duplicates_total", "event_type" => event.event_type())
                .increment(1);
            tracing::info!("duplicate event ignored");
            return Ok(Disposition::Duplicate);
        }

        match self.dispatch(event).await {
            Ok(()) => {
                metrics::counter!("inbound_events_total", "event_type" => envelope.event_type.clone())
                    .increment(1);
                Ok(Disposition::Applied)
            }
            Err(e) if e.is_retryable() => {
                if let Err(unmark) = self.store.unmark_processed(envelope.event_id).await {
                    tracing::error!(error = %unmark, "failed to forget processed event");
                }
                tracing::warn!(error = %e, "event handling failed, awaiting redelivery");
                Err(e)
            }
            Err(e) => Ok(self.reject(envelope, &e)),
        }
    }

    async fn dispatch(&self, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::OrderCreated(data) => {
                let outcome = self
                    .orchestrator
                    .start_reservation(data.order_id, data.line_items, data.customer_id)
                    .await?;
                tracing::info!(
                    saga_id = %outcome.saga.id,
                    status = %outcome.saga.status,
                    shortfalls = outcome.shortfalls.len(),
                    "order reservation handled"
                );
            }
            InboundEvent::OrderCancelled(data) => {
                let reason = data.reason.as_deref().unwrap_or(CANCELLED_REASON);
                let outcome = self.orchestrator.cancel_order(data.order_id, reason).await?;
                tracing::info!(
                    saga_id = %outcome.saga.id,
                    status = %outcome.saga.status,
                    "order cancellation handled"
                );
            }
            InboundEvent::ProductChanged(data) => {
                self.products.apply(&data);
            }
        }
        Ok(())
    }

    fn reject(&self, envelope: &EventEnvelope, error: &SyncError) -> Disposition {
        metrics::counter!("inbound_rejected_total").increment(1);
        tracing::warn!(partition_key = %envelope.partition_key, error = %error, "inbound event rejected");
        let reason = match error {
            SyncError::Saga(SagaError::InvalidOrder(reason)) => reason.clone(),
            other => other.to_string(),
        };
        Disposition::Rejected { reason }
    }
}
