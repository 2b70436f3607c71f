use std::sync::Arc;

use inventory_store::{OutboxMessage, OutboxStore};

use crate::clock::Clock;
use crate::error::Result;
use crate::events::InventoryEvent;

/// Records outbound events durably; a relay publishes them later.
///
/// Callers commit their state change first and record the event afterwards, so a
/// publish failure never re-runs the mutation.
#[derive(Clone)]
pub struct EventOutbox<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: OutboxStore> EventOutbox<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Enqueues `event` under its partition key.
    pub async fn record(&self, event: &InventoryEvent) -> Result<OutboxMessage> {
        let envelope = event.to_envelope(self.clock.now())?;
        let message = self.store.enqueue(envelope).await?;

        metrics::counter!("outbox_enqueued_total", "event_type" => event.event_type())
            .increment(1);
        tracing::debug!(
            event_type = event.event_type(),
            partition_key = event.partition_key(),
            sequence = message.sequence,
            "event recorded in outbox"
        );
        Ok(message)
    }

    /// Records `event`, logging instead of failing. For events whose loss is
    /// repaired elsewhere (stock alerts are re-derived by the reconciler).
    pub async fn record_or_warn(&self, event: &InventoryEvent) {
        if let Err(e) = self.record(event).await {
            tracing::warn!(
                event_type = event.event_type(),
                error = %e,
                "failed to record event in outbox"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::events::OutOfStockData;
    use common::Sku;
    use inventory_store::{InMemoryInventoryStore, OutboxStatus};

    #[tokio::test]
    async fn record_enqueues_pending_message() {
        let store = InMemoryInventoryStore::new();
        let outbox = EventOutbox::new(store.clone(), Arc::new(SystemClock));

        let message = outbox
            .record(&InventoryEvent::OutOfStock(OutOfStockData {
                sku: Sku::new("SKU-1"),
            }))
            .await
            .unwrap();

        assert_eq!(message.sequence, 1);
        assert_eq!(message.envelope.partition_key, "SKU-1");
        let pending = store
            .outbox_messages(Some(OutboxStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }
}
