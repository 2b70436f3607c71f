//! Transports that carry outbox messages to downstream services.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use inventory_store::OutboxMessage;

use crate::error::{Result, SyncError};

/// Delivers an outbound event to downstream consumers.
///
/// Delivery is at-least-once: a message may be handed over again after a
/// crash or an expired lease, with the same event id and sequence.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, message: &OutboxMessage) -> Result<()>;
}

/// Publisher that writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPublisher;

#[async_trait]
impl EventPublisher for LoggingPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<()> {
        tracing::info!(
            event_id = %message.envelope.event_id,
            event_type = %message.envelope.event_type,
            partition_key = %message.envelope.partition_key,
            sequence = message.sequence,
            payload = %message.envelope.payload,
            "event published"
        );
        Ok(())
    }
}

/// Publisher that keeps every delivered message in memory.
///
/// `fail_next` makes the following publishes fail, which lets tests drive the
/// relay's retry path.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPublisher {
    published: Arc<RwLock<Vec<OutboxMessage>>>,
    failures: Arc<AtomicU32>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` publishes fail.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Messages delivered so far, in delivery order.
    pub fn published(&self) -> Vec<OutboxMessage> {
        match self.published.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<()> {
        if self.take_failure() {
            return Err(SyncError::PublishFailed {
                event_type: message.envelope.event_type.clone(),
                reason: "injected failure".into(),
            });
        }
        let mut published = match self.published.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        published.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use inventory_store::{EventEnvelope, OutboxStatus};

    fn message(event_type: &str) -> OutboxMessage {
        OutboxMessage {
            id: 1,
            envelope: EventEnvelope::builder(event_type, "SKU-1").build(),
            sequence: 1,
            status: OutboxStatus::InFlight,
            attempts: 1,
            locked_by: None,
            locked_until: None,
            next_attempt_at: Utc::now(),
            published_at: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn in_memory_publisher_records_messages() {
        let publisher = InMemoryPublisher::new();

        publisher.publish(&message("LowStock")).await.unwrap();
        publisher.publish(&message("OutOfStock")).await.unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].envelope.event_type, "OutOfStock");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let publisher = InMemoryPublisher::new();
        publisher.fail_next(1);

        assert!(matches!(
            publisher.publish(&message("LowStock")).await,
            Err(SyncError::PublishFailed { .. })
        ));
        publisher.publish(&message("LowStock")).await.unwrap();
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn logging_publisher_accepts_everything() {
        LoggingPublisher.publish(&message("LowStock")).await.unwrap();
    }
}
