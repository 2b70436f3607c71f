//! Outbox relay: drains recorded events to the publisher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use futures_util::future::join_all;
use inventory::Clock;
use inventory_store::{OutboxMessage, OutboxStore};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::Result;
use crate::publisher::EventPublisher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Identifies this relay in message leases.
    pub worker_id: String,
    pub batch_size: usize,
    /// How long a claimed message stays invisible to other relays.
    pub lease: Duration,
    pub poll_interval: StdDuration,
    /// Claims after which a message that still fails is marked FAILED.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub publish_timeout: StdDuration,
    /// Published and failed messages older than this are purged.
    pub retention: Duration,
    pub purge_interval: StdDuration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            worker_id: "relay-1".into(),
            batch_size: 100,
            lease: Duration::seconds(30),
            poll_interval: StdDuration::from_millis(500),
            max_attempts: 10,
            base_backoff: Duration::seconds(1),
            max_backoff: Duration::minutes(5),
            publish_timeout: StdDuration::from_secs(5),
            retention: Duration::hours(24),
            purge_interval: StdDuration::from_secs(600),
        }
    }
}

impl RelaySettings {
    /// Delay before the next try of a message that has been claimed `attempts` times.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let delay = self.base_backoff * 2_i32.pow(exponent);
        delay.min(self.max_backoff)
    }
}

/// Counts from one relay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub claimed: usize,
    pub published: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

impl RelayReport {
    fn merge(&mut self, other: RelayReport) {
        self.published += other.published;
        self.rescheduled += other.rescheduled;
        self.failed += other.failed;
    }
}

/// Publishes outbox messages with at-least-once delivery.
///
/// Partitions are published concurrently. Within a partition messages go out in
/// sequence order, and a failed message holds back the rest of its partition
/// until it is published or given up on.
pub struct OutboxRelay<S, P> {
    store: S,
    publisher: P,
    clock: Arc<dyn Clock>,
    settings: RelaySettings,
}

impl<S, P> OutboxRelay<S, P>
where
    S: OutboxStore,
    P: EventPublisher,
{
    pub fn new(store: S, publisher: P, clock: Arc<dyn Clock>, settings: RelaySettings) -> Self {
        Self {
            store,
            publisher,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Claims one batch of due messages and publishes it.
    #[tracing::instrument(skip(self), fields(worker_id = %self.settings.worker_id))]
    pub async fn relay_once(&self) -> Result<RelayReport> {
        let claimed = self
            .store
            .claim_due(
                &self.settings.worker_id,
                self.clock.now(),
                self.settings.lease,
                self.settings.batch_size,
            )
            .await?;
        let mut report = RelayReport {
            claimed: claimed.len(),
            ..RelayReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let mut partitions: BTreeMap<String, Vec<OutboxMessage>> = BTreeMap::new();
        for message in claimed {
            partitions
                .entry(message.envelope.partition_key.clone())
                .or_default()
                .push(message);
        }
        let results = join_all(
            partitions
                .into_values()
                .map(|messages| self.relay_partition(messages)),
        )
        .await;
        for partition in results {
            report.merge(partition);
        }

        tracing::debug!(
            claimed = report.claimed,
            published = report.published,
            rescheduled = report.rescheduled,
            failed = report.failed,
            "relay pass complete"
        );
        Ok(report)
    }

    /// Deletes finished messages that fell out of the retention window.
    #[tracing::instrument(skip(self))]
    pub async fn purge_once(&self) -> Result<u64> {
        let cutoff = self.clock.now() - self.settings.retention;
        let purged = self.store.purge_finished(cutoff).await?;
        if purged > 0 {
            metrics::counter!("outbox_purged_total").increment(purged);
            tracing::info!(purged, %cutoff, "purged finished outbox messages");
        }
        Ok(purged)
    }

    async fn relay_partition(&self, mut messages: Vec<OutboxMessage>) -> RelayReport {
        messages.sort_by_key(|m| m.sequence);
        let mut report = RelayReport::default();
        let mut pending = messages.into_iter();

        while let Some(message) = pending.next() {
            let error = match self.publish(&message).await {
                Ok(()) => {
                    match self.store.mark_published(message.id, self.clock.now()).await {
                        Ok(()) => {
                            report.published += 1;
                            metrics::counter!(
                                "outbox_published_total",
                                "event_type" => message.envelope.event_type.clone()
                            )
                            .increment(1);
                        }
                        // The lease runs out and the message is delivered again.
                        Err(e) => tracing::warn!(
                            message_id = message.id,
                            error = %e,
                            "failed to mark message published"
                        ),
                    }
                    continue;
                }
                Err(error) => error,
            };

            self.handle_failure(&message, &error, &mut report).await;
            let held_until = self.clock.now();
            for held in pending.by_ref() {
                let reason = format!("held behind message {}", message.id);
                match self.store.reschedule(held.id, &reason, held_until).await {
                    Ok(()) => report.rescheduled += 1,
                    Err(e) => tracing::warn!(message_id = held.id, error = %e, "failed to release held message"),
                }
            }
        }
        report
    }

    async fn publish(&self, message: &OutboxMessage) -> std::result::Result<(), String> {
        match tokio::time::timeout(self.settings.publish_timeout, self.publisher.publish(message))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "publish timed out after {:?}",
                self.settings.publish_timeout
            )),
        }
    }

    async fn handle_failure(&self, message: &OutboxMessage, error: &str, report: &mut RelayReport) {
        metrics::counter!("outbox_publish_failures_total").increment(1);
        let outcome = if message.attempts >= self.settings.max_attempts {
            report.failed += 1;
            tracing::error!(
                message_id = message.id,
                event_type = %message.envelope.event_type,
                attempts = message.attempts,
                error,
                "giving up on outbox message"
            );
            self.store.mark_failed(message.id, error).await
        } else {
            report.rescheduled += 1;
            let next_attempt_at = self.clock.now() + self.settings.backoff(message.attempts);
            tracing::warn!(
                message_id = message.id,
                attempts = message.attempts,
                %next_attempt_at,
                error,
                "publish failed, rescheduling"
            );
            self.store.reschedule(message.id, error, next_attempt_at).await
        };
        if let Err(e) = outcome {
            tracing::warn!(message_id = message.id, error = %e, "failed to record publish failure");
        }
    }

    /// Relays on the poll interval, and purges on the purge interval, until
    /// `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut purge_ticker = tokio::time::interval(self.settings.purge_interval);
        purge_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(worker_id = %self.settings.worker_id, "outbox relay started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.relay_once().await {
                        tracing::error!(error = %e, "outbox relay pass failed");
                    }
                }
                _ = purge_ticker.tick() => {
                    if let Err(e) = self.purge_once().await {
                        tracing::warn!(error = %e, "outbox purge failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("outbox relay stopped");
    }
}
