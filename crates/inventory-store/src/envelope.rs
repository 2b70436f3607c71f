//! Event envelopes and the outbox rows that carry them to the publisher.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::EventId;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// An event together with its routing metadata.
///
/// Inbound envelopes carry the producer's event id, which is the deduplication
/// key. Outbound envelopes are routed by `partition_key` (the SKU for stock
/// alerts, the order id for order-scoped events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The type of the event (e.g., "InventoryReserved", "OrderCreated").
    pub event_type: String,

    /// Ordering key; events sharing a key are sequenced.
    pub partition_key: String,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata about the event.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder(
        event_type: impl Into<String>,
        partition_key: impl Into<String>,
    ) -> EventEnvelopeBuilder {
        EventEnvelopeBuilder {
            event_id: None,
            event_type: event_type.into(),
            partition_key: partition_key.into(),
            timestamp: None,
            payload: serde_json::Value::Null,
            metadata: HashMap::new(),
        }
    }

    /// Deserializes the payload into a concrete event type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: String,
    partition_key: String,
    timestamp: Option<DateTime<Utc>>,
    payload: serde_json::Value,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn build(self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type,
            partition_key: self.partition_key,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload,
            metadata: self.metadata,
        }
    }
}

/// Delivery state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::InFlight => "IN_FLIGHT",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "IN_FLIGHT" => Ok(OutboxStatus::InFlight),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown outbox status {other}"))),
        }
    }
}

/// A durable outbound event awaiting (or past) publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Store-assigned id, increasing in enqueue order.
    pub id: i64,
    pub envelope: EventEnvelope,
    /// Monotonic position within `envelope.partition_key`, starting at 1.
    pub sequence: i64,
    pub status: OutboxStatus,
    /// Number of times the message has been claimed for publishing.
    pub attempts: u32,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    /// Returns true if a relay may claim this message at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending => self.next_attempt_at <= now,
            OutboxStatus::InFlight => self.locked_until.is_some_and(|until| until < now),
            OutboxStatus::Published | OutboxStatus::Failed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_generates_id_and_timestamp() {
        let envelope = EventEnvelope::builder("LowStock", "SKU-1")
            .payload_raw(serde_json::json!({"sku": "SKU-1"}))
            .metadata("source", serde_json::json!("test"))
            .build();
        assert_eq!(envelope.event_type, "LowStock");
        assert_eq!(envelope.partition_key, "SKU-1");
        assert_eq!(envelope.metadata["source"], serde_json::json!("test"));
    }

    #[test]
    fn builder_keeps_explicit_event_id() {
        let id = EventId::new();
        let envelope = EventEnvelope::builder("OrderCreated", "ORD-1")
            .event_id(id)
            .build();
        assert_eq!(envelope.event_id, id);
    }

    #[test]
    fn in_flight_message_claimable_after_lease() {
        let now = Utc::now();
        let mut message = OutboxMessage {
            id: 1,
            envelope: EventEnvelope::builder("OutOfStock", "SKU-1").build(),
            sequence: 1,
            status: OutboxStatus::InFlight,
            attempts: 1,
            locked_by: Some("relay-1".into()),
            locked_until: Some(now + chrono::Duration::seconds(30)),
            next_attempt_at: now,
            published_at: None,
            last_error: None,
        };
        assert!(!message.is_claimable(now));
        message.locked_until = Some(now - chrono::Duration::seconds(1));
        assert!(message.is_claimable(now));
        message.status = OutboxStatus::Published;
        assert!(!message.is_claimable(now));
    }
}
