//! Domain events produced by the inventory engine.

use chrono::{DateTime, Utc};
use common::{OrderId, ReservationId, Sku};
use inventory_store::EventEnvelope;
use serde::{Deserialize, Serialize};

/// Events published to downstream services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InventoryEvent {
    /// Stock was put on hold for an order line.
    InventoryReserved(InventoryReservedData),

    /// A hold was given back, by cancellation or expiry.
    InventoryReleased(InventoryReleasedData),

    /// A hold was consumed by a completed order.
    InventoryConfirmed(InventoryConfirmedData),

    /// Available stock dropped to or below the reorder point.
    LowStock(LowStockData),

    /// Available stock reached zero.
    OutOfStock(OutOfStockData),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReservedData {
    pub reservation_id: ReservationId,
    pub order_id: OrderId,
    pub sku: Sku,
    pub quantity: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReleasedData {
    pub reservation_id: ReservationId,
    pub order_id: OrderId,
    pub sku: Sku,
    pub quantity: i64,
    /// `cancelled`, `expired`, or `compensated`.
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryConfirmedData {
    pub reservation_id: ReservationId,
    pub order_id: OrderId,
    pub sku: Sku,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockData {
    pub sku: Sku,
    pub available: i64,
    pub reorder_point: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutOfStockData {
    pub sku: Sku,
}

impl InventoryEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::InventoryReserved(_) => "InventoryReserved",
            InventoryEvent::InventoryReleased(_) => "InventoryReleased",
            InventoryEvent::InventoryConfirmed(_) => "InventoryConfirmed",
            InventoryEvent::LowStock(_) => "LowStock",
            InventoryEvent::OutOfStock(_) => "OutOfStock",
        }
    }

    /// Ordering key: the SKU for stock alerts, the order for reservation events.
    pub fn partition_key(&self) -> &str {
        match self {
            InventoryEvent::InventoryReserved(data) => data.order_id.as_str(),
            InventoryEvent::InventoryReleased(data) => data.order_id.as_str(),
            InventoryEvent::InventoryConfirmed(data) => data.order_id.as_str(),
            InventoryEvent::LowStock(data) => data.sku.as_str(),
            InventoryEvent::OutOfStock(data) => data.sku.as_str(),
        }
    }

    /// Wraps the event in an envelope stamped at `at`.
    pub fn to_envelope(&self, at: DateTime<Utc>) -> Result<EventEnvelope, serde_json::Error> {
        Ok(EventEnvelope::builder(self.event_type(), self.partition_key())
            .timestamp(at)
            .payload(self)?
            .metadata("source", serde_json::json!("inventory"))
            .build())
    }
}
