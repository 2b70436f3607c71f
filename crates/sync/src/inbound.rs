//! Events consumed from the order and catalog subsystems.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{CustomerId, EventId, OrderId, Sku};
use inventory_store::{EventEnvelope, LineItem};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

pub const ORDER_CREATED: &str = "OrderCreated";
pub const ORDER_CANCELLED: &str = "OrderCancelled";
pub const PRODUCT_CHANGED: &str = "ProductChanged";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub order_id: OrderId,
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelledData {
    pub order_id: OrderId,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Catalog attributes of a product. Never carries stock quantities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductChangedData {
    pub sku: Sku,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    pub changed_at: DateTime<Utc>,
}

/// An inbound event, decoded from its envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    OrderCreated(OrderCreatedData),
    OrderCancelled(OrderCancelledData),
    ProductChanged(ProductChangedData),
}

type Decoder = fn(serde_json::Value) -> Result<InboundEvent>;

/// Event type name to payload decoder.
const DECODERS: &[(&str, Decoder)] = &[
    (ORDER_CREATED, decode_order_created),
    (ORDER_CANCELLED, decode_order_cancelled),
    (PRODUCT_CHANGED, decode_product_changed),
];

fn decode_order_created(payload: serde_json::Value) -> Result<InboundEvent> {
    Ok(InboundEvent::OrderCreated(serde_json::from_value(payload)?))
}

fn decode_order_cancelled(payload: serde_json::Value) -> Result<InboundEvent> {
    Ok(InboundEvent::OrderCancelled(serde_json::from_value(payload)?))
}

fn decode_product_changed(payload: serde_json::Value) -> Result<InboundEvent> {
    Ok(InboundEvent::ProductChanged(serde_json::from_value(payload)?))
}

impl InboundEvent {
    /// Decodes the envelope's payload according to its event type.
    pub fn decode(envelope: &EventEnvelope) -> Result<Self> {
        let (_, decode) = DECODERS
            .iter()
            .find(|(event_type, _)| *event_type == envelope.event_type)
            .ok_or_else(|| SyncError::UnknownEventType(envelope.event_type.clone()))?;
        decode(envelope.payload.clone())
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            InboundEvent::OrderCreated(_) => ORDER_CREATED,
            InboundEvent::OrderCancelled(_) => ORDER_CANCELLED,
            InboundEvent::ProductChanged(_) => PRODUCT_CHANGED,
        }
    }

    pub fn partition_key(&self) -> &str {
        match self {
            InboundEvent::OrderCreated(data) => data.order_id.as_str(),
            InboundEvent::OrderCancelled(data) => data.order_id.as_str(),
            InboundEvent::ProductChanged(data) => data.sku.as_str(),
        }
    }

    /// Wraps the event in an envelope carrying the producer's event id.
    pub fn to_envelope(&self, event_id: EventId, at: DateTime<Utc>) -> Result<EventEnvelope> {
        let builder = EventEnvelope::builder(self.event_type(), self.partition_key())
            .event_id(event_id)
            .timestamp(at);
        let builder = match self {
            InboundEvent::OrderCreated(data) => builder.payload(data)?,
            InboundEvent::OrderCancelled(data) => builder.payload(data)?,
            InboundEvent::ProductChanged(data) => builder.payload(data)?,
        };
        Ok(builder.build())
    }
}
