//! Inbound event ingestion.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::EventId;
use inventory::Clock;
use inventory_store::{EventEnvelope, InventoryStore};
use serde::Deserialize;
use sync::Disposition;

use crate::AppState;
use crate::error::ApiError;

/// An event delivered by the order or catalog subsystem.
#[derive(Deserialize)]
pub struct InboundEventRequest {
    /// Producer-assigned id; redeliveries carry the same one.
    pub event_id: EventId,
    pub event_type: String,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

impl InboundEventRequest {
    fn into_envelope(self, received_at: DateTime<Utc>) -> EventEnvelope {
        EventEnvelope::builder(self.event_type, self.partition_key.unwrap_or_default())
            .event_id(self.event_id)
            .timestamp(self.timestamp.unwrap_or(received_at))
            .payload_raw(self.payload)
            .build()
    }
}

/// POST /events — hands one inbound event to the synchronizer.
///
/// 200 when applied or already processed, 422 when the event can never be
/// applied, 503 when the sender should redeliver it.
#[tracing::instrument(skip(state, req))]
pub async fn ingest<S: InventoryStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<InboundEventRequest>,
) -> Result<(StatusCode, Json<Disposition>), ApiError> {
    let envelope = req.into_envelope(state.clock.now());
    let disposition = state.synchronizer.handle(&envelope).await?;
    let status = match disposition {
        Disposition::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Disposition::Applied | Disposition::Duplicate => StatusCode::OK,
    };
    Ok((status, Json(disposition)))
}
