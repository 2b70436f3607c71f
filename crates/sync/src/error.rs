//! Synchronizer error types.

use inventory_store::StoreError;
use saga::SagaError;
use thiserror::Error;

/// Errors that can occur while handling inbound or outbound events.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No handler is registered for the inbound event type.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Failed to deserialize an event payload.
    #[error("Event deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The downstream transport refused or lost an outbound event.
    #[error("Publish of {event_type} failed: {reason}")]
    PublishFailed { event_type: String, reason: String },

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Returns true if redelivering the same event may succeed.
    ///
    /// Malformed events and order rejections fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::UnknownEventType(_) | SyncError::Deserialization(_) => false,
            SyncError::Saga(SagaError::InvalidOrder(_)) => false,
            _ => true,
        }
    }
}

/// Result type for synchronizer operations.
pub type Result<T> = std::result::Result<T, SyncError>;
