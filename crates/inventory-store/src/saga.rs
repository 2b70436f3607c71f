//! Persisted saga progress.

use chrono::{DateTime, Utc};
use common::{CustomerId, OrderId, ReservationId, SagaId, Sku};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Version number of a saga row, used for optimistic concurrency control.
///
/// Versions start at 1 when the row is inserted and increment on every save.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the first version (1) of a freshly inserted row.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Running ──┬──► Completed
///           └──► Failed ──► Compensating ──► Compensated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Saga steps are being executed.
    #[default]
    Running,

    /// All steps completed successfully (terminal state).
    Completed,

    /// A step failed; compensation has not finished yet.
    Failed,

    /// Compensating actions are in progress.
    Compensating,

    /// Compensation finished after a failure (terminal state).
    Compensated,
}

impl SagaStatus {
    /// Returns true if forward steps may still run.
    pub fn can_run(&self) -> bool {
        matches!(self, SagaStatus::Running)
    }

    /// Returns true if the saga can begin (or resume) compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaStatus::Failed | SagaStatus::Compensating)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Compensated)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "RUNNING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Compensated => "COMPENSATED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(SagaStatus::Running),
            "COMPLETED" => Ok(SagaStatus::Completed),
            "FAILED" => Ok(SagaStatus::Failed),
            "COMPENSATING" => Ok(SagaStatus::Compensating),
            "COMPENSATED" => Ok(SagaStatus::Compensated),
            other => Err(StoreError::Corrupt(format!("unknown saga status {other}"))),
        }
    }
}

/// One requested order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub sku: Sku,
    pub quantity: i64,
}

impl LineItem {
    pub fn new(sku: impl Into<Sku>, quantity: i64) -> Self {
        Self {
            sku: sku.into(),
            quantity,
        }
    }
}

/// Durable progress record of one saga execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub id: SagaId,
    /// The order this saga works for.
    pub correlation_id: OrderId,
    pub saga_type: String,
    pub status: SagaStatus,
    /// Names of completed forward steps, in execution order.
    pub completed_steps: Vec<String>,
    pub line_items: Vec<LineItem>,
    pub customer_id: Option<CustomerId>,
    pub reservation_ids: Vec<ReservationId>,
    pub failure_reason: Option<String>,
    /// How many times crash recovery has re-driven this saga.
    pub recovery_attempts: u32,
    /// Set when the saga needs manual reconciliation.
    pub needs_attention: bool,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    /// Creates a running saga record at version 1.
    pub fn start(
        correlation_id: OrderId,
        saga_type: impl Into<String>,
        line_items: Vec<LineItem>,
        customer_id: Option<CustomerId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SagaId::new(),
            correlation_id,
            saga_type: saga_type.into(),
            status: SagaStatus::Running,
            completed_steps: Vec::new(),
            line_items,
            customer_id,
            reservation_ids: Vec::new(),
            failure_reason: None,
            recovery_attempts: 0,
            needs_attention: false,
            version: Version::first(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the most recently completed forward step.
    pub fn last_completed_step(&self) -> Option<&str> {
        self.completed_steps.last().map(String::as_str)
    }

    pub fn has_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }
}
