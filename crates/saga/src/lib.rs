//! Order sagas over the reservation manager.
//!
//! The reservation saga follows these steps:
//! 1. Validate every line item against available stock
//! 2. Reserve every line item
//! 3. Publish `InventoryReserved` per reservation
//!
//! If any step fails, the reservations already created for the order are
//! released. The cancellation saga releases (or returns) everything held for an
//! order. Saga progress is persisted after every step and resumed on restart.

pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod retry;
pub mod steps;

pub use error::{Result, SagaError, Shortfall};
pub use orchestrator::{RecoveryReport, SagaOrchestrator, SagaOutcome, SagaSettings};
pub use pool::SagaWorkerPool;
pub use retry::{RetryConfig, run_step};
pub use steps::{
    CANCELLATION_SAGA, RESERVATION_SAGA, ReservationStep, STEP_PUBLISH_EVENTS,
    STEP_RELEASE_INVENTORY, STEP_RESERVE_INVENTORY, STEP_VALIDATE_INVENTORY,
};
