//! Stock ledger and reservation lifecycle.
//!
//! - [`StockLedger`] is the only writer of stock quantities
//! - [`ReservationManager`] reserves, confirms and cancels holds on top of it
//! - [`ExpirationReconciler`] expires abandoned reservations and finishes
//!   interrupted settlements
//!
//! Outbound events go through the [`EventOutbox`] after the state change commits.

pub mod clock;
pub mod error;
pub mod events;
pub mod ledger;
pub mod outbox;
pub mod reconciler;
pub mod reservation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{InventoryError, Result};
pub use events::{
    InventoryConfirmedData, InventoryEvent, InventoryReleasedData, InventoryReservedData,
    LowStockData, OutOfStockData,
};
pub use ledger::{Adjustment, AlertLevel, AuditReport, StockLedger};
pub use outbox::EventOutbox;
pub use reconciler::{ExpirationReconciler, ReconcilerSettings, SweepReport};
pub use reservation::{
    CANCELLED_REASON, COMPENSATED_REASON, EXPIRED_REASON, ReservationManager, ReservationPolicy,
    ReserveRequest,
};
