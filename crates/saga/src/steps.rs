//! Saga types and their steps.

/// Saga type name for reserving an order's line items.
pub const RESERVATION_SAGA: &str = "OrderReservation";

/// Saga type name for releasing an order's stock on cancellation.
pub const CANCELLATION_SAGA: &str = "OrderCancellation";

pub const STEP_VALIDATE_INVENTORY: &str = "VALIDATING_INVENTORY";
pub const STEP_RESERVE_INVENTORY: &str = "RESERVING_INVENTORY";
pub const STEP_PUBLISH_EVENTS: &str = "PUBLISHING_EVENTS";
pub const STEP_RELEASE_INVENTORY: &str = "RELEASING_INVENTORY";

/// Forward steps of the reservation saga, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStep {
    /// Checks every line item against available stock without reserving.
    Validate,
    /// Reserves every line item.
    Reserve,
    /// Publishes one `InventoryReserved` per reservation.
    Publish,
}

impl ReservationStep {
    pub const ALL: [ReservationStep; 3] = [
        ReservationStep::Validate,
        ReservationStep::Reserve,
        ReservationStep::Publish,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReservationStep::Validate => STEP_VALIDATE_INVENTORY,
            ReservationStep::Reserve => STEP_RESERVE_INVENTORY,
            ReservationStep::Publish => STEP_PUBLISH_EVENTS,
        }
    }
}

impl std::fmt::Display for ReservationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
