//! Persisted inventory rows: stock items, movements and reservations.

use chrono::{DateTime, Utc};
use common::{CustomerId, OrderId, ReservationId, Sku, WarehouseId};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Lifecycle status of a stock item. Items are never deleted, only discontinued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockStatus {
    #[default]
    Active,
    Inactive,
    Discontinued,
}

impl StockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::Active => "ACTIVE",
            StockStatus::Inactive => "INACTIVE",
            StockStatus::Discontinued => "DISCONTINUED",
        }
    }
}

impl std::fmt::Display for StockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StockStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(StockStatus::Active),
            "INACTIVE" => Ok(StockStatus::Inactive),
            "DISCONTINUED" => Ok(StockStatus::Discontinued),
            other => Err(StoreError::Corrupt(format!("unknown stock status {other}"))),
        }
    }
}

/// Replenishment thresholds for a stock item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Crossing this level downward raises a low-stock alert.
    pub reorder_point: i64,
    pub min_level: i64,
    pub max_level: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            reorder_point: 10,
            min_level: 0,
            max_level: 1_000,
        }
    }
}

/// Quantity state for one SKU in one warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItem {
    pub sku: Sku,
    pub warehouse_id: WarehouseId,
    pub available: i64,
    pub reserved: i64,
    pub incoming: i64,
    pub thresholds: Thresholds,
    pub status: StockStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StockItem {
    /// Creates an empty, active stock item.
    pub fn new(sku: Sku, warehouse_id: WarehouseId, now: DateTime<Utc>) -> Self {
        Self {
            sku,
            warehouse_id,
            available: 0,
            reserved: 0,
            incoming: 0,
            thresholds: Thresholds::default(),
            status: StockStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Physical units held: available plus reserved.
    pub fn on_hand(&self) -> i64 {
        self.available + self.reserved
    }

    /// Returns the public quantity view of this item.
    pub fn level(&self) -> StockLevel {
        StockLevel {
            sku: self.sku.clone(),
            available: self.available,
            reserved: self.reserved,
            incoming: self.incoming,
        }
    }

    /// Returns true if available stock is at or below the reorder point.
    pub fn is_low(&self) -> bool {
        self.available <= self.thresholds.reorder_point
    }
}

/// Quantity snapshot returned by stock level queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub sku: Sku,
    pub available: i64,
    pub reserved: i64,
    pub incoming: i64,
}

/// Kind of ledger movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Inbound,
    Outbound,
    Adjustment,
    Reserve,
    Release,
    Confirm,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Inbound => "INBOUND",
            MovementType::Outbound => "OUTBOUND",
            MovementType::Adjustment => "ADJUSTMENT",
            MovementType::Reserve => "RESERVE",
            MovementType::Release => "RELEASE",
            MovementType::Confirm => "CONFIRM",
        }
    }
}

impl std::fmt::Display for MovementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MovementType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INBOUND" => Ok(MovementType::Inbound),
            "OUTBOUND" => Ok(MovementType::Outbound),
            "ADJUSTMENT" => Ok(MovementType::Adjustment),
            "RESERVE" => Ok(MovementType::Reserve),
            "RELEASE" => Ok(MovementType::Release),
            "CONFIRM" => Ok(MovementType::Confirm),
            other => Err(StoreError::Corrupt(format!("unknown movement type {other}"))),
        }
    }
}

/// An immutable, append-only ledger entry.
///
/// `available_delta + reserved_delta` summed over an item's movements equals its
/// current `available + reserved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    /// Store-assigned, monotonically increasing id.
    pub id: i64,
    pub sku: Sku,
    pub movement_type: MovementType,
    pub quantity: i64,
    pub available_delta: i64,
    pub reserved_delta: i64,
    pub available_after: i64,
    pub reserved_after: i64,
    /// Order, reservation or receipt this movement belongs to.
    pub reference_id: String,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl StockMovement {
    /// Net change to on-hand stock.
    pub fn net_delta(&self) -> i64 {
        self.available_delta + self.reserved_delta
    }
}

/// A requested quantity change, evaluated atomically against the current row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockChange {
    /// Move `qty` from available to reserved if `available >= qty`.
    Reserve(i64),
    /// Consume `qty` reserved units if `reserved >= qty`.
    Confirm(i64),
    /// Move `qty` from reserved back to available if `reserved >= qty`.
    Release(i64),
    /// Ship `qty` units straight from available if `available >= qty`.
    Issue(i64),
    /// Return `qty` units to available without consuming supplier incoming.
    Restock(i64),
    /// Add `qty` units to available, creating the item on first receipt.
    Receive { qty: i64, warehouse_id: WarehouseId },
    /// Overwrite available with an administratively counted value.
    Adjust { new_available: i64 },
}

impl StockChange {
    pub fn movement_type(&self) -> MovementType {
        match self {
            StockChange::Reserve(_) => MovementType::Reserve,
            StockChange::Confirm(_) => MovementType::Confirm,
            StockChange::Release(_) => MovementType::Release,
            StockChange::Issue(_) => MovementType::Outbound,
            StockChange::Restock(_) | StockChange::Receive { .. } => MovementType::Inbound,
            StockChange::Adjust { .. } => MovementType::Adjustment,
        }
    }

    /// Magnitude recorded on the movement row.
    pub fn quantity(&self, item: &StockItem) -> i64 {
        match self {
            StockChange::Reserve(q)
            | StockChange::Confirm(q)
            | StockChange::Release(q)
            | StockChange::Issue(q)
            | StockChange::Restock(q) => *q,
            StockChange::Receive { qty, .. } => *qty,
            StockChange::Adjust { new_available } => (new_available - item.available).abs(),
        }
    }

    /// Returns `(available_delta, reserved_delta)` if the change may be applied to
    /// `item`, or `None` if its precondition does not hold.
    pub fn deltas(&self, item: &StockItem) -> Option<(i64, i64)> {
        match self {
            StockChange::Reserve(q) => (item.status == StockStatus::Active
                && *q > 0
                && item.available >= *q)
                .then_some((-q, *q)),
            StockChange::Confirm(q) => (*q > 0 && item.reserved >= *q).then_some((0, -q)),
            StockChange::Release(q) => (*q > 0 && item.reserved >= *q).then_some((*q, -q)),
            StockChange::Issue(q) => (*q > 0 && item.available >= *q).then_some((-q, 0)),
            StockChange::Restock(q) => (*q > 0).then_some((*q, 0)),
            StockChange::Receive { qty, .. } => (*qty > 0).then_some((*qty, 0)),
            StockChange::Adjust { new_available } => {
                (*new_available >= 0).then_some((new_available - item.available, 0))
            }
        }
    }

    /// Applies the change to `item` in place. Returns false if the precondition fails.
    pub fn apply_to(&self, item: &mut StockItem, now: DateTime<Utc>) -> bool {
        let Some((available_delta, reserved_delta)) = self.deltas(item) else {
            return false;
        };
        item.available += available_delta;
        item.reserved += reserved_delta;
        if let StockChange::Receive { qty, .. } = self {
            item.incoming = (item.incoming - qty).max(0);
        }
        item.updated_at = now;
        true
    }
}

/// Outcome of a conditional ledger update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerUpdate {
    /// The change was applied and its movement appended.
    Applied {
        before: StockItem,
        after: StockItem,
        movement: StockMovement,
    },
    /// The precondition did not hold; the item is returned unchanged.
    Rejected(StockItem),
    /// A movement with the same reference and type was already applied.
    Duplicate,
}

/// Lifecycle state of a reservation.
///
/// ```text
/// Active ──┬──► Confirmed
///          ├──► Cancelled
///          └──► Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Active,
    Confirmed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }

    /// Returns true if the terminal state gives the reserved units back.
    pub fn releases_stock(&self) -> bool {
        matches!(self, ReservationStatus::Cancelled | ReservationStatus::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(ReservationStatus::Active),
            "CONFIRMED" => Ok(ReservationStatus::Confirmed),
            "CANCELLED" => Ok(ReservationStatus::Cancelled),
            "EXPIRED" => Ok(ReservationStatus::Expired),
            other => Err(StoreError::Corrupt(format!(
                "unknown reservation status {other}"
            ))),
        }
    }
}

/// A temporary hold on available stock for one order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub sku: Sku,
    pub order_id: OrderId,
    pub customer_id: Option<CustomerId>,
    pub quantity: i64,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    /// Why the reservation reached its terminal state.
    pub reason: Option<String>,
    /// Whether the ledger effect of the current status has been applied.
    pub settled: bool,
    /// Set when settlement keeps failing; the reconciler stops retrying it.
    #[serde(default)]
    pub needs_attention: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// Creates an active reservation whose stock has already been reserved.
    pub fn active(
        id: ReservationId,
        sku: Sku,
        order_id: OrderId,
        customer_id: Option<CustomerId>,
        quantity: i64,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sku,
            order_id,
            customer_id,
            quantity,
            status: ReservationStatus::Active,
            expires_at,
            reason: None,
            settled: true,
            needs_attention: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}
