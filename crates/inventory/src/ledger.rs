//! The stock ledger: the only writer of stock quantities.
//!
//! Every mutation is a single conditional update in the store, so concurrent
//! callers on the same SKU are linearized by storage, not by an in-process lock.
//! Operations are keyed by a reference id; a `(reference, movement type)` pair is
//! applied at most once, which makes replays harmless.

use std::sync::Arc;

use common::{Sku, WarehouseId};
use inventory_store::{
    InventoryStore, LedgerUpdate, MovementQuery, MovementType, StockChange, StockItem, StockLevel,
    StockMovement, StockStatus, StoreError, Thresholds,
};
use serde::Serialize;

use crate::clock::Clock;
use crate::error::{InventoryError, Result};
use crate::events::{InventoryEvent, LowStockData, OutOfStockData};
use crate::outbox::EventOutbox;

/// Alert severity derived from an item's available quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum AlertLevel {
    Normal,
    Low,
    Out,
}

impl AlertLevel {
    pub fn of(item: &StockItem) -> Self {
        if item.available == 0 {
            AlertLevel::Out
        } else if item.is_low() {
            AlertLevel::Low
        } else {
            AlertLevel::Normal
        }
    }

    /// The alert to publish for an item currently at this level, if any.
    pub fn alert(self, item: &StockItem) -> Option<InventoryEvent> {
        match self {
            AlertLevel::Normal => None,
            AlertLevel::Low => Some(InventoryEvent::LowStock(LowStockData {
                sku: item.sku.clone(),
                available: item.available,
                reorder_point: item.thresholds.reorder_point,
            })),
            AlertLevel::Out => Some(InventoryEvent::OutOfStock(OutOfStockData {
                sku: item.sku.clone(),
            })),
        }
    }
}

/// Result of an administrative adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Adjustment {
    pub before: i64,
    pub after: i64,
    pub item: StockItem,
}

/// Result of reconstructing an item's quantities from its movements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub sku: Sku,
    /// `available + reserved` as stored on the item.
    pub on_hand: i64,
    /// Sum of net movement deltas since creation.
    pub ledger_total: i64,
    pub movement_count: usize,
}

impl AuditReport {
    pub fn drift(&self) -> i64 {
        self.on_hand - self.ledger_total
    }

    pub fn is_consistent(&self) -> bool {
        self.drift() == 0
    }
}

/// Per-SKU quantity operations.
#[derive(Clone)]
pub struct StockLedger<S> {
    store: S,
    outbox: EventOutbox<S>,
}

impl<S: InventoryStore> StockLedger<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            outbox: EventOutbox::new(store.clone(), clock),
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Moves `qty` from available to reserved if enough is available.
    ///
    /// A replay with the same `reference_id` returns the current item without
    /// reserving again, unless that hold has since been released.
    #[tracing::instrument(skip(self), fields(sku = %sku))]
    pub async fn try_reserve(&self, sku: &Sku, qty: i64, reference_id: &str) -> Result<StockItem> {
        ensure_positive(qty)?;
        match self
            .apply(sku, StockChange::Reserve(qty), reference_id, None, "reserve")
            .await?
        {
            LedgerUpdate::Applied { after, .. } => Ok(after),
            LedgerUpdate::Duplicate => {
                let released = self
                    .movements(
                        MovementQuery::for_reference(reference_id)
                            .movement_type(MovementType::Release)
                            .limit(1),
                    )
                    .await?;
                if !released.is_empty() {
                    return Err(InventoryError::HoldReleased {
                        sku: sku.clone(),
                        reference_id: reference_id.to_string(),
                    });
                }
                self.get_item(sku).await
            }
            LedgerUpdate::Rejected(item) if item.status != StockStatus::Active => {
                Err(InventoryError::ItemNotActive {
                    sku: sku.clone(),
                    status: item.status,
                })
            }
            LedgerUpdate::Rejected(item) => Err(InventoryError::InsufficientStock {
                sku: sku.clone(),
                requested: qty,
                available: item.available,
            }),
        }
    }

    /// Consumes `qty` reserved units. Fails with `LedgerInconsistency` if fewer
    /// are reserved.
    #[tracing::instrument(skip(self), fields(sku = %sku))]
    pub async fn confirm(&self, sku: &Sku, qty: i64, reference_id: &str) -> Result<StockItem> {
        ensure_positive(qty)?;
        match self
            .apply(sku, StockChange::Confirm(qty), reference_id, None, "confirm")
            .await?
        {
            LedgerUpdate::Applied { after, .. } => Ok(after),
            LedgerUpdate::Duplicate => self.get_item(sku).await,
            LedgerUpdate::Rejected(item) => Err(InventoryError::LedgerInconsistency {
                sku: sku.clone(),
                detail: format!("confirm {qty} with only {} reserved", item.reserved),
            }),
        }
    }

    /// Returns `qty` reserved units to available. A replay is a no-op.
    #[tracing::instrument(skip(self), fields(sku = %sku))]
    pub async fn release(&self, sku: &Sku, qty: i64, reference_id: &str) -> Result<StockItem> {
        ensure_positive(qty)?;
        match self
            .apply(sku, StockChange::Release(qty), reference_id, None, "release")
            .await?
        {
            LedgerUpdate::Applied { after, .. } => Ok(after),
            LedgerUpdate::Duplicate => self.get_item(sku).await,
            LedgerUpdate::Rejected(item) => Err(InventoryError::LedgerInconsistency {
                sku: sku.clone(),
                detail: format!("release {qty} with only {} reserved", item.reserved),
            }),
        }
    }

    /// Overwrites available with a counted value.
    #[tracing::instrument(skip(self), fields(sku = %sku))]
    pub async fn adjust(&self, sku: &Sku, new_available: i64, reason: &str) -> Result<Adjustment> {
        if new_available < 0 {
            return Err(InventoryError::InvalidQuantity(new_available));
        }
        let reference_id = format!("adjustment-{}", uuid::Uuid::new_v4());
        match self
            .apply(
                sku,
                StockChange::Adjust { new_available },
                &reference_id,
                Some(reason),
                "adjust",
            )
            .await?
        {
            LedgerUpdate::Applied { before, after, .. } => {
                tracing::info!(before = before.available, after = after.available, reason, "stock adjusted");
                Ok(Adjustment {
                    before: before.available,
                    after: after.available,
                    item: after,
                })
            }
            LedgerUpdate::Duplicate | LedgerUpdate::Rejected(_) => {
                Err(InventoryError::InvalidQuantity(new_available))
            }
        }
    }

    /// Books a stock receipt, creating the item on its first receipt.
    #[tracing::instrument(skip(self), fields(sku = %sku))]
    pub async fn receive(
        &self,
        sku: &Sku,
        warehouse_id: WarehouseId,
        qty: i64,
        reference_id: &str,
    ) -> Result<StockItem> {
        ensure_positive(qty)?;
        let change = StockChange::Receive { qty, warehouse_id };
        match self.apply(sku, change, reference_id, None, "receive").await? {
            LedgerUpdate::Applied { after, .. } => Ok(after),
            LedgerUpdate::Duplicate => self.get_item(sku).await,
            LedgerUpdate::Rejected(_) => Err(InventoryError::InvalidQuantity(qty)),
        }
    }

    /// Puts `qty` units back on the shelf without touching supplier incoming,
    /// e.g. when a confirmed order is undone.
    #[tracing::instrument(skip(self), fields(sku = %sku))]
    pub async fn restock(&self, sku: &Sku, qty: i64, reference_id: &str) -> Result<StockItem> {
        ensure_positive(qty)?;
        match self
            .apply(sku, StockChange::Restock(qty), reference_id, None, "restock")
            .await?
        {
            LedgerUpdate::Applied { after, .. } => Ok(after),
            LedgerUpdate::Duplicate => self.get_item(sku).await,
            LedgerUpdate::Rejected(_) => Err(InventoryError::InvalidQuantity(qty)),
        }
    }

    /// Records `qty` units on order from a supplier.
    #[tracing::instrument(skip(self), fields(sku = %sku))]
    pub async fn expect_incoming(&self, sku: &Sku, qty: i64) -> Result<StockItem> {
        ensure_positive(qty)?;
        self.store
            .add_incoming(sku, qty)
            .await
            .map_err(|e| not_found_as_item(e, sku))
    }

    /// Ships `qty` units directly from available stock.
    #[tracing::instrument(skip(self), fields(sku = %sku))]
    pub async fn issue(&self, sku: &Sku, qty: i64, reference_id: &str) -> Result<StockItem> {
        ensure_positive(qty)?;
        match self
            .apply(sku, StockChange::Issue(qty), reference_id, None, "issue")
            .await?
        {
            LedgerUpdate::Applied { after, .. } => Ok(after),
            LedgerUpdate::Duplicate => self.get_item(sku).await,
            LedgerUpdate::Rejected(item) => Err(InventoryError::InsufficientStock {
                sku: sku.clone(),
                requested: qty,
                available: item.available,
            }),
        }
    }

    #[tracing::instrument(skip(self), fields(sku = %sku))]
    pub async fn set_status(&self, sku: &Sku, status: StockStatus) -> Result<StockItem> {
        self.store
            .set_status(sku, status)
            .await
            .map_err(|e| not_found_as_item(e, sku))
    }

    #[tracing::instrument(skip(self), fields(sku = %sku))]
    pub async fn set_thresholds(&self, sku: &Sku, thresholds: Thresholds) -> Result<StockItem> {
        self.store
            .set_thresholds(sku, thresholds)
            .await
            .map_err(|e| not_found_as_item(e, sku))
    }

    pub async fn get_item(&self, sku: &Sku) -> Result<StockItem> {
        self.store
            .get_item(sku)
            .await?
            .ok_or_else(|| InventoryError::StockItemNotFound(sku.clone()))
    }

    pub async fn get_stock_level(&self, sku: &Sku) -> Result<StockLevel> {
        Ok(self.get_item(sku).await?.level())
    }

    pub async fn movements(&self, query: MovementQuery) -> Result<Vec<StockMovement>> {
        Ok(self.store.movements(query).await?)
    }

    /// Reconstructs `available + reserved` from the movement history.
    #[tracing::instrument(skip(self), fields(sku = %sku))]
    pub async fn audit(&self, sku: &Sku) -> Result<AuditReport> {
        let item = self.get_item(sku).await?;
        let movements = self.movements(MovementQuery::for_sku(sku.clone())).await?;
        let report = AuditReport {
            sku: sku.clone(),
            on_hand: item.on_hand(),
            ledger_total: movements.iter().map(StockMovement::net_delta).sum(),
            movement_count: movements.len(),
        };
        if !report.is_consistent() {
            tracing::error!(drift = report.drift(), "ledger drift detected");
        }
        Ok(report)
    }

    async fn apply(
        &self,
        sku: &Sku,
        change: StockChange,
        reference_id: &str,
        reason: Option<&str>,
        operation: &'static str,
    ) -> Result<LedgerUpdate> {
        let update = self
            .store
            .apply_change(sku, change, reference_id, reason)
            .await
            .map_err(|e| not_found_as_item(e, sku))?;

        let outcome = match &update {
            LedgerUpdate::Applied { .. } => "applied",
            LedgerUpdate::Rejected(_) => "rejected",
            LedgerUpdate::Duplicate => "duplicate",
        };
        metrics::counter!(
            "inventory_ledger_operations_total",
            "operation" => operation,
            "outcome" => outcome
        )
        .increment(1);

        if let LedgerUpdate::Applied { before, after, .. } = &update {
            self.emit_alert(before, after).await;
        }
        Ok(update)
    }

    /// Emits an alert when the item moved to a worse alert level.
    async fn emit_alert(&self, before: &StockItem, after: &StockItem) {
        let level = AlertLevel::of(after);
        if level <= AlertLevel::of(before) {
            return;
        }
        if let Some(event) = level.alert(after) {
            tracing::info!(sku = %after.sku, available = after.available, ?level, "stock alert");
            self.outbox.record_or_warn(&event).await;
        }
    }
}

fn ensure_positive(qty: i64) -> Result<()> {
    if qty <= 0 {
        return Err(InventoryError::InvalidQuantity(qty));
    }
    Ok(())
}

fn not_found_as_item(err: StoreError, sku: &Sku) -> InventoryError {
    match err {
        StoreError::NotFound { .. } => InventoryError::StockItemNotFound(sku.clone()),
        other => InventoryError::Store(other),
    }
}
