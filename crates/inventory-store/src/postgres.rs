use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{CustomerId, EventId, OrderId, ReservationId, SagaId, Sku, WarehouseId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    EventEnvelope, LedgerUpdate, MovementQuery, OutboxMessage, OutboxStatus, Reservation,
    ReservationStatus, Result, SagaRecord, StockChange, StockItem, StockMovement, StockStatus,
    StoreError, Thresholds, Version,
    store::{InboxStore, OutboxStore, ReservationStore, SagaStore, StockStore},
};

const ITEM_COLUMNS: &str = "sku, warehouse_id, available, reserved, incoming, reorder_point, \
     min_level, max_level, status, created_at, updated_at";

const MOVEMENT_COLUMNS: &str = "id, sku, movement_type, quantity, available_delta, \
     reserved_delta, available_after, reserved_after, reference_id, reason, recorded_at";

const RESERVATION_COLUMNS: &str = "id, sku, order_id, customer_id, quantity, status, \
     expires_at, reason, settled, needs_attention, created_at, updated_at";

const SAGA_COLUMNS: &str = "id, correlation_id, saga_type, status, completed_steps, line_items, \
     customer_id, reservation_ids, failure_reason, recovery_attempts, needs_attention, version, \
     created_at, updated_at";

const OUTBOX_COLUMNS: &str = "id, event_id, event_type, partition_key, sequence, occurred_at, \
     payload, metadata, status, attempts, locked_by, locked_until, next_attempt_at, \
     published_at, last_error";

/// PostgreSQL-backed inventory store implementation.
#[derive(Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
}

impl PostgresInventoryStore {
    /// Creates a new PostgreSQL inventory store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_item(row: &PgRow) -> Result<StockItem> {
        Ok(StockItem {
            sku: Sku::new(row.try_get::<String, _>("sku")?),
            warehouse_id: WarehouseId::new(row.try_get::<String, _>("warehouse_id")?),
            available: row.try_get("available")?,
            reserved: row.try_get("reserved")?,
            incoming: row.try_get("incoming")?,
            thresholds: Thresholds {
                reorder_point: row.try_get("reorder_point")?,
                min_level: row.try_get("min_level")?,
                max_level: row.try_get("max_level")?,
            },
            status: row.try_get::<String, _>("status")?.parse()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_movement(row: &PgRow) -> Result<StockMovement> {
        Ok(StockMovement {
            id: row.try_get("id")?,
            sku: Sku::new(row.try_get::<String, _>("sku")?),
            movement_type: row.try_get::<String, _>("movement_type")?.parse()?,
            quantity: row.try_get("quantity")?,
            available_delta: row.try_get("available_delta")?,
            reserved_delta: row.try_get("reserved_delta")?,
            available_after: row.try_get("available_after")?,
            reserved_after: row.try_get("reserved_after")?,
            reference_id: row.try_get("reference_id")?,
            reason: row.try_get("reason")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn row_to_reservation(row: &PgRow) -> Result<Reservation> {
        Ok(Reservation {
            id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id")?),
            sku: Sku::new(row.try_get::<String, _>("sku")?),
            order_id: OrderId::new(row.try_get::<String, _>("order_id")?),
            customer_id: row
                .try_get::<Option<String>, _>("customer_id")?
                .map(CustomerId::new),
            quantity: row.try_get("quantity")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            expires_at: row.try_get("expires_at")?,
            reason: row.try_get("reason")?,
            settled: row.try_get("settled")?,
            needs_attention: row.try_get("needs_attention")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_saga(row: &PgRow) -> Result<SagaRecord> {
        Ok(SagaRecord {
            id: SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            correlation_id: OrderId::new(row.try_get::<String, _>("correlation_id")?),
            saga_type: row.try_get("saga_type")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            completed_steps: serde_json::from_value(row.try_get("completed_steps")?)?,
            line_items: serde_json::from_value(row.try_get("line_items")?)?,
            customer_id: row
                .try_get::<Option<String>, _>("customer_id")?
                .map(CustomerId::new),
            reservation_ids: serde_json::from_value(row.try_get("reservation_ids")?)?,
            failure_reason: row.try_get("failure_reason")?,
            recovery_attempts: row.try_get::<i32, _>("recovery_attempts")?.max(0) as u32,
            needs_attention: row.try_get("needs_attention")?,
            version: Version::new(row.try_get("version")?),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_outbox(row: &PgRow) -> Result<OutboxMessage> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let envelope = EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            event_type: row.try_get("event_type")?,
            partition_key: row.try_get("partition_key")?,
            timestamp: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
            metadata: serde_json::from_value(metadata_json)?,
        };
        Ok(OutboxMessage {
            id: row.try_get("id")?,
            envelope,
            sequence: row.try_get("sequence")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            attempts: row.try_get::<i32, _>("attempts")?.max(0) as u32,
            locked_by: row.try_get("locked_by")?,
            locked_until: row.try_get("locked_until")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            published_at: row.try_get("published_at")?,
            last_error: row.try_get("last_error")?,
        })
    }

    async fn fetch_item(tx: &mut Transaction<'_, Postgres>, sku: &Sku) -> Result<StockItem> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM stock_items WHERE sku = $1"
        ))
        .bind(sku.as_str())
        .fetch_optional(&mut **tx)
        .await?;
        match row {
            Some(row) => Self::row_to_item(&row),
            None => Err(StoreError::not_found("stock item", sku)),
        }
    }

    async fn already_applied(
        tx: &mut Transaction<'_, Postgres>,
        reference_id: &str,
        change: &StockChange,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM stock_movements WHERE reference_id = $1 AND movement_type = $2)",
        )
        .bind(reference_id)
        .bind(change.movement_type().as_str())
        .fetch_one(&mut **tx)
        .await?;
        Ok(exists)
    }

    /// Appends the movement for `before -> after`. Returns `None` if a concurrent
    /// transaction already recorded the same reference and type.
    async fn append_movement(
        tx: &mut Transaction<'_, Postgres>,
        change: &StockChange,
        before: &StockItem,
        after: &StockItem,
        reference_id: &str,
        reason: Option<&str>,
    ) -> Result<Option<StockMovement>> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO stock_movements (sku, movement_type, quantity, available_delta,
                reserved_delta, available_after, reserved_after, reference_id, reason, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT ON CONSTRAINT unique_movement_reference DO NOTHING
            RETURNING {MOVEMENT_COLUMNS}
            "#
        ))
        .bind(after.sku.as_str())
        .bind(change.movement_type().as_str())
        .bind(change.quantity(before))
        .bind(after.available - before.available)
        .bind(after.reserved - before.reserved)
        .bind(after.available)
        .bind(after.reserved)
        .bind(reference_id)
        .bind(reason)
        .bind(after.updated_at)
        .fetch_optional(&mut **tx)
        .await?;
        row.as_ref().map(Self::row_to_movement).transpose()
    }

    /// Reserve, confirm, release, issue and restock: a single conditional update whose
    /// WHERE clause carries the precondition.
    async fn apply_conditional(
        &self,
        sku: &Sku,
        change: StockChange,
        quantity: i64,
        deltas: (i64, i64),
        reference_id: &str,
        reason: Option<&str>,
    ) -> Result<LedgerUpdate> {
        let mut tx = self.pool.begin().await?;
        if Self::already_applied(&mut tx, reference_id, &change).await? {
            return Ok(LedgerUpdate::Duplicate);
        }
        if quantity <= 0 {
            return Ok(LedgerUpdate::Rejected(Self::fetch_item(&mut tx, sku).await?));
        }

        let (available_delta, reserved_delta) = deltas;
        let requires_active = matches!(change, StockChange::Reserve(_));
        let row = sqlx::query(&format!(
            r#"
            UPDATE stock_items
            SET available = available + $2, reserved = reserved + $3, updated_at = $4
            WHERE sku = $1
              AND available + $2 >= 0
              AND reserved + $3 >= 0
              AND (NOT $5 OR status = 'ACTIVE')
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(sku.as_str())
        .bind(available_delta)
        .bind(reserved_delta)
        .bind(Utc::now())
        .bind(requires_active)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(LedgerUpdate::Rejected(Self::fetch_item(&mut tx, sku).await?));
        };
        let after = Self::row_to_item(&row)?;
        let mut before = after.clone();
        before.available -= available_delta;
        before.reserved -= reserved_delta;

        match Self::append_movement(&mut tx, &change, &before, &after, reference_id, reason)
            .await?
        {
            Some(movement) => {
                tx.commit().await?;
                Ok(LedgerUpdate::Applied {
                    before,
                    after,
                    movement,
                })
            }
            None => {
                tx.rollback().await?;
                tracing::debug!(%sku, reference_id, "duplicate movement lost insert race");
                Ok(LedgerUpdate::Duplicate)
            }
        }
    }

    /// Receipts and adjustments: lock the row, compute the new quantities in
    /// process, write them back.
    async fn apply_locked(
        &self,
        sku: &Sku,
        change: StockChange,
        reference_id: &str,
        reason: Option<&str>,
    ) -> Result<LedgerUpdate> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        if Self::already_applied(&mut tx, reference_id, &change).await? {
            return Ok(LedgerUpdate::Duplicate);
        }

        if let StockChange::Receive { warehouse_id, .. } = &change {
            sqlx::query(
                r#"
                INSERT INTO stock_items (sku, warehouse_id, created_at, updated_at)
                VALUES ($1, $2, $3, $3)
                ON CONFLICT (sku) DO NOTHING
                "#,
            )
            .bind(sku.as_str())
            .bind(warehouse_id.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM stock_items WHERE sku = $1 FOR UPDATE"
        ))
        .bind(sku.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found("stock item", sku))?;

        let before = Self::row_to_item(&row)?;
        let mut after = before.clone();
        if !change.apply_to(&mut after, now) {
            tx.rollback().await?;
            return Ok(LedgerUpdate::Rejected(before));
        }

        sqlx::query(
            r#"
            UPDATE stock_items
            SET available = $2, reserved = $3, incoming = $4, updated_at = $5
            WHERE sku = $1
            "#,
        )
        .bind(sku.as_str())
        .bind(after.available)
        .bind(after.reserved)
        .bind(after.incoming)
        .bind(after.updated_at)
        .execute(&mut *tx)
        .await?;

        match Self::append_movement(&mut tx, &change, &before, &after, reference_id, reason)
            .await?
        {
            Some(movement) => {
                tx.commit().await?;
                Ok(LedgerUpdate::Applied {
                    before,
                    after,
                    movement,
                })
            }
            None => {
                tx.rollback().await?;
                Ok(LedgerUpdate::Duplicate)
            }
        }
    }
}

#[async_trait]
impl StockStore for PostgresInventoryStore {
    async fn apply_change(
        &self,
        sku: &Sku,
        change: StockChange,
        reference_id: &str,
        reason: Option<&str>,
    ) -> Result<LedgerUpdate> {
        match change {
            StockChange::Reserve(q) => {
                self.apply_conditional(sku, change, q, (-q, q), reference_id, reason)
                    .await
            }
            StockChange::Confirm(q) => {
                self.apply_conditional(sku, change, q, (0, -q), reference_id, reason)
                    .await
            }
            StockChange::Release(q) => {
                self.apply_conditional(sku, change, q, (q, -q), reference_id, reason)
                    .await
            }
            StockChange::Issue(q) => {
                self.apply_conditional(sku, change, q, (-q, 0), reference_id, reason)
                    .await
            }
            StockChange::Restock(q) => {
                self.apply_conditional(sku, change, q, (q, 0), reference_id, reason)
                    .await
            }
            StockChange::Receive { .. } | StockChange::Adjust { .. } => {
                self.apply_locked(sku, change, reference_id, reason).await
            }
        }
    }

    async fn add_incoming(&self, sku: &Sku, qty: i64) -> Result<StockItem> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE stock_items SET incoming = incoming + $2, updated_at = NOW()
            WHERE sku = $1
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(sku.as_str())
        .bind(qty)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Self::row_to_item(&row),
            None => Err(StoreError::not_found("stock item", sku)),
        }
    }

    async fn set_status(&self, sku: &Sku, status: StockStatus) -> Result<StockItem> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE stock_items SET status = $2, updated_at = NOW()
            WHERE sku = $1
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(sku.as_str())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Self::row_to_item(&row),
            None => Err(StoreError::not_found("stock item", sku)),
        }
    }

    async fn set_thresholds(&self, sku: &Sku, thresholds: Thresholds) -> Result<StockItem> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE stock_items
            SET reorder_point = $2, min_level = $3, max_level = $4, updated_at = NOW()
            WHERE sku = $1
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(sku.as_str())
        .bind(thresholds.reorder_point)
        .bind(thresholds.min_level)
        .bind(thresholds.max_level)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Self::row_to_item(&row),
            None => Err(StoreError::not_found("stock item", sku)),
        }
    }

    async fn get_item(&self, sku: &Sku) -> Result<Option<StockItem>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM stock_items WHERE sku = $1"
        ))
        .bind(sku.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn list_items(&self) -> Result<Vec<StockItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM stock_items ORDER BY sku ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_item).collect()
    }

    async fn movements(&self, query: MovementQuery) -> Result<Vec<StockMovement>> {
        let mut sql = format!("SELECT {MOVEMENT_COLUMNS} FROM stock_movements WHERE 1=1");
        let mut param_count = 0;

        if query.sku.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND sku = ${param_count}"));
        }
        if query.movement_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND movement_type = ANY(${param_count})"));
        }
        if query.reference_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND reference_id = ${param_count}"));
        }
        if query.from_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND recorded_at >= ${param_count}"));
        }
        if query.to_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND recorded_at <= ${param_count}"));
        }

        sql.push_str(" ORDER BY id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(sku) = query.sku {
            sqlx_query = sqlx_query.bind(sku.as_str().to_string());
        }
        if let Some(types) = query.movement_types {
            let names: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();
            sqlx_query = sqlx_query.bind(names);
        }
        if let Some(reference_id) = query.reference_id {
            sqlx_query = sqlx_query.bind(reference_id);
        }
        if let Some(from_ts) = query.from_timestamp {
            sqlx_query = sqlx_query.bind(from_ts);
        }
        if let Some(to_ts) = query.to_timestamp {
            sqlx_query = sqlx_query.bind(to_ts);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_movement).collect()
    }
}

#[async_trait]
impl ReservationStore for PostgresInventoryStore {
    async fn insert_reservation(&self, reservation: &Reservation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reservations (id, sku, order_id, customer_id, quantity, status,
                expires_at, reason, settled, needs_attention, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.sku.as_str())
        .bind(reservation.order_id.as_str())
        .bind(reservation.customer_id.as_ref().map(|c| c.as_str()))
        .bind(reservation.quantity)
        .bind(reservation.status.as_str())
        .bind(reservation.expires_at)
        .bind(reservation.reason.as_deref())
        .bind(reservation.settled)
        .bind(reservation.needs_attention)
        .bind(reservation.created_at)
        .bind(reservation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_reservation).transpose()
    }

    async fn reservations_for_order(&self, order_id: &OrderId) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE order_id = $1 ORDER BY created_at ASC"
        ))
        .bind(order_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_reservation).collect()
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS} FROM reservations
            WHERE status = 'ACTIVE' AND expires_at < $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_reservation).collect()
    }

    async fn unsettled_reservations(&self, limit: usize) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS} FROM reservations
            WHERE settled = FALSE AND needs_attention = FALSE AND status <> 'ACTIVE'
            ORDER BY updated_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_reservation).collect()
    }

    async fn transition_reservation(
        &self,
        id: ReservationId,
        from: ReservationStatus,
        to: ReservationStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Reservation>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE reservations
            SET status = $3, reason = $4, settled = FALSE, updated_at = $5
            WHERE id = $1 AND status = $2
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(reason)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_reservation(&row)?)),
            None if self.get_reservation(id).await?.is_some() => Ok(None),
            None => Err(StoreError::not_found("reservation", id)),
        }
    }

    async fn mark_settled(&self, id: ReservationId) -> Result<()> {
        let result = sqlx::query("UPDATE reservations SET settled = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("reservation", id));
        }
        Ok(())
    }

    async fn flag_reservation(&self, id: ReservationId) -> Result<()> {
        let result = sqlx::query("UPDATE reservations SET needs_attention = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("reservation", id));
        }
        Ok(())
    }
}

#[async_trait]
impl SagaStore for PostgresInventoryStore {
    async fn insert_saga(&self, saga: &SagaRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sagas (id, correlation_id, saga_type, status, completed_steps, line_items,
                customer_id, reservation_ids, failure_reason, recovery_attempts, needs_attention,
                version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT ON CONSTRAINT unique_saga_per_order DO NOTHING
            "#,
        )
        .bind(saga.id.as_uuid())
        .bind(saga.correlation_id.as_str())
        .bind(&saga.saga_type)
        .bind(saga.status.as_str())
        .bind(serde_json::to_value(&saga.completed_steps)?)
        .bind(serde_json::to_value(&saga.line_items)?)
        .bind(saga.customer_id.as_ref().map(|c| c.as_str()))
        .bind(serde_json::to_value(&saga.reservation_ids)?)
        .bind(saga.failure_reason.as_deref())
        .bind(saga.recovery_attempts as i32)
        .bind(saga.needs_attention)
        .bind(saga.version.as_i64())
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_saga(&self, saga: &SagaRecord, expected: Version) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET status = $3, completed_steps = $4, reservation_ids = $5, failure_reason = $6,
                recovery_attempts = $7, needs_attention = $8, version = $9, updated_at = $10
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(saga.id.as_uuid())
        .bind(expected.as_i64())
        .bind(saga.status.as_str())
        .bind(serde_json::to_value(&saga.completed_steps)?)
        .bind(serde_json::to_value(&saga.reservation_ids)?)
        .bind(saga.failure_reason.as_deref())
        .bind(saga.recovery_attempts as i32)
        .bind(saga.needs_attention)
        .bind(saga.version.as_i64())
        .bind(saga.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM sagas WHERE id = $1")
            .bind(saga.id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match actual {
            Some(actual) => Err(StoreError::ConcurrencyConflict {
                entity: "saga",
                id: saga.id.to_string(),
                expected,
                actual: Version::new(actual),
            }),
            None => Err(StoreError::not_found("saga", saga.id)),
        }
    }

    async fn get_saga(&self, id: SagaId) -> Result<Option<SagaRecord>> {
        let row = sqlx::query(&format!("SELECT {SAGA_COLUMNS} FROM sagas WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_saga).transpose()
    }

    async fn find_saga(&self, order_id: &OrderId, saga_type: &str) -> Result<Option<SagaRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM sagas WHERE correlation_id = $1 AND saga_type = $2"
        ))
        .bind(order_id.as_str())
        .bind(saga_type)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_saga).transpose()
    }

    async fn sagas_for_order(&self, order_id: &OrderId) -> Result<Vec<SagaRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM sagas WHERE correlation_id = $1 ORDER BY created_at ASC"
        ))
        .bind(order_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_saga).collect()
    }

    async fn unfinished_sagas(&self) -> Result<Vec<SagaRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAGA_COLUMNS} FROM sagas
            WHERE status NOT IN ('COMPLETED', 'COMPENSATED') AND needs_attention = FALSE
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_saga).collect()
    }
}

#[async_trait]
impl InboxStore for PostgresInventoryStore {
    async fn try_mark_processed(
        &self,
        event_id: EventId,
        event_type: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, event_type, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(event_type)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn unmark_processed(&self, event_id: EventId) -> Result<()> {
        sqlx::query("DELETE FROM processed_events WHERE event_id = $1")
            .bind(event_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_processed(&self, event_id: EventId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1)",
        )
        .bind(event_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl OutboxStore for PostgresInventoryStore {
    async fn enqueue(&self, envelope: EventEnvelope) -> Result<OutboxMessage> {
        let mut tx = self.pool.begin().await?;

        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox_sequences (partition_key, last_sequence)
            VALUES ($1, 1)
            ON CONFLICT (partition_key)
            DO UPDATE SET last_sequence = outbox_sequences.last_sequence + 1
            RETURNING last_sequence
            "#,
        )
        .bind(&envelope.partition_key)
        .fetch_one(&mut *tx)
        .await?;

        let metadata_json = serde_json::to_value(&envelope.metadata)?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO outbox (event_id, event_type, partition_key, sequence, occurred_at,
                payload, metadata, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $5)
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(envelope.event_id.as_uuid())
        .bind(&envelope.event_type)
        .bind(&envelope.partition_key)
        .bind(sequence)
        .bind(envelope.timestamp)
        .bind(&envelope.payload)
        .bind(metadata_json)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Self::row_to_outbox(&row)
    }

    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE outbox
            SET status = 'IN_FLIGHT', attempts = attempts + 1, locked_by = $1, locked_until = $2
            WHERE id IN (
                SELECT id FROM outbox o
                WHERE ((o.status = 'PENDING' AND o.next_attempt_at <= $3)
                    OR (o.status = 'IN_FLIGHT' AND o.locked_until < $3))
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox earlier
                      WHERE earlier.partition_key = o.partition_key
                        AND earlier.sequence < o.sequence
                        AND ((earlier.status = 'PENDING' AND earlier.next_attempt_at > $3)
                          OR (earlier.status = 'IN_FLIGHT' AND earlier.locked_until >= $3))
                  )
                ORDER BY o.id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(now + lease)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows
            .iter()
            .map(Self::row_to_outbox)
            .collect::<Result<Vec<_>>>()?;
        claimed.sort_by_key(|m| m.id);
        Ok(claimed)
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'PUBLISHED', published_at = $2, locked_by = NULL, locked_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("outbox message", id));
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'PENDING', last_error = $2, next_attempt_at = $3,
                locked_by = NULL, locked_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("outbox message", id));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'FAILED', last_error = $2, locked_by = NULL, locked_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("outbox message", id));
        }
        Ok(())
    }

    async fn outbox_messages(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxMessage>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = $1 ORDER BY id ASC"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {OUTBOX_COLUMNS} FROM outbox ORDER BY id ASC"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_outbox).collect()
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox
            WHERE (status = 'PUBLISHED' AND published_at < $1)
               OR (status = 'FAILED' AND occurred_at < $1)
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
