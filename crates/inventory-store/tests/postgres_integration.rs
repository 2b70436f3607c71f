//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and truncate every table per test.
//! Run with:
//!
//! ```bash
//! cargo test -p inventory-store --test postgres_integration
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use inventory_store::{
    EventEnvelope, EventId, InboxStore, LedgerUpdate, LineItem, MovementQuery, MovementType,
    OrderId, OutboxStatus, OutboxStore, PostgresInventoryStore, Reservation, ReservationId,
    ReservationStatus, ReservationStore, SagaRecord, SagaStore, Sku, StockChange, StockStatus,
    StockStore, StoreError, Version, WarehouseId,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_inventory_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresInventoryStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE stock_movements, reservations, stock_items, sagas, processed_events, \
         outbox, outbox_sequences",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresInventoryStore::new(pool)
}

async fn seed(store: &PostgresInventoryStore, sku: &str, qty: i64) -> Sku {
    let sku = Sku::new(sku);
    store
        .apply_change(
            &sku,
            StockChange::Receive {
                qty,
                warehouse_id: WarehouseId::default_warehouse(),
            },
            &format!("seed-{sku}"),
            None,
        )
        .await
        .unwrap();
    sku
}

#[tokio::test]
#[serial]
async fn receipt_creates_item_and_movement() {
    let store = get_test_store().await;
    let sku = seed(&store, "SKU-1", 25).await;

    let item = store.get_item(&sku).await.unwrap().unwrap();
    assert_eq!(item.available, 25);
    assert_eq!(item.status, StockStatus::Active);

    let movements = store.movements(MovementQuery::for_sku(sku)).await.unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].movement_type, MovementType::Inbound);
    assert_eq!(movements[0].available_after, 25);
}

#[tokio::test]
#[serial]
async fn conditional_reserve_rejects_shortfall() {
    let store = get_test_store().await;
    let sku = seed(&store, "SKU-1", 5).await;

    let applied = store
        .apply_change(&sku, StockChange::Reserve(3), "res-1", None)
        .await
        .unwrap();
    let rejected = store
        .apply_change(&sku, StockChange::Reserve(3), "res-2", None)
        .await
        .unwrap();

    match applied {
        LedgerUpdate::Applied { before, after, .. } => {
            assert_eq!((before.available, before.reserved), (5, 0));
            assert_eq!((after.available, after.reserved), (2, 3));
        }
        other => panic!("expected applied, got {other:?}"),
    }
    assert!(matches!(rejected, LedgerUpdate::Rejected(item) if item.available == 2));
}

#[tokio::test]
#[serial]
async fn repeated_reference_is_duplicate() {
    let store = get_test_store().await;
    let sku = seed(&store, "SKU-1", 5).await;
    store
        .apply_change(&sku, StockChange::Reserve(2), "res-1", None)
        .await
        .unwrap();
    store
        .apply_change(&sku, StockChange::Release(2), "res-1", None)
        .await
        .unwrap();

    let again = store
        .apply_change(&sku, StockChange::Release(2), "res-1", None)
        .await
        .unwrap();

    assert_eq!(again, LedgerUpdate::Duplicate);
    let item = store.get_item(&sku).await.unwrap().unwrap();
    assert_eq!((item.available, item.reserved), (5, 0));
}

#[tokio::test]
#[serial]
async fn concurrent_reserves_never_oversell() {
    let store = get_test_store().await;
    let sku = seed(&store, "SKU-HOT", 10).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        let sku = sku.clone();
        handles.push(tokio::spawn(async move {
            store
                .apply_change(&sku, StockChange::Reserve(1), &format!("res-{i}"), None)
                .await
                .unwrap()
        }));
    }

    let mut applied = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), LedgerUpdate::Applied { .. }) {
            applied += 1;
        }
    }

    assert_eq!(applied, 10);
    let item = store.get_item(&sku).await.unwrap().unwrap();
    assert_eq!((item.available, item.reserved), (0, 10));
}

#[tokio::test]
#[serial]
async fn adjustment_records_reason() {
    let store = get_test_store().await;
    let sku = seed(&store, "SKU-1", 10).await;

    store
        .apply_change(
            &sku,
            StockChange::Adjust { new_available: 7 },
            "count-1",
            Some("cycle count"),
        )
        .await
        .unwrap();

    let adjustments = store
        .movements(MovementQuery::for_sku(sku).movement_type(MovementType::Adjustment))
        .await
        .unwrap();
    assert_eq!(adjustments.len(), 1);
    assert_eq!(adjustments[0].available_delta, -3);
    assert_eq!(adjustments[0].reason.as_deref(), Some("cycle count"));
}

#[tokio::test]
#[serial]
async fn reservation_transition_and_settlement() {
    let store = get_test_store().await;
    let sku = seed(&store, "SKU-1", 10).await;
    let now = Utc::now();
    let reservation = Reservation::active(
        ReservationId::new(),
        sku,
        OrderId::new("ORD-1"),
        None,
        2,
        now - Duration::minutes(1),
        now - Duration::minutes(31),
    );
    store.insert_reservation(&reservation).await.unwrap();

    let expired = store.expired_reservations(now, 10).await.unwrap();
    assert_eq!(expired.len(), 1);

    let moved = store
        .transition_reservation(
            reservation.id,
            ReservationStatus::Active,
            ReservationStatus::Expired,
            Some("expired"),
            now,
        )
        .await
        .unwrap()
        .unwrap();
    assert!(!moved.settled);
    assert_eq!(store.unsettled_reservations(10).await.unwrap().len(), 1);

    store.mark_settled(reservation.id).await.unwrap();
    assert!(store.unsettled_reservations(10).await.unwrap().is_empty());

    let lost = store
        .transition_reservation(
            reservation.id,
            ReservationStatus::Active,
            ReservationStatus::Confirmed,
            None,
            now,
        )
        .await
        .unwrap();
    assert!(lost.is_none());
}

#[tokio::test]
#[serial]
async fn saga_versioning_and_uniqueness() {
    let store = get_test_store().await;
    let order_id = OrderId::new("ORD-1");
    let mut saga = SagaRecord::start(
        order_id.clone(),
        "OrderReservation",
        vec![LineItem::new("SKU-1", 2)],
        None,
        Utc::now(),
    );

    assert!(store.insert_saga(&saga).await.unwrap());
    let twin = SagaRecord::start(order_id.clone(), "OrderReservation", vec![], None, Utc::now());
    assert!(!store.insert_saga(&twin).await.unwrap());

    saga.completed_steps.push("VALIDATING_INVENTORY".into());
    saga.version = saga.version.next();
    store.update_saga(&saga, Version::first()).await.unwrap();

    let stale = store.update_saga(&saga, Version::first()).await;
    assert!(matches!(stale, Err(StoreError::ConcurrencyConflict { .. })));

    let loaded = store
        .find_saga(&order_id, "OrderReservation")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.completed_steps, vec!["VALIDATING_INVENTORY"]);
    assert_eq!(loaded.line_items, vec![LineItem::new("SKU-1", 2)]);
    assert_eq!(store.unfinished_sagas().await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn inbox_dedupes_event_ids() {
    let store = get_test_store().await;
    let event_id = EventId::new();

    assert!(store
        .try_mark_processed(event_id, "OrderCreated", Utc::now())
        .await
        .unwrap());
    assert!(!store
        .try_mark_processed(event_id, "OrderCreated", Utc::now())
        .await
        .unwrap());
    assert!(store.is_processed(event_id).await.unwrap());
}

#[tokio::test]
#[serial]
async fn outbox_claim_publish_and_retry() {
    let store = get_test_store().await;
    let first = store
        .enqueue(EventEnvelope::builder("LowStock", "SKU-1").build())
        .await
        .unwrap();
    let second = store
        .enqueue(EventEnvelope::builder("OutOfStock", "SKU-1").build())
        .await
        .unwrap();
    assert_eq!((first.sequence, second.sequence), (1, 2));

    let now = Utc::now() + Duration::seconds(1);
    let claimed = store
        .claim_due("relay-1", now, Duration::seconds(30), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);
    assert!(claimed.iter().all(|m| m.attempts == 1));

    store.mark_published(first.id, now).await.unwrap();
    store
        .reschedule(second.id, "broker down", now + Duration::seconds(5))
        .await
        .unwrap();

    let pending = store
        .outbox_messages(Some(OutboxStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].last_error.as_deref(), Some("broker down"));

    let too_early = store
        .claim_due("relay-1", now, Duration::seconds(30), 10)
        .await
        .unwrap();
    assert!(too_early.is_empty());
}

#[tokio::test]
#[serial]
async fn restock_keeps_incoming() {
    let store = get_test_store().await;
    let sku = seed(&store, "SKU-1", 10).await;
    store.add_incoming(&sku, 50).await.unwrap();

    let update = store
        .apply_change(&sku, StockChange::Restock(4), "res-1", None)
        .await
        .unwrap();

    let LedgerUpdate::Applied { after, movement, .. } = update else {
        panic!("expected restock to apply");
    };
    assert_eq!((after.available, after.incoming), (14, 50));
    assert_eq!(movement.movement_type, MovementType::Inbound);
}

#[tokio::test]
#[serial]
async fn flagged_reservation_leaves_unsettled_scan() {
    let store = get_test_store().await;
    let sku = seed(&store, "SKU-1", 10).await;
    let now = Utc::now();
    let reservation = Reservation::active(
        ReservationId::new(),
        sku,
        OrderId::new("ORD-1"),
        None,
        2,
        now + Duration::minutes(30),
        now,
    );
    store.insert_reservation(&reservation).await.unwrap();
    store
        .transition_reservation(
            reservation.id,
            ReservationStatus::Active,
            ReservationStatus::Confirmed,
            None,
            now,
        )
        .await
        .unwrap();

    store.flag_reservation(reservation.id).await.unwrap();

    assert!(store.unsettled_reservations(10).await.unwrap().is_empty());
    let stored = store.get_reservation(reservation.id).await.unwrap().unwrap();
    assert!(stored.needs_attention);
    assert!(!stored.settled);
}

#[tokio::test]
#[serial]
async fn purge_removes_old_finished_outbox_rows() {
    let store = get_test_store().await;
    let old = Utc::now() - Duration::days(2);
    let published = store
        .enqueue(EventEnvelope::builder("LowStock", "SKU-1").timestamp(old).build())
        .await
        .unwrap();
    let failed = store
        .enqueue(EventEnvelope::builder("LowStock", "SKU-2").timestamp(old).build())
        .await
        .unwrap();
    store
        .enqueue(EventEnvelope::builder("LowStock", "SKU-3").timestamp(old).build())
        .await
        .unwrap();
    store.mark_published(published.id, old).await.unwrap();
    store.mark_failed(failed.id, "rejected").await.unwrap();

    let purged = store
        .purge_finished(Utc::now() - Duration::days(1))
        .await
        .unwrap();

    assert_eq!(purged, 2);
    let remaining = store.outbox_messages(None).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].status, OutboxStatus::Pending);
}
