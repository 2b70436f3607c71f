//! Integration tests for the reservation and cancellation sagas.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{OrderId, ReservationId, Sku, WarehouseId};
use inventory::{ManualClock, ReservationManager, ReservationPolicy, ReserveRequest};
use inventory_store::{
    InMemoryInventoryStore, LineItem, OutboxStore, ReservationStatus, SagaRecord, SagaStatus,
    SagaStore,
};
use saga::{
    CANCELLATION_SAGA, RESERVATION_SAGA, RetryConfig, SagaOrchestrator, SagaSettings,
    SagaWorkerPool,
};
use tokio::sync::watch;

struct TestHarness {
    store: InMemoryInventoryStore,
    orchestrator: SagaOrchestrator<InMemoryInventoryStore>,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_settings(SagaSettings {
            retry: RetryConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                step_timeout: Duration::from_millis(50),
            },
            max_recovery_attempts: 2,
        })
    }

    fn with_settings(settings: SagaSettings) -> Self {
        let store = InMemoryInventoryStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager =
            ReservationManager::new(store.clone(), clock.clone(), ReservationPolicy::default());
        let orchestrator =
            SagaOrchestrator::new(manager, clock, SagaWorkerPool::new(4), settings);
        Self {
            store,
            orchestrator,
        }
    }

    async fn stock(&self, sku: &str, qty: i64) {
        self.orchestrator
            .manager()
            .ledger()
            .receive(
                &Sku::new(sku),
                WarehouseId::default_warehouse(),
                qty,
                &format!("seed-{sku}"),
            )
            .await
            .unwrap();
    }

    async fn level(&self, sku: &str) -> (i64, i64) {
        let level = self
            .orchestrator
            .manager()
            .ledger()
            .get_stock_level(&Sku::new(sku))
            .await
            .unwrap();
        (level.available, level.reserved)
    }

    async fn active_reservations(&self, order_id: &OrderId) -> usize {
        self.orchestrator
            .manager()
            .for_order(order_id)
            .await
            .unwrap()
            .iter()
            .filter(|r| r.status == ReservationStatus::Active)
            .count()
    }
}

#[tokio::test]
async fn test_second_line_short_at_reserve_compensates_first() {
    let harness = TestHarness::new();
    harness.stock("SKI-001", 3).await;
    let order = OrderId::new("ORD-3");

    // Each line passes validation alone; the second finds nothing left.
    let outcome = harness
        .orchestrator
        .start_reservation(
            order.clone(),
            vec![LineItem::new("SKI-001", 3), LineItem::new("SKI-001", 3)],
            None,
        )
        .await
        .unwrap();

    assert_eq!(outcome.saga.status, SagaStatus::Compensated);
    assert_eq!(outcome.saga.completed_steps, vec!["VALIDATING_INVENTORY"]);
    assert_eq!(outcome.shortfalls.len(), 1);
    assert_eq!(outcome.shortfalls[0].available, 0);
    assert!(
        outcome
            .saga
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.starts_with("RESERVING_INVENTORY"))
    );
    assert_eq!(harness.level("SKI-001").await, (3, 0));
    assert_eq!(harness.active_reservations(&order).await, 0);
}

#[tokio::test]
async fn test_failed_line_releases_earlier_lines() {
    let harness = TestHarness::new();
    harness.stock("SKU-A", 10).await;
    harness.stock("SKU-B", 10).await;
    harness.stock("SKU-C", 1).await;
    let order = OrderId::new("ORD-ABC");

    let outcome = harness
        .orchestrator
        .start_reservation(
            order.clone(),
            vec![
                LineItem::new("SKU-A", 2),
                LineItem::new("SKU-B", 4),
                LineItem::new("SKU-C", 1),
                LineItem::new("SKU-C", 1),
            ],
            None,
        )
        .await
        .unwrap();

    assert_eq!(outcome.saga.status, SagaStatus::Compensated);
    assert_eq!(harness.level("SKU-A").await, (10, 0));
    assert_eq!(harness.level("SKU-B").await, (10, 0));
    assert_eq!(harness.level("SKU-C").await, (1, 0));
    assert_eq!(harness.active_reservations(&order).await, 0);
}

#[tokio::test]
async fn test_completed_saga_publishes_reserved_events() {
    let harness = TestHarness::new();
    harness.stock("SKU-A", 10).await;
    harness.stock("SKU-B", 10).await;

    let outcome = harness
        .orchestrator
        .start_reservation(
            OrderId::new("ORD-1"),
            vec![LineItem::new("SKU-A", 1), LineItem::new("SKU-B", 2)],
            None,
        )
        .await
        .unwrap();

    assert!(outcome.is_completed());
    let reserved: Vec<_> = harness
        .store
        .outbox_messages(None)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.envelope.event_type == "InventoryReserved")
        .collect();
    assert_eq!(reserved.len(), 2);
    assert!(reserved.iter().all(|m| m.envelope.partition_key == "ORD-1"));
}

#[tokio::test]
async fn test_step_timeout_triggers_compensation() {
    let harness = TestHarness::new();
    harness.stock("SKU-A", 10).await;
    harness.store.set_stock_latency(Duration::from_millis(500));

    let outcome = harness
        .orchestrator
        .start_reservation(OrderId::new("ORD-1"), vec![LineItem::new("SKU-A", 2)], None)
        .await
        .unwrap();

    assert_eq!(outcome.saga.status, SagaStatus::Compensated);
    assert!(
        outcome
            .saga
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("timed out"))
    );
    assert!(outcome.shortfalls.is_empty());
    harness.store.set_stock_latency(Duration::ZERO);
    assert_eq!(harness.level("SKU-A").await, (10, 0));
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let harness = TestHarness::new();
    harness.stock("SKU-A", 10).await;
    harness.store.inject_stock_failures(1);

    let outcome = harness
        .orchestrator
        .start_reservation(OrderId::new("ORD-1"), vec![LineItem::new("SKU-A", 2)], None)
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(harness.level("SKU-A").await, (8, 2));
}

#[tokio::test]
async fn test_recovery_resumes_after_last_completed_step() {
    let harness = TestHarness::new();
    harness.stock("SKU-A", 10).await;
    harness.stock("SKU-B", 10).await;
    let order = OrderId::new("ORD-CRASH");

    // A run that crashed after reserving the first of two lines.
    let mut saga = SagaRecord::start(
        order.clone(),
        RESERVATION_SAGA,
        vec![LineItem::new("SKU-A", 2), LineItem::new("SKU-B", 3)],
        None,
        Utc::now(),
    );
    saga.completed_steps.push("VALIDATING_INVENTORY".into());
    saga.reservation_ids = vec![ReservationId::new(), ReservationId::new()];
    harness.store.insert_saga(&saga).await.unwrap();
    harness
        .orchestrator
        .manager()
        .reserve(
            ReserveRequest::new(order.clone(), Sku::new("SKU-A"), 2).with_id(saga.reservation_ids[0]),
        )
        .await
        .unwrap();

    let report = harness.orchestrator.recover().await.unwrap();

    assert_eq!(report.resumed, 1);
    let recovered = harness.orchestrator.get_saga(saga.id).await.unwrap();
    assert_eq!(recovered.status, SagaStatus::Completed);
    assert_eq!(recovered.recovery_attempts, 1);
    assert_eq!(harness.level("SKU-A").await, (8, 2));
    assert_eq!(harness.level("SKU-B").await, (7, 3));
    assert_eq!(harness.active_reservations(&order).await, 2);
}

#[tokio::test]
async fn test_recovery_finishes_interrupted_compensation() {
    let harness = TestHarness::new();
    harness.stock("SKU-A", 10).await;
    let order = OrderId::new("ORD-1");
    harness
        .orchestrator
        .manager()
        .reserve(ReserveRequest::new(order.clone(), Sku::new("SKU-A"), 4))
        .await
        .unwrap();
    let mut saga = SagaRecord::start(
        order.clone(),
        RESERVATION_SAGA,
        vec![LineItem::new("SKU-A", 4)],
        None,
        Utc::now(),
    );
    saga.status = SagaStatus::Compensating;
    harness.store.insert_saga(&saga).await.unwrap();

    harness.orchestrator.recover().await.unwrap();

    let recovered = harness.orchestrator.get_saga(saga.id).await.unwrap();
    assert_eq!(recovered.status, SagaStatus::Compensated);
    assert_eq!(harness.level("SKU-A").await, (10, 0));
}

#[tokio::test]
async fn test_recovery_limit_flags_saga() {
    let harness = TestHarness::new();
    let mut saga = SagaRecord::start(
        OrderId::new("ORD-STUCK"),
        RESERVATION_SAGA,
        vec![LineItem::new("SKU-A", 1)],
        None,
        Utc::now(),
    );
    saga.recovery_attempts = 2;
    harness.store.insert_saga(&saga).await.unwrap();

    let report = harness.orchestrator.recover().await.unwrap();

    assert_eq!(report.flagged, 1);
    let flagged = harness.orchestrator.get_saga(saga.id).await.unwrap();
    assert!(flagged.needs_attention);
    assert_eq!(flagged.status, SagaStatus::Running);
    assert!(harness.store.unfinished_sagas().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_is_accepted_when_release_fails() {
    let harness = TestHarness::new();
    harness.stock("SKU-A", 10).await;
    let order = OrderId::new("ORD-1");
    harness
        .orchestrator
        .start_reservation(order.clone(), vec![LineItem::new("SKU-A", 4)], None)
        .await
        .unwrap();
    harness.store.inject_stock_failures(2);

    let outcome = harness
        .orchestrator
        .cancel_order(order.clone(), "customer")
        .await
        .unwrap();

    assert_eq!(outcome.saga.status, SagaStatus::Running);
    assert_eq!(harness.level("SKU-A").await, (6, 4));

    harness.orchestrator.recover().await.unwrap();
    assert_eq!(harness.level("SKU-A").await, (10, 0));
    let sagas = harness.orchestrator.sagas_for_order(&order).await.unwrap();
    assert!(sagas.iter().all(|s| s.status == SagaStatus::Completed));
}

#[tokio::test]
async fn test_deferred_return_of_confirmed_stock_is_retried_in_background() {
    let harness = TestHarness::new();
    harness.stock("SKU-A", 10).await;
    let order = OrderId::new("ORD-1");
    harness
        .orchestrator
        .start_reservation(order.clone(), vec![LineItem::new("SKU-A", 4)], None)
        .await
        .unwrap();
    let reservations = harness.orchestrator.manager().for_order(&order).await.unwrap();
    harness
        .orchestrator
        .manager()
        .confirm(reservations[0].id)
        .await
        .unwrap();
    harness.store.inject_stock_failures(2);

    let outcome = harness
        .orchestrator
        .cancel_order(order.clone(), "customer")
        .await
        .unwrap();
    assert_eq!(outcome.saga.status, SagaStatus::Running);
    assert_eq!(harness.level("SKU-A").await, (6, 0));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let retries = tokio::spawn(
        harness
            .orchestrator
            .clone()
            .run_release_retries(Duration::from_millis(10), shutdown_rx),
    );
    for _ in 0..100 {
        if harness.level("SKU-A").await == (10, 0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown_tx.send(true).unwrap();
    retries.await.unwrap();

    assert_eq!(harness.level("SKU-A").await, (10, 0));
    let cancellation = harness
        .store
        .find_saga(&order, CANCELLATION_SAGA)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancellation.status, SagaStatus::Completed);
    assert_eq!(cancellation.recovery_attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_orders_never_oversell() {
    let harness = Arc::new(TestHarness::new());
    harness.stock("SKU-HOT", 5).await;

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let harness = harness.clone();
            tokio::spawn(async move {
                harness
                    .orchestrator
                    .start_reservation(
                        OrderId::new(format!("ORD-{i}")),
                        vec![LineItem::new("SKU-HOT", 1)],
                        None,
                    )
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut completed = 0;
    for handle in handles {
        if handle.await.unwrap().is_completed() {
            completed += 1;
        }
    }

    assert_eq!(completed, 5);
    assert_eq!(harness.level("SKU-HOT").await, (0, 5));
}
