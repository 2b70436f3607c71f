use criterion::{Criterion, criterion_group, criterion_main};
use inventory_store::{
    EventEnvelope, InMemoryInventoryStore, MovementQuery, OutboxStore, Sku, StockChange,
    StockStore, WarehouseId,
};

async fn seeded_store(sku: &Sku, qty: i64) -> InMemoryInventoryStore {
    let store = InMemoryInventoryStore::new();
    store
        .apply_change(
            sku,
            StockChange::Receive {
                qty,
                warehouse_id: WarehouseId::default_warehouse(),
            },
            "seed",
            None,
        )
        .await
        .unwrap();
    store
}

fn bench_reserve_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sku = Sku::new("SKU-BENCH");
    let store = rt.block_on(seeded_store(&sku, 1_000_000));
    let mut n = 0u64;

    c.bench_function("ledger/reserve_release", |b| {
        b.iter(|| {
            n += 1;
            let reference = format!("res-{n}");
            rt.block_on(async {
                store
                    .apply_change(&sku, StockChange::Reserve(1), &reference, None)
                    .await
                    .unwrap();
                store
                    .apply_change(&sku, StockChange::Release(1), &reference, None)
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_duplicate_reference(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sku = Sku::new("SKU-BENCH");
    let store = rt.block_on(async {
        let store = seeded_store(&sku, 100).await;
        store
            .apply_change(&sku, StockChange::Reserve(1), "res-dup", None)
            .await
            .unwrap();
        store
    });

    c.bench_function("ledger/duplicate_reference", |b| {
        b.iter(|| {
            rt.block_on(async {
                store
                    .apply_change(&sku, StockChange::Reserve(1), "res-dup", None)
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_movement_history(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sku = Sku::new("SKU-BENCH");
    let store = rt.block_on(async {
        let store = seeded_store(&sku, 10_000).await;
        for i in 0..1_000 {
            store
                .apply_change(&sku, StockChange::Reserve(1), &format!("res-{i}"), None)
                .await
                .unwrap();
        }
        store
    });

    c.bench_function("ledger/movement_history_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                store
                    .movements(MovementQuery::for_sku(sku.clone()))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_outbox_enqueue(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryInventoryStore::new();

    c.bench_function("outbox/enqueue", |b| {
        b.iter(|| {
            rt.block_on(async {
                store
                    .enqueue(EventEnvelope::builder("LowStock", "SKU-BENCH").build())
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_reserve_release,
    bench_duplicate_reference,
    bench_movement_history,
    bench_outbox_enqueue
);
criterion_main!(benches);
