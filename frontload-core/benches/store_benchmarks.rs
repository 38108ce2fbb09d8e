//! Store performance benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use frontload_core::{CacheEntry, KeyValueStore, MemoryBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    let runtime = Runtime::new().unwrap();
    let store = Arc::new(KeyValueStore::with_timeouts(
        Arc::new(MemoryBackend::new()),
        Duration::from_secs(2),
        Duration::from_secs(1),
    ));

    // Pre-populate data for the read benchmarks
    runtime.block_on(async {
        for i in 0..1000 {
            store
                .set(
                    &format!("bench_key_{}", i),
                    format!("value_{}", i).as_bytes(),
                    None,
                )
                .await;
        }
    });

    group.bench_function("get_existing", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let _ = store.get(black_box("bench_key_42")).await;
            })
        });
    });

    group.bench_function("get_missing", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let _ = store.get(black_box("nonexistent_key")).await;
            })
        });
    });

    group.bench_function("set_small", |b| {
        b.iter(|| {
            runtime.block_on(async {
                store
                    .set(black_box("bench_write_key"), black_box(b"small_value"), None)
                    .await;
            })
        });
    });

    group.bench_function("mget_64", |b| {
        let keys: Vec<String> = (0..64).map(|i| format!("bench_key_{}", i)).collect();
        b.iter(|| {
            runtime.block_on(async {
                let _ = store.mget(black_box(&keys)).await;
            })
        });
    });

    group.bench_function("mset_64", |b| {
        let entries: Vec<CacheEntry> = (0..64)
            .map(|i| {
                CacheEntry::with_ttl(
                    format!("bulk_key_{}", i),
                    b"payload".to_vec(),
                    Duration::from_secs(60),
                )
            })
            .collect();
        b.iter(|| {
            runtime.block_on(async {
                store.mset(black_box(&entries)).await;
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_store_operations);
criterion_main!(benches);
