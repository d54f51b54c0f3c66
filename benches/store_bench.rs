use aesd_socket::registry::TaskRegistry;
use aesd_socket::timestamp;
use aesd_socket::{Config, LogStore};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

const LINE: &[u8] = b"benchmark message of a typical length for the log\n";

fn bench_store_append(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = LogStore::create(dir.path().join("append"), false).unwrap();

    c.bench_function("store_append", |b| {
        b.iter(|| {
            rt.block_on(async {
                let written = store.append(black_box(LINE)).await.unwrap();
                black_box(written);
            });
        });
    });
}

fn bench_store_append_and_snapshot(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    // Each measured batch starts from a log of 100 lines.
    c.bench_function("store_append_and_snapshot", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let store = LogStore::create(dir.path().join("snapshot"), false).unwrap();
                for _ in 0..100 {
                    store.append(LINE).await.unwrap();
                }

                let mut sink = Vec::with_capacity(64 * 1024);
                let start = std::time::Instant::now();
                for _ in 0..iters {
                    sink.clear();
                    store.append_and_snapshot(black_box(LINE), &mut sink).await.unwrap();
                }
                start.elapsed()
            })
        });
    });
}

fn bench_concurrent_appends(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LogStore::create(dir.path().join("concurrent"), false).unwrap());

    c.bench_function("store_concurrent_appends_x16", |b| {
        b.iter(|| {
            rt.block_on(async {
                let tasks: Vec<_> = (0..16)
                    .map(|_| {
                        let store = Arc::clone(&store);
                        tokio::spawn(async move { store.append(LINE).await })
                    })
                    .collect();
                for task in futures::future::join_all(tasks).await {
                    black_box(task.unwrap().unwrap());
                }
            });
        });
    });
}

fn bench_registry_spawn_reap(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("registry_spawn_reap_all", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = TaskRegistry::new();
                for i in 0..32 {
                    registry.spawn(format!("task-{i}"), async { Ok(()) });
                }
                black_box(registry.reap_all(None).await);
            });
        });
    });
}

fn bench_timestamp_entry(c: &mut Criterion) {
    c.bench_function("timestamp_entry", |b| {
        b.iter(|| black_box(timestamp::entry()));
    });
}

fn bench_config_builder(c: &mut Criterion) {
    c.bench_function("config_builder", |b| {
        b.iter(|| {
            let config = Config::builder()
                .name("bench-service")
                .data_file("aesdsocketdata")
                .port(0)
                .initial_buffer_size(black_box(4096))
                .build()
                .unwrap();
            black_box(config);
        });
    });
}

criterion_group!(
    benches,
    bench_store_append,
    bench_store_append_and_snapshot,
    bench_concurrent_appends,
    bench_registry_spawn_reap,
    bench_timestamp_entry,
    bench_config_builder
);
criterion_main!(benches);
