//! Performance benchmarks for tether-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::collections::HashMap;
use tether_engine::conflict::ThreeWayMerge;
use tether_engine::{
    codec, ConflictPredictor, EngineSnapshot, MergePolicy, Operation, OperationQueue, Priority,
    ScalarPolicy, VersionSnapshot,
};

const PRIORITIES: [Priority; 5] = [
    Priority::Background,
    Priority::Low,
    Priority::Normal,
    Priority::High,
    Priority::Critical,
];

fn card(i: usize) -> Operation {
    Operation::create(
        "card",
        format!("card_{}", i),
        json!({"title": format!("Card {}", i), "done": i % 2 == 0}),
    )
    .with_priority(PRIORITIES[i % PRIORITIES.len()])
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    for size in [100usize, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("enqueue", size), size, |b, &size| {
            let ops: Vec<Operation> = (0..size).map(card).collect();
            b.iter(|| {
                let mut queue = OperationQueue::new(size);
                for op in ops.iter().cloned() {
                    queue.enqueue(op, 1_000).unwrap();
                }
                black_box(queue.len())
            })
        });

        group.bench_with_input(BenchmarkId::new("drain", size), size, |b, &size| {
            let mut seeded = OperationQueue::new(size);
            for op in (0..size).map(card) {
                seeded.enqueue(op, 1_000).unwrap();
            }
            b.iter(|| {
                let mut queue = seeded.clone();
                let mut drained = 0;
                while let Some(op) = queue.dequeue_ready(black_box(2_000)) {
                    black_box(&op);
                    drained += 1;
                }
                drained
            })
        });
    }

    group.bench_function("chained_dependencies", |b| {
        let ops: Vec<Operation> = (0..500)
            .map(|i| {
                let op = card(i).with_id(format!("op_{}", i));
                if i > 0 {
                    op.depends_on(format!("op_{}", i - 1))
                } else {
                    op
                }
            })
            .collect();
        b.iter(|| {
            let mut queue = OperationQueue::new(1_000);
            for op in ops.iter().cloned() {
                queue.enqueue(op, 1_000).unwrap();
            }
            black_box(queue.fail_dependency_cycles())
        })
    });

    group.finish();
}

fn bench_prediction(c: &mut Criterion) {
    let mut group = c.benchmark_group("prediction");

    for size in [100usize, 1_000].iter() {
        group.bench_with_input(BenchmarkId::new("predict", size), size, |b, &size| {
            // Every fourth entity is edited twice.
            let ops: Vec<Operation> = (0..size)
                .map(|i| {
                    let mut op = Operation::update(
                        "card",
                        format!("card_{}", if i % 4 == 0 { i + 1 } else { i }),
                        json!({"title": "x"}),
                    )
                    .with_base_version(1);
                    op.enqueued_at = 1_000 + i as u64 * 100;
                    op
                })
                .collect();
            let refs: Vec<&Operation> = ops.iter().collect();
            let remote_versions: HashMap<_, _> = (0..size)
                .map(|i| (("card".to_string(), format!("card_{}", i)), (i % 3) as u64 + 1))
                .collect();
            let mut predictor = ConflictPredictor::default();
            b.iter(|| black_box(predictor.predict(black_box(&refs), &remote_versions)))
        });
    }

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for fields in [10usize, 100].iter() {
        group.bench_with_input(BenchmarkId::new("three_way", fields), fields, |b, &fields| {
            let mut base = serde_json::Map::new();
            let mut local = serde_json::Map::new();
            let mut remote = serde_json::Map::new();
            for i in 0..fields {
                let key = format!("field_{}", i);
                base.insert(key.clone(), json!(i));
                local.insert(key.clone(), json!(if i % 3 == 0 { i + 1 } else { i }));
                remote.insert(key, json!(if i % 5 == 0 { i + 2 } else { i }));
            }
            local.insert("tags".into(), json!(["a", "b", "local"]));
            remote.insert("tags".into(), json!(["a", "b", "remote"]));

            let base = VersionSnapshot::new(base.into(), 1, 1_000);
            let local = VersionSnapshot::new(local.into(), 1, 2_000);
            let remote = VersionSnapshot::new(remote.into(), 2, 3_000);
            let policy = ThreeWayMerge::new(ScalarPolicy::NewestWins);
            b.iter(|| black_box(policy.merge(Some(&base), &local, &remote)))
        });
    }

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    let payload = json!({
        "title": "A fairly ordinary card",
        "body": "lorem ipsum dolor sit amet ".repeat(200),
        "tags": (0..50).map(|i| format!("tag_{}", i)).collect::<Vec<_>>(),
    });
    let bytes = codec::canonical_bytes(&payload);

    group.bench_function("checksum", |b| {
        b.iter(|| codec::checksum(black_box(&payload)))
    });

    group.bench_function("compress", |b| b.iter(|| codec::compress(black_box(&bytes))));

    let packed = codec::compress(&bytes);
    group.bench_function("decompress", |b| {
        b.iter(|| codec::decompress(black_box(&packed)).unwrap())
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100usize, 1_000].iter() {
        let mut queue = OperationQueue::new(*size);
        for op in (0..*size).map(card) {
            queue.enqueue(op, 1_000).unwrap();
        }
        let mut snapshot = EngineSnapshot::new(1, 5_000);
        snapshot.queue = queue.snapshot();
        let json = snapshot.to_json().unwrap();

        group.bench_with_input(BenchmarkId::new("export", size), &snapshot, |b, s| {
            b.iter(|| black_box(s.to_json().unwrap()))
        });

        group.bench_with_input(BenchmarkId::new("import", size), &json, |b, json| {
            b.iter(|| EngineSnapshot::from_json(black_box(json)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_queue,
    bench_prediction,
    bench_merge,
    bench_codec,
    bench_snapshot
);
criterion_main!(benches);
