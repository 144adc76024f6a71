//! Benchmarks for price-level maps, the reorder buffer and the engine.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use book_resync::orderbook::{ChainRule, OrderBook, PriceLevelMap, ReorderBuffer};
use book_resync::types::{Side, UpdateBatch};
use book_resync::BookConfig;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn populated(side: Side, size: usize) -> PriceLevelMap {
    let mut map = PriceLevelMap::new(side);
    for i in 0..size {
        map.set(100.0 + i as f64 * 0.01, 1.0, 0);
    }
    map
}

fn bench_level_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("level_update");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut map = populated(Side::Ask, size);
            let mid = 100.0 + (size / 2) as f64 * 0.01;
            let mut amount = 1.0;

            b.iter(|| {
                // Simulate a typical delta on an existing level
                amount += 0.5;
                map.update(black_box(mid), black_box(amount), 0);
            });
        });
    }

    group.finish();
}

fn bench_level_insert_delete(c: &mut Criterion) {
    let mut group = c.benchmark_group("level_insert_delete");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut map = populated(Side::Bid, size);
            let between = 100.005;

            b.iter(|| {
                map.update(black_box(between), 2.0, 0);
                map.update(black_box(between), 0.0, 0);
            });
        });
    }

    group.finish();
}

fn bench_reorder_push(c: &mut Criterion) {
    let mut keys: Vec<i64> = (1..=256).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(1));

    c.bench_function("reorder_push_shuffled_256", |b| {
        b.iter_batched(
            || ReorderBuffer::new(false),
            |mut buffer| {
                for &key in &keys {
                    let _ = buffer.push(UpdateBatch::new(key).with_last_id(key));
                }
                while let Some(batch) = buffer.pop_front() {
                    buffer.release(black_box(batch));
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn feed(count: i64) -> Vec<UpdateBatch> {
    let mut out = vec![UpdateBatch::new(1)
        .snapshot()
        .with_last_id(1)
        .with_bids(&[(99.0, 1.0), (98.0, 1.0)])
        .with_asks(&[(101.0, 1.0), (102.0, 1.0)])];
    for id in 2..=count {
        let tick = (id % 20) as f64 * 0.1;
        out.push(
            UpdateBatch::new(id)
                .with_last_id(id)
                .with_bids(&[(98.0 - tick, id as f64)])
                .with_asks(&[(102.0 + tick, id as f64)]),
        );
    }
    out
}

fn bench_insert_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_slot");
    let ordered = feed(500);

    // late batches arrive within a small window of their neighbours
    let mut jittered = ordered.clone();
    let mut rng = StdRng::seed_from_u64(7);
    for window in jittered[1..].chunks_mut(8) {
        window.shuffle(&mut rng);
    }

    for (name, batches) in [("in_order", &ordered), ("jittered", &jittered)] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let book =
                        OrderBook::new(BookConfig::new("bench", "BTCUSDT"), ChainRule::Consecutive);
                    (book, batches.clone())
                },
                |(book, batches)| {
                    for batch in batches {
                        book.insert_slot(batch, 0);
                    }
                    black_box(book.update_id())
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_get_depth(c: &mut Criterion) {
    let book = OrderBook::new(BookConfig::new("bench", "BTCUSDT"), ChainRule::Consecutive);
    for batch in feed(500) {
        book.insert_slot(batch, 0);
    }

    c.bench_function("get_depth_20", |b| {
        b.iter(|| {
            black_box(book.get_depth(black_box(20)));
        });
    });
}

criterion_group!(
    benches,
    bench_level_update,
    bench_level_insert_delete,
    bench_reorder_push,
    bench_insert_slot,
    bench_get_depth
);
criterion_main!(benches);
