//! Pooled submission vs a thread per task.

use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

fn demo_work(seed: u64) -> u64 {
    let mut acc = seed;
    for i in 0..64 {
        acc = acc.wrapping_mul(6364136223846793005).wrapping_add(i);
    }
    acc
}

fn bench_submit(c: &mut Criterion) {
    let pool = hive::Pool::new(50_000).expect("pool");
    let sink = Arc::new(AtomicU64::new(0));

    c.bench_function("pool_submit", |b| {
        b.iter(|| {
            let sink = Arc::clone(&sink);
            pool.submit(move || {
                sink.fetch_add(black_box(demo_work(1)), Ordering::Relaxed);
            })
            .expect("submit");
        })
    });

    let sink2 = Arc::new(AtomicU64::new(0));
    c.bench_function("thread_per_task", |b| {
        b.iter(|| {
            let sink = Arc::clone(&sink2);
            std::thread::spawn(move || {
                sink.fetch_add(black_box(demo_work(1)), Ordering::Relaxed);
            });
        })
    });

    pool.release();
}

criterion_group!(benches, bench_submit);
criterion_main!(benches);
