//! Producer-side dispatch benchmarks: the cost of `defer_reclaim` itself,
//! not the worker that eventually drains it.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use reclaim_core::{barrier, create_runner, defer_reclaim, destroy_runner, set_thread_runner};

fn bench_single_producer_enqueue(c: &mut Criterion) {
    let runner = create_runner(0, -1);
    set_thread_runner(Some(runner.clone()));

    c.bench_function("defer_reclaim/single_producer", |b| {
        b.iter(|| {
            defer_reclaim((), |()| {});
        });
    });

    barrier();
    set_thread_runner(None);
    destroy_runner(runner);
}

fn bench_producer_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("defer_reclaim/producer_fanout");

    for &producers in &[1usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("producers", producers),
            &producers,
            |b, &n| {
                b.iter(|| {
                    std::thread::scope(|scope| {
                        for _ in 0..n {
                            scope.spawn(|| {
                                defer_reclaim((), |()| {});
                            });
                        }
                    });
                });
            },
        );
    }

    group.finish();
    barrier();
}

criterion_group!(benches, bench_single_producer_enqueue, bench_producer_fanout);
criterion_main!(benches);
