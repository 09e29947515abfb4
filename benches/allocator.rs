//! Allocation benchmarks
//!
//! Measures context allocation against the global allocator and the cost of
//! bulk reclamation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use memctx::{ensure_initialized, pfree, top_most_memory_context, AllocSet, AllocSetSizes};

fn bench_allocation(c: &mut Criterion) {
    ensure_initialized();
    let context = AllocSet::create(Some(&top_most_memory_context()), "bench", AllocSetSizes::DEFAULT, false).unwrap();

    let mut group = c.benchmark_group("alloc_free");
    for size in [16usize, 256, 4096, 16 * 1024] {
        group.bench_with_input(BenchmarkId::new("context", size), &size, |b, &size| {
            b.iter(|| {
                let pointer = context.alloc(black_box(size)).unwrap();
                unsafe { pfree(pointer) };
            });
        });

        group.bench_with_input(BenchmarkId::new("global", size), &size, |b, &size| {
            b.iter(|| black_box(vec![0u8; size]));
        });
    }
    group.finish();

    context.delete();
}

fn bench_reset(c: &mut Criterion) {
    ensure_initialized();
    let context = AllocSet::create(Some(&top_most_memory_context()), "bench-reset", AllocSetSizes::DEFAULT, false).unwrap();

    c.bench_function("alloc_1000_then_reset", |b| {
        b.iter(|| {
            for i in 0..1000 {
                black_box(context.alloc(16 + i % 200).unwrap());
            }
            context.reset();
        });
    });

    context.delete();
}

fn bench_shared_context(c: &mut Criterion) {
    ensure_initialized();
    let shared = AllocSet::create(Some(&top_most_memory_context()), "bench-shared", AllocSetSizes::DEFAULT, true).unwrap();

    c.bench_function("shared_alloc_free_64", |b| {
        b.iter(|| {
            let pointer = shared.alloc(black_box(64)).unwrap();
            unsafe { pfree(pointer) };
        });
    });

    shared.delete();
}

criterion_group!(benches, bench_allocation, bench_reset, bench_shared_context);
criterion_main!(benches);
