use std::alloc::{GlobalAlloc as _, Layout};
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use segalloc::Allocator;

/// Repeatedly allocate and free the same block while the heap holds a given
/// number of unrelated live allocations, to expose how occupancy affects the
/// list search.
fn alloc_free_at_occupancy(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free_at_occupancy");
    for pre_allocations in [0_usize, 8, 128, 1024] {
        group.bench_function(format!("live_{pre_allocations}"), |b| {
            let allocator = Allocator::<{ 64 * 1024 }>::new();
            let layout = Layout::new::<u8>();
            for _ in 0..pre_allocations {
                assert!(!unsafe { allocator.alloc(layout) }.is_null());
            }

            b.iter(|| {
                let ptr = unsafe { allocator.alloc(layout) };
                let ptr = black_box(ptr);
                unsafe { allocator.dealloc(ptr, layout) };
            });
        });
    }
    group.finish();
}

/// Churn through a ring of mixed-size allocations, forcing splits, coalesces
/// and list migrations on every iteration.
fn mixed_size_churn(c: &mut Criterion) {
    const RING: usize = 64;
    let sizes = [24_usize, 40, 96, 200, 1024];

    c.bench_function("mixed_size_churn", |b| {
        let allocator = Allocator::<{ 512 * 1024 }>::new();
        let mut ring: Vec<(*mut u8, Layout)> = Vec::with_capacity(RING);
        let mut counter = 0_usize;

        b.iter(|| {
            let layout = Layout::from_size_align(sizes[counter % sizes.len()], 8).unwrap();
            counter += 1;

            if ring.len() == RING {
                let (ptr, layout) = ring.remove(counter % RING);
                unsafe { allocator.dealloc(ptr, layout) };
            }
            let ptr = unsafe { allocator.alloc(layout) };
            assert!(!ptr.is_null());
            ring.push((black_box(ptr), layout));
        });

        for (ptr, layout) in ring.drain(..) {
            unsafe { allocator.dealloc(ptr, layout) };
        }
    });
}

/// Grow a single block step by step, mostly in place, the way a growing
/// vector would.
fn realloc_growth(c: &mut Criterion) {
    c.bench_function("realloc_growth", |b| {
        let allocator = Allocator::<{ 1024 * 1024 }>::new();

        b.iter(|| {
            let mut layout = Layout::from_size_align(16, 8).unwrap();
            let mut ptr = unsafe { allocator.alloc(layout) };
            assert!(!ptr.is_null());
            for _ in 0..10 {
                let new_size = layout.size() * 2;
                ptr = unsafe { allocator.realloc(ptr, layout, new_size) };
                assert!(!ptr.is_null());
                layout = Layout::from_size_align(new_size, 8).unwrap();
            }
            unsafe { allocator.dealloc(black_box(ptr), layout) };
        });
    });
}

criterion_group!(
    benches,
    alloc_free_at_occupancy,
    mixed_size_churn,
    realloc_growth
);
criterion_main!(benches);
