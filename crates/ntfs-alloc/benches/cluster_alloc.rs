//! Benchmark: bitmap scans and zoned cluster allocation.
//!
//! The scan benches run over a 32768-cluster map with ~5% free space in
//! short runs, the shape of a well-used volume. The allocation benches start
//! each iteration from a fresh copy of that map.

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use ntfs_alloc::{ClusterBitmap, bitmap_count_free, bitmap_find_free};
use ntfs_block::{ByteDevice, MemByteDevice};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;

const CLUSTERS: u64 = 32_768;

fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0xFF_u8; 4096];
    // Free a run of 32 clusters every ~650 (≈5% free).
    let mut pos = 100_usize;
    while pos + 32 < 32_768 {
        for i in pos..pos + 32 {
            bm[i / 8] &= !(1 << (i % 8));
        }
        pos += 650;
    }
    bm
}

fn fresh_allocator(bytes: &[u8]) -> ClusterBitmap<StdRng> {
    let stream: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::from_vec(bytes.to_vec()));
    ClusterBitmap::open(stream, CLUSTERS, StdRng::seed_from_u64(7)).expect("open")
}

fn bench_scans(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("bitmap_scan");

    group.bench_function("count_free", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&bm), CLUSTERS)));
    });

    group.bench_function("find_free", |b| {
        b.iter(|| black_box(bitmap_find_free(black_box(&bm), black_box(16_000), CLUSTERS)));
    });

    group.finish();
}

fn bench_allocate(c: &mut Criterion) {
    let bm = make_bitmap();
    let empty = vec![0_u8; 4096];
    let mut group = c.benchmark_group("cluster_allocate");

    group.bench_function("fragmented_256", |b| {
        b.iter_batched(
            || fresh_allocator(&bm),
            |mut alloc| black_box(alloc.allocate(256, None).expect("alloc")),
            BatchSize::SmallInput,
        );
    });

    group.bench_function("empty_4096", |b| {
        b.iter_batched(
            || fresh_allocator(&empty),
            |mut alloc| black_box(alloc.allocate(4096, None).expect("alloc")),
            BatchSize::SmallInput,
        );
    });

    group.bench_function("exhausted_rollback", |b| {
        b.iter_batched(
            || fresh_allocator(&bm),
            |mut alloc| black_box(alloc.allocate(CLUSTERS, None).is_err()),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_scans, bench_allocate);
criterion_main!(benches);
