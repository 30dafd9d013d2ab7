#![forbid(unsafe_code)]
//! Benchmark: index insert, lookup and removal over in-memory streams.
//!
//! Keys are 16-byte big-endian counters inserted in a scrambled order, so
//! the tree reaches a few levels with 4 KiB blocks.

use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ntfs_block::{ByteDevice, MemByteDevice};
use ntfs_btree::{Index, IndexOptions, StandardCollation};
use std::sync::Arc;

fn key(n: u64) -> [u8; 16] {
    let mut k = [0_u8; 16];
    k[..8].copy_from_slice(&n.to_be_bytes());
    k[8..].copy_from_slice(&(!n).to_le_bytes());
    k
}

/// Multiplicative scramble; odd multiplier so every `n < count` maps to a
/// distinct key.
fn scrambled(i: u64) -> u64 {
    i.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn empty_index() -> Index<StandardCollation> {
    let root: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(0));
    let alloc: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(0));
    let bitmap: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(0));
    Index::create(root, alloc, bitmap, IndexOptions::default(), StandardCollation::Binary)
        .expect("create")
}

fn populated_index(count: u64) -> Index<StandardCollation> {
    let mut index = empty_index();
    for i in 0..count {
        index
            .insert(&key(scrambled(i)), &i.to_le_bytes())
            .expect("insert");
    }
    index
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_insert");
    for count in [1_000_u64, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                empty_index,
                |mut index| {
                    for i in 0..count {
                        index
                            .insert(&key(scrambled(i)), &i.to_le_bytes())
                            .expect("insert");
                    }
                    index
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let count = 10_000;
    let index = populated_index(count);
    let mut group = c.benchmark_group("index_lookup");
    group.bench_function("hit", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 7) % count;
            black_box(index.get(black_box(&key(scrambled(i)))).expect("get"))
        });
    });
    group.bench_function("miss", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 7) % count;
            black_box(index.get(black_box(&key(scrambled(i + count)))).expect("get"))
        });
    });
    group.finish();
}

fn bench_remove(c: &mut Criterion) {
    c.bench_function("index_remove_half_of_2000", |b| {
        b.iter_batched(
            || populated_index(2_000),
            |mut index| {
                for i in (0..2_000).step_by(2) {
                    index.remove(&key(scrambled(i))).expect("remove");
                }
                index
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_insert, bench_lookup, bench_remove);
criterion_main!(benches);
