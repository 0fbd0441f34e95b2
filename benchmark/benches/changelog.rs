// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Changelog microbenchmarks.
//!
//! Measures the placed ring buffer at various record sizes, including the
//! steady state where every push evicts older records.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;
use xrpa_core::shm::{HeapRegion, MemoryRegion, PlacedRingBuffer, PlacedRingBufferIterator};

/// Record payload sizes to benchmark (in bytes).
const RECORD_SIZES: &[usize] = &[8, 36, 256, 1024, 4096];

const POOL_SIZE: usize = 1024 * 1024;

fn region() -> HeapRegion {
    HeapRegion::new_zeroed(PlacedRingBuffer::get_mem_size(POOL_SIZE))
}

/// Push into a full buffer, so each push pays for eviction.
fn bench_push_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("changelog_push");
    group.measurement_time(Duration::from_secs(5));

    for &size in RECORD_SIZES {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let region = region();
            let ring = PlacedRingBuffer::new(region.accessor());
            ring.init(POOL_SIZE);
            for _ in 0..=POOL_SIZE / (size + 4) {
                ring.push(size);
            }

            b.iter(|| {
                let (mem, id) = ring.push(black_box(size));
                mem.fill(0xAB);
                black_box(id);
            });
        });
    }

    group.finish();
}

/// Push then shift, keeping the buffer nearly empty.
fn bench_push_shift(c: &mut Criterion) {
    let mut group = c.benchmark_group("changelog_push_shift");
    group.measurement_time(Duration::from_secs(5));

    for &size in RECORD_SIZES {
        group.throughput(Throughput::Bytes(size as u64 * 2));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let region = region();
            let ring = PlacedRingBuffer::new(region.accessor());
            ring.init(POOL_SIZE);

            b.iter(|| {
                ring.push(black_box(size)).0.fill(0xCD);
                black_box(ring.shift());
            });
        });
    }

    group.finish();
}

/// Iterator catching up on 64 records.
fn bench_iterate_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("changelog_iterate");
    group.measurement_time(Duration::from_secs(3));

    for &size in RECORD_SIZES {
        group.throughput(Throughput::Elements(64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let region = region();
            let ring = PlacedRingBuffer::new(region.accessor());
            ring.init(POOL_SIZE);
            let mut iter = PlacedRingBufferIterator::new();

            b.iter(|| {
                for _ in 0..64 {
                    ring.push(size);
                }
                while iter.has_next(&ring) {
                    black_box(iter.next(&ring));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_push_with_eviction,
    bench_push_shift,
    bench_iterate_batch,
);

criterion_main!(benches);
