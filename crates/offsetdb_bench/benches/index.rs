//! Offset index benchmarks.

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use offsetdb_bench::{empty_index, generate_parts, open_index, populated_index, BENCH_TYPE};
use offsetdb_core::{RawStoragePart, RecordKey};
use offsetdb_storage::InMemoryBackend;

/// Benchmark single value writes.
fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");

    for size in [64, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (_backend, index) = empty_index();
            let part = generate_parts(1, size).remove(0);
            let mut pk = 0i64;

            b.iter(|| {
                pk += 1;
                let value = RawStoragePart::new(BENCH_TYPE, pk, part.bytes.clone());
                index.put(1, black_box(value)).unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark flushing N pending values.
fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");

    for count in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let parts = generate_parts(count, 128);
            b.iter_batched(
                || populated_index(&parts, false),
                |(_backend, index)| {
                    index.flush(1).unwrap();
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

/// Benchmark point reads of flushed and pending values.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    let parts = generate_parts(1000, 256);

    for (name, flush) in [("flushed", true), ("non_flushed", false)] {
        group.bench_function(name, |b| {
            let (_backend, index) = populated_index(&parts, flush);
            let mut pk = 0i64;

            b.iter(|| {
                pk = (pk + 7) % 1000;
                let value = index.get(1, black_box(RecordKey::new(BENCH_TYPE, pk))).unwrap();
                assert!(value.is_some());
            });
        });
    }
    group.finish();
}

/// Benchmark replaying an N-entry fragment chain on open.
fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");

    for count in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let parts = generate_parts(count, 64);
            let (backend, index) = populated_index(&parts, true);
            let descriptor = index.descriptor();
            let data = backend.data();

            b.iter(|| {
                let backend = InMemoryBackend::with_data(data.clone());
                let reopened = open_index(&backend, descriptor.clone());
                assert_eq!(reopened.count(1).unwrap(), count as u64);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_put, bench_flush, bench_get, bench_replay);
criterion_main!(benches);
