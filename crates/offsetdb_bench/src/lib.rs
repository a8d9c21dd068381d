//! Benchmark utilities.

use offsetdb_core::{
    OffsetIndex, OffsetIndexDescriptor, RawCodecFactory, RawStoragePart, RecordTypeRegistry,
    StorageOptions,
};
use offsetdb_storage::InMemoryBackend;
use rand::Rng;
use std::sync::Arc;

/// Record type used by every benchmark.
pub const BENCH_TYPE: i8 = 1;

/// Generate random payload data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` raw parts with payloads of `payload_size` bytes.
pub fn generate_parts(count: usize, payload_size: usize) -> Vec<RawStoragePart> {
    (0..count)
        .map(|pk| RawStoragePart::new(BENCH_TYPE, pk as i64, random_data(payload_size)))
        .collect()
}

/// Registry holding the benchmark record type.
pub fn bench_registry() -> RecordTypeRegistry {
    RecordTypeRegistry::new()
        .with(BENCH_TYPE, "bench")
        .expect("Benchmark record type is valid")
}

/// Options with a write buffer large enough for big fragments.
pub fn bench_options() -> StorageOptions {
    StorageOptions::new().output_buffer_size(256 * 1024)
}

/// Opens an index over `backend` from `descriptor`.
pub fn open_index(
    backend: &InMemoryBackend,
    descriptor: OffsetIndexDescriptor<RawStoragePart>,
) -> OffsetIndex<RawStoragePart> {
    OffsetIndex::open(
        "bench",
        Box::new(backend.clone()),
        descriptor,
        bench_registry(),
        bench_options(),
    )
    .expect("Failed to open benchmark index")
}

/// An empty in-memory index.
pub fn empty_index() -> (InMemoryBackend, OffsetIndex<RawStoragePart>) {
    let backend = InMemoryBackend::new();
    let index = open_index(
        &backend,
        OffsetIndexDescriptor::empty(Arc::new(RawCodecFactory)),
    );
    (backend, index)
}

/// An index holding `parts`, written at version 1 and optionally flushed.
pub fn populated_index(
    parts: &[RawStoragePart],
    flush: bool,
) -> (InMemoryBackend, OffsetIndex<RawStoragePart>) {
    let (backend, index) = empty_index();
    for part in parts {
        index.put(1, part.clone()).expect("Failed to put");
    }
    if flush {
        index.flush(1).expect("Failed to flush");
    }
    (backend, index)
}
