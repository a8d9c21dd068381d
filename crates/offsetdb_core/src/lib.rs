//! # OffsetDB Core
//!
//! An append-only, multi-version key-to-location index.
//!
//! This crate provides:
//! - The record envelope (framing, checksums, compression, continuations)
//! - Fragment serialization, replay and file verification
//! - A volatile MVCC overlay for pending and historical versions
//! - The [`OffsetIndex`] engine with flush, purge, snapshot copy and
//!   compaction
//!
//! ## Example
//!
//! ```rust
//! use offsetdb_core::{
//!     OffsetIndex, RawCodecFactory, RawStoragePart, RecordKey, RecordTypeRegistry,
//!     StorageOptions,
//! };
//! use offsetdb_storage::InMemoryBackend;
//! use std::sync::Arc;
//!
//! let registry = RecordTypeRegistry::new().with(1, "note").unwrap();
//! let index = OffsetIndex::create(
//!     "notes",
//!     Box::new(InMemoryBackend::new()),
//!     Arc::new(RawCodecFactory),
//!     registry,
//!     StorageOptions::temporary(),
//! )
//! .unwrap();
//!
//! index.put(1, RawStoragePart::new(1, 42, b"hello".to_vec())).unwrap();
//! index.flush(1).unwrap();
//!
//! let key = RecordKey::new(1, 42);
//! assert_eq!(index.get_binary(1, key).unwrap(), Some(b"hello".to_vec()));
//! assert_eq!(index.get_binary(0, key).unwrap(), None);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod descriptor;
mod error;
mod offset_index;
mod part;
mod pool;
pub mod record;
pub mod serialization;
mod shared;
mod stats;
mod types;
mod volatile;

pub use config::StorageOptions;
pub use descriptor::{DescriptorHeader, OffsetIndexDescriptor};
pub use error::{CoreError, CoreResult};
pub use offset_index::{IndexState, OffsetIndex};
pub use part::{RawCodec, RawCodecFactory, RawStoragePart, RecordTypeRegistry, StoragePart};
pub use pool::{Pool, Pooled};
pub use serialization::{CopyProgress, FileStatistics, SnapshotCopy};
pub use shared::SharedIndex;
pub use stats::{IndexStats, OffsetIndexStatistics, StatsSnapshot};
pub use types::{
    FileLocation, FileLocationAndWrittenBytes, RecordKey, StoredLocation, VersionedValue,
};
pub use volatile::{
    HistoricalValue, NonFlushedValueSet, PastMemory, PromotionSummary, VolatileValues,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
