//! Test fixtures and index helpers.
//!
//! Provides sample record kinds and convenience functions for setting up
//! file-backed test indexes.

use offsetdb_codec::{CborCodecFactory, KeyCompressor};
use offsetdb_core::{
    IndexState, OffsetIndex, OffsetIndexDescriptor, RecordKey, RecordTypeRegistry, StorageOptions,
    StoragePart,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Record type of [`TestPart::EntityBody`].
pub const ENTITY_BODY: i8 = 1;
/// Record type of [`TestPart::Price`].
pub const PRICE: i8 = 2;
/// Record type of [`TestPart::AttributeBucket`].
pub const ATTRIBUTE_BUCKET: i8 = 3;

/// Sample record kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TestPart {
    /// Main body of an entity.
    EntityBody {
        /// Entity id.
        id: i64,
        /// Display name.
        name: String,
    },
    /// Price of an entity.
    Price {
        /// Entity id.
        id: i64,
        /// Price in cents.
        cents: u64,
    },
    /// Entities sharing an attribute, keyed by the compressed attribute name.
    AttributeBucket {
        /// Compressed key of `attribute`, assigned on first write.
        id: Option<i64>,
        /// Attribute name.
        attribute: String,
        /// Entity ids in the bucket.
        members: Vec<i64>,
    },
}

impl TestPart {
    /// An entity body.
    pub fn entity(id: i64, name: impl Into<String>) -> Self {
        Self::EntityBody {
            id,
            name: name.into(),
        }
    }

    /// A price.
    pub fn price(id: i64, cents: u64) -> Self {
        Self::Price { id, cents }
    }

    /// An attribute bucket without a key yet.
    pub fn bucket(attribute: impl Into<String>, members: Vec<i64>) -> Self {
        Self::AttributeBucket {
            id: None,
            attribute: attribute.into(),
            members,
        }
    }

    /// Key of the entity body `id`.
    pub const fn entity_key(id: i64) -> RecordKey {
        RecordKey::new(ENTITY_BODY, id)
    }

    /// Key of the price `id`.
    pub const fn price_key(id: i64) -> RecordKey {
        RecordKey::new(PRICE, id)
    }
}

impl StoragePart for TestPart {
    fn record_type(&self) -> i8 {
        match self {
            Self::EntityBody { .. } => ENTITY_BODY,
            Self::Price { .. } => PRICE,
            Self::AttributeBucket { .. } => ATTRIBUTE_BUCKET,
        }
    }

    fn storage_part_pk(&self) -> Option<i64> {
        match self {
            Self::EntityBody { id, .. } | Self::Price { id, .. } => Some(*id),
            Self::AttributeBucket { id, .. } => *id,
        }
    }

    fn compute_unique_part_id_and_set(&mut self, keys: &KeyCompressor) -> i64 {
        match self {
            Self::EntityBody { id, .. } | Self::Price { id, .. } => *id,
            Self::AttributeBucket { id, attribute, .. } => {
                let assigned = i64::from(keys.get_id_or_assign(attribute));
                *id = Some(assigned);
                assigned
            }
        }
    }

    fn estimated_size(&self) -> usize {
        match self {
            Self::EntityBody { name, .. } => 16 + name.len(),
            Self::Price { .. } => 24,
            Self::AttributeBucket {
                attribute, members, ..
            } => 16 + attribute.len() + members.len() * 9,
        }
    }
}

/// Registry of the [`TestPart`] kinds.
pub fn test_registry() -> RecordTypeRegistry {
    RecordTypeRegistry::new()
        .with(ENTITY_BODY, "entity_body")
        .and_then(|r| r.with(PRICE, "price"))
        .and_then(|r| r.with(ATTRIBUTE_BUCKET, "attribute_bucket"))
        .expect("Test record kinds are distinct")
}

/// Empty descriptor using the CBOR codec.
pub fn empty_descriptor() -> OffsetIndexDescriptor<TestPart> {
    OffsetIndexDescriptor::empty(Arc::new(CborCodecFactory::<TestPart>::new()))
}

/// A file-backed test index with automatic cleanup.
pub struct TestIndex {
    /// The index instance.
    pub index: OffsetIndex<TestPart>,
    path: PathBuf,
    options: StorageOptions,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl TestIndex {
    /// Creates an empty index with [`StorageOptions::temporary`].
    pub fn new() -> Self {
        Self::with_options(StorageOptions::temporary())
    }

    /// Creates an empty index with the given options.
    pub fn with_options(options: StorageOptions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("index.odb");
        let index =
            OffsetIndex::open_file(&path, empty_descriptor(), test_registry(), options.clone())
                .expect("Failed to create test index");
        Self {
            index,
            path,
            options,
            _temp_dir: temp_dir,
        }
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory owned by the fixture, for sibling files.
    pub fn dir(&self) -> &Path {
        self._temp_dir.path()
    }

    /// Closes the index (flushing pending writes) and opens it again from
    /// its last descriptor.
    pub fn reopen(self) -> Self {
        if self.index.state() == IndexState::Operative {
            self.index.close().expect("Failed to close test index");
        }
        let descriptor = self.index.descriptor();
        self.reopen_with(descriptor)
    }

    /// Opens the same file again from `descriptor`, without closing the
    /// current instance first.
    pub fn reopen_with(self, descriptor: OffsetIndexDescriptor<TestPart>) -> Self {
        let Self {
            index,
            path,
            options,
            _temp_dir,
        } = self;
        drop(index);
        let index = OffsetIndex::open_file(&path, descriptor, test_registry(), options.clone())
            .expect("Failed to reopen test index");
        Self {
            index,
            path,
            options,
            _temp_dir,
        }
    }
}

impl Default for TestIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestIndex {
    type Target = OffsetIndex<TestPart>;

    fn deref(&self) -> &Self::Target {
        &self.index
    }
}

/// Runs a test with a temporary file-backed index.
///
/// # Example
///
/// ```rust
/// use offsetdb_testkit::{with_temp_index, TestPart};
///
/// with_temp_index(|index| {
///     index.put(1, TestPart::entity(1, "first")).unwrap();
///     assert_eq!(index.count(1).unwrap(), 1);
/// });
/// ```
pub fn with_temp_index<F, R>(f: F) -> R
where
    F: FnOnce(&OffsetIndex<TestPart>) -> R,
{
    let test_index = TestIndex::new();
    f(&test_index.index)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// An index holding `count` entity bodies, each flushed in its own
    /// version starting at 1.
    pub fn populated_index(count: i64) -> TestIndex {
        let test_index = TestIndex::new();
        for id in 1..=count {
            let version = id as u64;
            test_index
                .put(version, TestPart::entity(id, format!("entity-{}", id)))
                .expect("Failed to put entity");
            test_index.flush(version).expect("Failed to flush");
        }
        test_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_temp_index() {
        with_temp_index(|index| {
            index.put(1, TestPart::price(3, 99)).unwrap();
            assert_eq!(
                index.get(1, TestPart::price_key(3)).unwrap(),
                Some(TestPart::price(3, 99))
            );
        });
    }

    #[test]
    fn bucket_keys_come_from_the_key_compressor() {
        let index = TestIndex::new();
        let color = index.put(1, TestPart::bucket("color", vec![1, 2])).unwrap();
        let size = index.put(1, TestPart::bucket("size", vec![3])).unwrap();
        let again = index.put(1, TestPart::bucket("color", vec![1])).unwrap();

        assert_ne!(color, size);
        assert_eq!(color, again);
        index.flush(1).unwrap();
        assert!(index
            .compressed_keys()
            .values()
            .any(|name| name == "color"));
    }

    #[test]
    fn reopen_keeps_flushed_state() {
        let index = scenarios::populated_index(5);
        let index = index.reopen();
        assert_eq!(index.count(5).unwrap(), 5);
        assert_eq!(
            index.get(5, TestPart::entity_key(4)).unwrap(),
            Some(TestPart::entity(4, "entity-4"))
        );
    }

    #[test]
    fn reopen_flushes_pending_writes() {
        let index = TestIndex::new();
        index.put(1, TestPart::price(1, 10)).unwrap();
        let index = index.reopen();
        assert_eq!(
            index.get(1, TestPart::price_key(1)).unwrap(),
            Some(TestPart::price(1, 10))
        );
    }
}
