//! Key compression.
//!
//! Record payloads often repeat the same textual keys (attribute names,
//! bucket identifiers). The [`KeyCompressor`] maps each distinct key to a
//! small integer once, so codecs can store the integer instead of the text.
//! The table is append-only and persisted as part of the index descriptor.

use crate::error::{CodecError, CodecResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
struct KeyTable {
    by_key: HashMap<String, i32>,
    by_id: BTreeMap<i32, String>,
}

impl KeyTable {
    fn from_ids(ids: BTreeMap<i32, String>) -> Self {
        let by_key = ids.iter().map(|(id, key)| (key.clone(), *id)).collect();
        Self { by_key, by_id: ids }
    }

    fn next_id(&self) -> i32 {
        self.by_id.keys().next_back().map_or(1, |last| last + 1)
    }
}

/// Writable key registry owned by the single writer.
///
/// Assigning a new id marks the compressor dirty; the index uses that flag
/// to invalidate codec instances created from an older snapshot.
#[derive(Debug, Default)]
pub struct KeyCompressor {
    table: RwLock<KeyTable>,
    dirty: AtomicBool,
}

impl KeyCompressor {
    /// Creates an empty compressor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a compressor from a persisted id table.
    #[must_use]
    pub fn from_keys(keys: BTreeMap<i32, String>) -> Self {
        Self {
            table: RwLock::new(KeyTable::from_ids(keys)),
            dirty: AtomicBool::new(false),
        }
    }

    /// Returns the id of `key` if it was assigned before.
    #[must_use]
    pub fn get_id(&self, key: &str) -> Option<i32> {
        self.table.read().by_key.get(key).copied()
    }

    /// Returns the id of `key`, assigning the next free id when missing.
    pub fn get_id_or_assign(&self, key: &str) -> i32 {
        if let Some(id) = self.get_id(key) {
            return id;
        }
        let mut table = self.table.write();
        if let Some(id) = table.by_key.get(key) {
            return *id;
        }
        let id = table.next_id();
        table.by_key.insert(key.to_string(), id);
        table.by_id.insert(id, key.to_string());
        self.dirty.store(true, Ordering::Release);
        id
    }

    /// Returns the key registered under `id`.
    #[must_use]
    pub fn get_key(&self, id: i32) -> Option<String> {
        self.table.read().by_id.get(&id).cloned()
    }

    /// Number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().by_id.len()
    }

    /// Returns true if no key was registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if ids were assigned since the last reset.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clears the dirty flag, returning whether it was set.
    pub fn reset_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Copy of the id table, suitable for persisting.
    #[must_use]
    pub fn keys(&self) -> BTreeMap<i32, String> {
        self.table.read().by_id.clone()
    }

    /// Immutable snapshot used to build reading codecs.
    #[must_use]
    pub fn read_only(&self) -> Arc<ReadOnlyKeyCompressor> {
        Arc::new(ReadOnlyKeyCompressor {
            table: self.table.read().clone(),
        })
    }
}

/// Immutable view of a [`KeyCompressor`] at some point in time.
#[derive(Debug, Default, Clone)]
pub struct ReadOnlyKeyCompressor {
    table: KeyTable,
}

impl ReadOnlyKeyCompressor {
    /// Builds a snapshot straight from a persisted id table.
    #[must_use]
    pub fn from_keys(keys: BTreeMap<i32, String>) -> Self {
        Self {
            table: KeyTable::from_ids(keys),
        }
    }

    /// Returns the id of `key`.
    #[must_use]
    pub fn get_id(&self, key: &str) -> Option<i32> {
        self.table.by_key.get(key).copied()
    }

    /// Returns the key registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownKeyId`] if the snapshot does not know the id.
    pub fn get_key(&self, id: i32) -> CodecResult<&str> {
        self.table
            .by_id
            .get(&id)
            .map(String::as_str)
            .ok_or(CodecError::UnknownKeyId { id })
    }

    /// Number of keys in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.by_id.len()
    }

    /// Returns true if the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.by_id.is_empty()
    }

    /// The id table.
    #[must_use]
    pub fn keys(&self) -> &BTreeMap<i32, String> {
        &self.table.by_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_sequential_ids_once() {
        let compressor = KeyCompressor::new();
        assert_eq!(compressor.get_id_or_assign("name"), 1);
        assert_eq!(compressor.get_id_or_assign("price"), 2);
        assert_eq!(compressor.get_id_or_assign("name"), 1);
        assert_eq!(compressor.len(), 2);
        assert_eq!(compressor.get_key(2).as_deref(), Some("price"));
    }

    #[test]
    fn dirty_flag_tracks_new_assignments() {
        let compressor = KeyCompressor::new();
        assert!(!compressor.is_dirty());

        compressor.get_id_or_assign("a");
        assert!(compressor.reset_dirty());
        assert!(!compressor.reset_dirty());

        compressor.get_id_or_assign("a");
        assert!(!compressor.is_dirty());
    }

    #[test]
    fn restored_compressor_continues_after_highest_id() {
        let mut persisted = BTreeMap::new();
        persisted.insert(3, "x".to_string());
        persisted.insert(7, "y".to_string());

        let compressor = KeyCompressor::from_keys(persisted);
        assert!(!compressor.is_dirty());
        assert_eq!(compressor.get_id("y"), Some(7));
        assert_eq!(compressor.get_id_or_assign("z"), 8);
    }

    #[test]
    fn snapshot_is_isolated_from_later_assignments() {
        let compressor = KeyCompressor::new();
        compressor.get_id_or_assign("before");
        let snapshot = compressor.read_only();
        compressor.get_id_or_assign("after");

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get_key(1).unwrap(), "before");
        assert_eq!(
            snapshot.get_key(2),
            Err(CodecError::UnknownKeyId { id: 2 })
        );
    }
}
