//! Record kinds stored in an offset index.
//!
//! Payload types implement [`StoragePart`]; the set of record kinds an
//! index accepts is declared up front in a [`RecordTypeRegistry`], a
//! bidirectional table between type ids and names.

use crate::error::{CoreError, CoreResult};
use crate::types::RecordKey;
use offsetdb_codec::{
    CodecError, CodecFactory, CodecResult, KeyCompressor, PayloadCodec, ReadOnlyKeyCompressor,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A value that can be stored in an offset index.
pub trait StoragePart: Send + Sync + 'static {
    /// Record type id of this value (positive).
    fn record_type(&self) -> i8;

    /// The primary key, if already known.
    fn storage_part_pk(&self) -> Option<i64>;

    /// Computes the primary key (possibly registering compressed keys),
    /// stores it in the value and returns it.
    fn compute_unique_part_id_and_set(&mut self, keys: &KeyCompressor) -> i64;

    /// Rough size of the encoded value, used to presize buffers.
    fn estimated_size(&self) -> usize {
        64
    }

    /// The key this value is stored under, if its primary key is known.
    fn record_key(&self) -> Option<RecordKey> {
        self.storage_part_pk()
            .map(|pk| RecordKey::new(self.record_type(), pk))
    }
}

/// Bidirectional table of the record kinds an index stores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordTypeRegistry {
    by_id: BTreeMap<i8, &'static str>,
}

impl RecordTypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a record kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is not positive, or if the id or name is
    /// already registered.
    pub fn register(&mut self, id: i8, name: &'static str) -> CoreResult<()> {
        if id <= 0 {
            return Err(CoreError::invalid_operation(format!(
                "record type id {id} must be positive"
            )));
        }
        if let Some(existing) = self.by_id.get(&id) {
            return Err(CoreError::invalid_operation(format!(
                "record type id {id} already registered as `{existing}`"
            )));
        }
        if self.by_id.values().any(|existing| *existing == name) {
            return Err(CoreError::invalid_operation(format!(
                "record type `{name}` already registered"
            )));
        }
        self.by_id.insert(id, name);
        Ok(())
    }

    /// Builder variant of [`RecordTypeRegistry::register`].
    ///
    /// # Errors
    ///
    /// See [`RecordTypeRegistry::register`].
    pub fn with(mut self, id: i8, name: &'static str) -> CoreResult<Self> {
        self.register(id, name)?;
        Ok(self)
    }

    /// Name of a record type; tombstone ids resolve to their positive type.
    #[must_use]
    pub fn name_of(&self, id: i8) -> Option<&'static str> {
        self.by_id.get(&id.wrapping_abs()).copied()
    }

    /// Id of a named record type.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<i8> {
        self.by_id
            .iter()
            .find(|(_, n)| **n == name)
            .map(|(id, _)| *id)
    }

    /// Fails unless `id` is registered.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownRecordType`].
    pub fn ensure_known(&self, id: i8) -> CoreResult<()> {
        if self.by_id.contains_key(&id) {
            Ok(())
        } else {
            Err(CoreError::UnknownRecordType { id })
        }
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = i8> + '_ {
        self.by_id.keys().copied()
    }

    /// Number of registered kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// An undecoded payload, used by tools that copy or inspect records
/// without knowing their schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStoragePart {
    /// Record type id.
    pub record_type: i8,
    /// Primary key.
    pub primary_key: i64,
    /// Payload bytes as produced by the original codec.
    pub bytes: Vec<u8>,
}

impl RawStoragePart {
    /// Creates a raw part.
    #[must_use]
    pub fn new(record_type: i8, primary_key: i64, bytes: Vec<u8>) -> Self {
        Self {
            record_type,
            primary_key,
            bytes,
        }
    }
}

impl StoragePart for RawStoragePart {
    fn record_type(&self) -> i8 {
        self.record_type
    }

    fn storage_part_pk(&self) -> Option<i64> {
        Some(self.primary_key)
    }

    fn compute_unique_part_id_and_set(&mut self, _keys: &KeyCompressor) -> i64 {
        self.primary_key
    }

    fn estimated_size(&self) -> usize {
        self.bytes.len()
    }
}

/// Pass-through codec for [`RawStoragePart`].
///
/// Decoding cannot recover the primary key from the bytes alone, so decoded
/// parts carry primary key 0; callers that need it use the key they asked for.
#[derive(Debug, Default)]
pub struct RawCodec;

impl PayloadCodec<RawStoragePart> for RawCodec {
    fn encode(&mut self, value: &RawStoragePart) -> CodecResult<Vec<u8>> {
        Ok(value.bytes.clone())
    }

    fn decode(&mut self, bytes: &[u8], record_type: i8) -> CodecResult<RawStoragePart> {
        if record_type <= 0 {
            return Err(CodecError::decoding_failed(format!(
                "record type {record_type} cannot carry a payload"
            )));
        }
        Ok(RawStoragePart::new(record_type, 0, bytes.to_vec()))
    }
}

/// Factory for [`RawCodec`].
#[derive(Debug, Default)]
pub struct RawCodecFactory;

impl CodecFactory<RawStoragePart> for RawCodecFactory {
    fn create(&self, _keys: Arc<ReadOnlyKeyCompressor>) -> Box<dyn PayloadCodec<RawStoragePart>> {
        Box::new(RawCodec)
    }

    fn name(&self) -> &'static str {
        "raw"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookups_both_ways() {
        let registry = RecordTypeRegistry::new()
            .with(1, "entity_body")
            .unwrap()
            .with(2, "price")
            .unwrap();

        assert_eq!(registry.name_of(2), Some("price"));
        assert_eq!(registry.name_of(-2), Some("price"));
        assert_eq!(registry.id_of("entity_body"), Some(1));
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec![1, 2]);
        registry.ensure_known(1).unwrap();
        assert!(matches!(
            registry.ensure_known(3),
            Err(CoreError::UnknownRecordType { id: 3 })
        ));
    }

    #[test]
    fn registry_rejects_duplicates_and_non_positive_ids() {
        let mut registry = RecordTypeRegistry::new();
        registry.register(1, "a").unwrap();
        assert!(registry.register(1, "b").is_err());
        assert!(registry.register(2, "a").is_err());
        assert!(registry.register(0, "zero").is_err());
        assert!(registry.register(-1, "negative").is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn raw_part_key() {
        let part = RawStoragePart::new(4, 99, vec![1, 2]);
        assert_eq!(part.record_key(), Some(RecordKey::new(4, 99)));
        assert_eq!(part.estimated_size(), 2);
    }

    #[test]
    fn raw_codec_passes_bytes_through() {
        let mut codec = RawCodecFactory.create(Arc::new(ReadOnlyKeyCompressor::default()));
        let part = RawStoragePart::new(3, 5, vec![9, 8, 7]);
        let bytes = codec.encode(&part).unwrap();
        assert_eq!(bytes, vec![9, 8, 7]);
        assert_eq!(codec.decode(&bytes, 3).unwrap().bytes, vec![9, 8, 7]);
        assert!(codec.decode(&bytes, -3).is_err());
    }
}
