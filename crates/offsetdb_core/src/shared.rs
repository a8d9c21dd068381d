//! The shared key-to-location map.
//!
//! [`SharedIndex`] is immutable once published. Promotion builds a modified
//! copy and the engine swaps the `Arc` in one step, so readers either see
//! the complete old map or the complete new one.

use crate::serialization::CollectingIndexBuilder;
use crate::types::{RecordKey, StoredLocation, VersionedValue};
use std::collections::HashMap;

/// Latest durable location of every live key, with per-type counts.
#[derive(Debug, Clone, Default)]
pub struct SharedIndex {
    /// Catalog version of the last flush, if any.
    pub flushed_version: Option<u64>,
    /// Live keys.
    pub locations: HashMap<RecordKey, StoredLocation>,
    /// Live keys per record type.
    pub histogram: HashMap<i8, u64>,
    /// Sum of the lengths of all live records.
    pub total_size: u64,
    /// Length of the largest record promoted so far.
    pub max_record_size: u32,
}

impl SharedIndex {
    /// Builds the map from a replayed fragment chain. Replayed entries are
    /// visible to every version.
    #[must_use]
    pub fn from_builder(builder: CollectingIndexBuilder, flushed_version: Option<u64>) -> Self {
        let histogram = builder.histogram().clone();
        let total_size = builder.total_size();
        let max_record_size = builder.max_record_size();
        let locations = builder
            .into_locations()
            .into_iter()
            .map(|(key, location)| {
                (
                    key,
                    StoredLocation {
                        location,
                        generation: 0,
                    },
                )
            })
            .collect();
        Self {
            flushed_version,
            locations,
            histogram,
            total_size,
            max_record_size,
        }
    }

    /// Location of `key` as visible to readers of `version`.
    #[must_use]
    pub fn get(&self, version: u64, key: RecordKey) -> Option<VersionedValue> {
        self.locations
            .get(&key)
            .filter(|stored| stored.generation <= version)
            .map(|stored| VersionedValue::new(key.primary_key, key.record_type, stored.location))
    }

    /// Whether readers of `version` must consult the historical overlay.
    #[must_use]
    pub fn is_historical(&self, version: u64) -> bool {
        self.flushed_version.is_some_and(|flushed| version < flushed)
    }

    /// Number of live keys of a type.
    #[must_use]
    pub fn count_of_type(&self, record_type: i8) -> u64 {
        self.histogram.get(&record_type).copied().unwrap_or(0)
    }

    /// Number of live keys.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.locations.len() as u64
    }
}
