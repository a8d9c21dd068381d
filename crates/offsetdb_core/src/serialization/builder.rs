//! Sinks fed while replaying the fragment chain.

use crate::types::{FileLocation, RecordKey};
use std::collections::HashMap;

/// Receives the live keys found while walking fragments from tail to root.
///
/// The walk visits newer fragments first, so the first registration of a
/// key wins; the walker never registers a key `contains` reports.
pub trait IndexBuilder {
    /// Records the live location of `key`.
    fn register(&mut self, key: RecordKey, location: FileLocation);

    /// Records that `key` was removed in its newest fragment.
    fn register_removal(&mut self, _key: RecordKey) {}

    /// Whether `key` is already resolved.
    fn contains(&self, key: RecordKey) -> bool;

    /// When true, the walk stops early.
    fn is_complete(&self) -> bool {
        false
    }
}

/// Collects the whole key-to-location map along with a per-type histogram
/// and size statistics.
#[derive(Debug, Default, Clone)]
pub struct CollectingIndexBuilder {
    locations: HashMap<RecordKey, FileLocation>,
    histogram: HashMap<i8, u64>,
    total_size: u64,
    max_record_size: u32,
}

impl CollectingIndexBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected locations.
    #[must_use]
    pub fn locations(&self) -> &HashMap<RecordKey, FileLocation> {
        &self.locations
    }

    /// Live keys per record type.
    #[must_use]
    pub fn histogram(&self) -> &HashMap<i8, u64> {
        &self.histogram
    }

    /// Sum of the lengths of all live records.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Length of the largest live record.
    #[must_use]
    pub fn max_record_size(&self) -> u32 {
        self.max_record_size
    }

    /// Consumes the builder.
    #[must_use]
    pub fn into_locations(self) -> HashMap<RecordKey, FileLocation> {
        self.locations
    }
}

impl IndexBuilder for CollectingIndexBuilder {
    fn register(&mut self, key: RecordKey, location: FileLocation) {
        if self.locations.insert(key, location).is_none() {
            *self.histogram.entry(key.record_type).or_insert(0) += 1;
            self.total_size += u64::from(location.length);
            self.max_record_size = self.max_record_size.max(location.length);
        }
    }

    fn contains(&self, key: RecordKey) -> bool {
        self.locations.contains_key(&key)
    }
}

/// Extracts a single key without materialising the whole index.
#[derive(Debug, Clone)]
pub struct FilteringIndexBuilder {
    target: RecordKey,
    location: Option<FileLocation>,
    resolved: bool,
}

impl FilteringIndexBuilder {
    /// Creates a builder looking for `target`.
    #[must_use]
    pub fn new(target: RecordKey) -> Self {
        Self {
            target: target.normalized(),
            location: None,
            resolved: false,
        }
    }

    fn matches(&self, key: RecordKey) -> bool {
        key.normalized() == self.target
    }

    /// Location of the target, if it is live.
    #[must_use]
    pub fn location(&self) -> Option<FileLocation> {
        self.location
    }
}

impl IndexBuilder for FilteringIndexBuilder {
    fn register(&mut self, key: RecordKey, location: FileLocation) {
        if self.matches(key) && !self.resolved {
            self.location = Some(location);
            self.resolved = true;
        }
    }

    fn register_removal(&mut self, key: RecordKey) {
        if self.matches(key) {
            self.resolved = true;
        }
    }

    fn contains(&self, key: RecordKey) -> bool {
        self.resolved && self.matches(key)
    }

    fn is_complete(&self) -> bool {
        self.resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_builder_keeps_first_registration() {
        let mut builder = CollectingIndexBuilder::new();
        let key = RecordKey::new(1, 10);
        builder.register(key, FileLocation::new(100, 30));
        builder.register(key, FileLocation::new(0, 50));
        builder.register(RecordKey::new(2, 10), FileLocation::new(200, 70));

        assert_eq!(builder.locations()[&key], FileLocation::new(100, 30));
        assert_eq!(builder.histogram()[&1], 1);
        assert_eq!(builder.histogram()[&2], 1);
        assert_eq!(builder.total_size(), 100);
        assert_eq!(builder.max_record_size(), 70);
        assert!(builder.contains(key));
    }

    #[test]
    fn filtering_builder_ignores_other_keys() {
        let mut builder = FilteringIndexBuilder::new(RecordKey::new(3, 1));
        builder.register(RecordKey::new(3, 2), FileLocation::new(0, 22));
        assert!(!builder.is_complete());

        builder.register(RecordKey::new(3, 1), FileLocation::new(22, 22));
        assert!(builder.is_complete());
        assert_eq!(builder.location(), Some(FileLocation::new(22, 22)));
    }

    #[test]
    fn filtering_builder_matches_tombstone_sign() {
        let mut builder = FilteringIndexBuilder::new(RecordKey::new(3, 1));
        builder.register_removal(RecordKey::new(-3, 1));
        assert!(builder.is_complete());
        assert!(builder.contains(RecordKey::new(3, 1)));
        assert!(builder.contains(RecordKey::new(-3, 1)));
        assert_eq!(builder.location(), None);
    }
}
