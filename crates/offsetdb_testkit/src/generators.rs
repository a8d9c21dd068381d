//! Property-based test generators using proptest.
//!
//! Provides strategies for generating record values and versioned batches
//! of index operations. Primary keys are drawn from a small range so
//! batches overwrite and remove each other's keys.

use crate::fixtures::TestPart;
use offsetdb_core::RecordKey;
use proptest::prelude::*;

/// Upper bound (exclusive) of generated primary keys.
pub const KEY_SPACE: i64 = 16;

/// Strategy for generating primary keys.
pub fn primary_key_strategy() -> impl Strategy<Value = i64> {
    0..KEY_SPACE
}

/// Strategy for generating entity bodies.
pub fn entity_part_strategy() -> impl Strategy<Value = TestPart> {
    (
        primary_key_strategy(),
        prop::string::string_regex("[a-z]{1,24}").expect("Invalid regex"),
    )
        .prop_map(|(id, name)| TestPart::entity(id, name))
}

/// Strategy for generating prices.
pub fn price_part_strategy() -> impl Strategy<Value = TestPart> {
    (primary_key_strategy(), any::<u64>()).prop_map(|(id, cents)| TestPart::price(id, cents))
}

/// Strategy for generating attribute buckets over a few attribute names.
pub fn bucket_part_strategy() -> impl Strategy<Value = TestPart> {
    (
        prop::sample::select(vec!["color", "size", "brand", "origin"]),
        prop::collection::vec(primary_key_strategy(), 0..8),
    )
        .prop_map(|(attribute, members)| TestPart::bucket(attribute, members))
}

/// Strategy for generating any record value.
pub fn test_part_strategy() -> impl Strategy<Value = TestPart> {
    prop_oneof![
        3 => entity_part_strategy(),
        2 => price_part_strategy(),
        1 => bucket_part_strategy(),
    ]
}

/// Strategy for generating keys of entity bodies and prices.
pub fn removable_key_strategy() -> impl Strategy<Value = RecordKey> {
    prop_oneof![
        primary_key_strategy().prop_map(TestPart::entity_key),
        primary_key_strategy().prop_map(TestPart::price_key),
    ]
}

/// A single write against the index.
#[derive(Debug, Clone)]
pub enum IndexOperation {
    /// Put a value
    Put(TestPart),
    /// Remove a key
    Remove(RecordKey),
}

/// Strategy for generating index operations.
pub fn index_operation_strategy() -> impl Strategy<Value = IndexOperation> {
    prop_oneof![
        3 => test_part_strategy().prop_map(IndexOperation::Put),
        1 => removable_key_strategy().prop_map(IndexOperation::Remove),
    ]
}

/// The operations of one catalog version.
#[derive(Debug, Clone)]
pub struct VersionBatch {
    /// Operations applied at this version.
    pub operations: Vec<IndexOperation>,
    /// Whether the version is flushed right after its operations.
    pub flush: bool,
}

/// Strategy for generating one version batch.
pub fn version_batch_strategy(max_ops: usize) -> impl Strategy<Value = VersionBatch> {
    (
        prop::collection::vec(index_operation_strategy(), 0..max_ops),
        prop::bool::weighted(0.6),
    )
        .prop_map(|(operations, flush)| VersionBatch { operations, flush })
}

/// Strategy for generating a sequence of version batches, applied at
/// versions `1..=len`.
pub fn version_batches_strategy(
    min_versions: usize,
    max_versions: usize,
) -> impl Strategy<Value = Vec<VersionBatch>> {
    prop::collection::vec(version_batch_strategy(12), min_versions..max_versions)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsetdb_core::StoragePart;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn generated_keys_stay_in_range(part in test_part_strategy()) {
            if let Some(pk) = part.storage_part_pk() {
                prop_assert!((0..KEY_SPACE).contains(&pk));
            }
            prop_assert!(part.record_type() > 0);
        }

        #[test]
        fn buckets_have_no_key_yet(part in bucket_part_strategy()) {
            prop_assert_eq!(part.storage_part_pk(), None);
        }

        #[test]
        fn removals_target_positive_types(key in removable_key_strategy()) {
            prop_assert!(key.record_type > 0);
        }
    }
}
