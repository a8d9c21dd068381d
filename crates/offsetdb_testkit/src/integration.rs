//! Cross-crate integration test helpers.
//!
//! [`IntegrationHarness`] drives a file-backed index alongside a model that
//! remembers the expected state of every catalog version, so reads at old
//! versions can be checked after later writes and flushes.

use crate::fixtures::{TestIndex, TestPart};
use crate::generators::{IndexOperation, VersionBatch};
use offsetdb_core::{RecordKey, StoragePart};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A test harness for integration testing.
pub struct IntegrationHarness {
    /// The index under test.
    pub index: TestIndex,
    current: HashMap<RecordKey, TestPart>,
    snapshots: BTreeMap<u64, HashMap<RecordKey, TestPart>>,
    touched: BTreeSet<RecordKey>,
}

impl IntegrationHarness {
    /// Creates a harness over an empty index.
    pub fn new() -> Self {
        Self {
            index: TestIndex::new(),
            current: HashMap::new(),
            snapshots: BTreeMap::new(),
            touched: BTreeSet::new(),
        }
    }

    /// Puts a value at `version` and tracks it. Returns its key.
    pub fn put(&mut self, version: u64, part: TestPart) -> RecordKey {
        let pk = self
            .index
            .put(version, part.clone())
            .expect("Failed to put value");
        let key = RecordKey::new(part.record_type(), pk);
        let mut stored = part;
        if let TestPart::AttributeBucket { id, .. } = &mut stored {
            *id = Some(pk);
        }
        self.current.insert(key, stored);
        self.touched.insert(key);
        self.snapshots.insert(version, self.current.clone());
        key
    }

    /// Removes a key at `version` and checks the reported outcome against
    /// the model.
    pub fn remove(&mut self, version: u64, key: RecordKey) {
        let removed = self
            .index
            .remove(version, key)
            .expect("Failed to remove value");
        let expected = self.current.remove(&key).is_some();
        assert_eq!(removed, expected, "remove({}) at version {}", key, version);
        self.touched.insert(key);
        self.snapshots.insert(version, self.current.clone());
    }

    /// Flushes every pending write under `version`.
    pub fn flush(&mut self, version: u64) {
        self.index.flush(version).expect("Failed to flush");
        self.snapshots
            .entry(version)
            .or_insert_with(|| self.current.clone());
    }

    /// Applies generated batches at versions `1..=batches.len()`, flushing
    /// the last one regardless of its flag.
    pub fn apply_batches(&mut self, batches: &[VersionBatch]) {
        for (n, batch) in batches.iter().enumerate() {
            let version = n as u64 + 1;
            for operation in &batch.operations {
                match operation {
                    IndexOperation::Put(part) => {
                        self.put(version, part.clone());
                    }
                    IndexOperation::Remove(key) => self.remove(version, *key),
                }
            }
            self.snapshots
                .entry(version)
                .or_insert_with(|| self.current.clone());
            if batch.flush || n + 1 == batches.len() {
                self.flush(version);
            }
        }
    }

    /// The state the model expects at `version`.
    pub fn expected_at(&self, version: u64) -> HashMap<RecordKey, TestPart> {
        self.snapshots
            .range(..=version)
            .next_back()
            .map(|(_, state)| state.clone())
            .unwrap_or_default()
    }

    /// Checks every touched key at `version`.
    pub fn verify_version(&self, version: u64) {
        let expected = self.expected_at(version);
        for key in &self.touched {
            let actual = self.index.get(version, *key).expect("Failed to get value");
            assert_eq!(
                actual.as_ref(),
                expected.get(key),
                "value of {} at version {}",
                key,
                version
            );
        }
        assert_eq!(
            self.index.count(version).expect("Failed to count"),
            expected.len() as u64,
            "count at version {}",
            version
        );
    }

    /// Checks every version the model has seen.
    pub fn verify_all(&self) {
        for version in self.snapshots.keys() {
            self.verify_version(*version);
        }
    }

    /// Highest version the model has seen.
    pub fn latest_version(&self) -> u64 {
        self.snapshots.keys().next_back().copied().unwrap_or(0)
    }

    /// Reopens the index. Replayed entries carry no version, so only the
    /// latest state is kept in the model.
    pub fn reopen(self) -> Self {
        let latest = self.latest_version();
        let Self {
            index,
            current,
            touched,
            ..
        } = self;
        let mut snapshots = BTreeMap::new();
        snapshots.insert(latest, current.clone());
        Self {
            index: index.reopen(),
            current,
            snapshots,
            touched,
        }
    }

    /// Returns the count of tracked live keys.
    pub fn tracked_count(&self) -> usize {
        self.current.len()
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// End-to-end scenarios over a fresh index.
pub mod scenarios {
    use super::*;
    use offsetdb_core::{CopyProgress, CoreError, OffsetIndex};
    use std::fs::File;
    use std::io::{Seek, SeekFrom, Write};

    /// A value overwritten in a later flushed version stays readable at
    /// the earlier version.
    pub fn overwritten_value_stays_visible(index: &TestIndex) {
        let key = TestPart::entity_key(1);
        index.put(1, TestPart::entity(1, "a")).expect("put");
        index.flush(1).expect("flush");
        index.put(2, TestPart::entity(1, "b")).expect("put");
        index.flush(2).expect("flush");

        assert_eq!(index.get(1, key).expect("get"), Some(TestPart::entity(1, "a")));
        assert_eq!(index.get(2, key).expect("get"), Some(TestPart::entity(1, "b")));
    }

    /// A value that was never flushed is readable at its version.
    pub fn pending_value_is_readable(index: &TestIndex) {
        index.put(1, TestPart::entity(1, "a")).expect("put");
        assert_eq!(
            index.get(1, TestPart::entity_key(1)).expect("get"),
            Some(TestPart::entity(1, "a"))
        );
        assert_eq!(index.pending_versions(), vec![1]);
    }

    /// Put and remove in one version leave no trace.
    pub fn put_then_remove_nets_out(index: &TestIndex) {
        let key = TestPart::price_key(5);
        let before = index.count_of_type(3, key.record_type).expect("count");
        index.put(3, TestPart::price(5, 100)).expect("put");
        assert!(index.remove(3, key).expect("remove"));
        index.flush(3).expect("flush");

        assert_eq!(index.get(3, key).expect("get"), None);
        assert_eq!(index.count_of_type(3, key.record_type).expect("count"), before);
    }

    /// Purging a version drops its history once the next flush runs.
    pub fn purge_reclaims_history(index: &TestIndex) {
        overwritten_value_stays_visible(index);
        assert_eq!(index.historical_versions(), vec![1, 2]);
        index.purge(1).expect("purge");
        index.put(3, TestPart::price(1, 1)).expect("put");
        index.flush(3).expect("flush");
        assert_eq!(index.historical_versions(), vec![2, 3]);
        assert_eq!(
            index.get(3, TestPart::entity_key(1)).expect("get"),
            Some(TestPart::entity(1, "b"))
        );
    }

    /// A snapshot copy with an override serves the override at every version.
    pub fn snapshot_override_wins(index: &TestIndex) {
        overwritten_value_stays_visible(index);
        let path = index.dir().join("snapshot.odb");
        let mut out = File::create(&path).expect("create snapshot");
        let descriptor = index
            .copy_snapshot_to(
                &mut out,
                &mut |_: CopyProgress| {},
                2,
                vec![TestPart::entity(1, "c")],
            )
            .expect("copy snapshot");
        drop(out);

        let copy = OffsetIndex::open_file(
            &path,
            descriptor,
            crate::fixtures::test_registry(),
            index.options().clone(),
        )
        .expect("open snapshot");
        for version in [0, 1, 2, 10] {
            assert_eq!(
                copy.get(version, TestPart::entity_key(1)).expect("get"),
                Some(TestPart::entity(1, "c"))
            );
        }
    }

    /// Flips the first payload byte of the value stored under `key`.
    pub fn corrupt_value(index: &TestIndex, key: RecordKey) {
        let location = index
            .entries()
            .expect("entries")
            .into_iter()
            .find(|value| value.key() == key)
            .map(|value| value.location)
            .expect("key is flushed");
        let position = location.start + offsetdb_core::record::HEADER_SIZE as u64;
        let bytes = std::fs::read(index.path()).expect("read file");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(index.path())
            .expect("open file");
        file.seek(SeekFrom::Start(position)).expect("seek");
        file.write_all(&[bytes[position as usize] ^ 0xff])
            .expect("write");
        file.sync_all().expect("sync");
    }

    /// A damaged value is reported with its key and fails verification.
    pub fn corruption_is_detected(index: &TestIndex) {
        let key = TestPart::entity_key(7);
        index.put(1, TestPart::entity(7, "fragile")).expect("put");
        index.flush(1).expect("flush");
        corrupt_value(index, key);

        let err = index.get(1, key).expect_err("corrupted read");
        assert!(matches!(
            err,
            CoreError::CorruptedKeyValueRecord {
                primary_key: 7,
                ..
            }
        ));
        assert!(index
            .verify_contents()
            .expect_err("corrupted file")
            .is_corruption());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::{version_batches_strategy, PropTestConfig};
    use proptest::prelude::*;

    #[test]
    fn test_integration_harness() {
        let mut harness = IntegrationHarness::new();
        let key = harness.put(1, TestPart::entity(1, "first"));
        harness.put(2, TestPart::entity(1, "second"));
        harness.flush(2);
        harness.remove(3, key);
        harness.flush(3);

        assert_eq!(harness.tracked_count(), 0);
        harness.verify_all();
    }

    #[test]
    fn scenario_overwritten_value() {
        scenarios::overwritten_value_stays_visible(&TestIndex::new());
    }

    #[test]
    fn scenario_pending_value() {
        scenarios::pending_value_is_readable(&TestIndex::new());
    }

    #[test]
    fn scenario_put_then_remove() {
        scenarios::put_then_remove_nets_out(&TestIndex::new());
    }

    #[test]
    fn put_then_remove_survives_reopen() {
        let index = TestIndex::new();
        scenarios::put_then_remove_nets_out(&index);
        let descriptor = index.descriptor();
        let file_size = std::fs::metadata(index.path()).unwrap().len();
        assert_eq!(descriptor.file_size, file_size);

        let index = index.reopen();
        assert_eq!(index.get(3, TestPart::price_key(5)).unwrap(), None);
        assert_eq!(index.count(3).unwrap(), 0);
        index.put(4, TestPart::price(5, 200)).unwrap();
        index.flush(4).unwrap();
        assert_eq!(
            index.get(4, TestPart::price_key(5)).unwrap(),
            Some(TestPart::price(5, 200))
        );
    }

    #[test]
    fn scenario_purge() {
        scenarios::purge_reclaims_history(&TestIndex::new());
    }

    #[test]
    fn scenario_snapshot_override() {
        scenarios::snapshot_override_wins(&TestIndex::new());
    }

    #[test]
    fn scenario_corruption() {
        scenarios::corruption_is_detected(&TestIndex::new());
    }

    #[test]
    fn removal_is_final_across_reopen() {
        let mut harness = IntegrationHarness::new();
        let key = harness.put(1, TestPart::price(4, 400));
        harness.flush(1);
        harness.remove(2, key);
        harness.flush(2);

        let harness = harness.reopen();
        assert_eq!(harness.index.get(2, key).unwrap(), None);
        assert!(!harness.index.contains(0, key).unwrap());
        harness.verify_version(harness.latest_version());
    }

    #[test]
    fn histogram_matches_live_keys() {
        let index = TestIndex::new();
        for id in 0..6 {
            index.put(1, TestPart::entity(id, "e")).unwrap();
        }
        for id in 0..3 {
            index.put(1, TestPart::price(id, 10)).unwrap();
        }
        index.put(1, TestPart::bucket("color", vec![1])).unwrap();
        index.flush(1).unwrap();
        index.remove(2, TestPart::entity_key(0)).unwrap();
        index.flush(2).unwrap();

        assert_eq!(index.count_of_type(2, crate::ENTITY_BODY).unwrap(), 5);
        assert_eq!(index.count_of_type(2, crate::PRICE).unwrap(), 3);
        assert_eq!(index.count_of_type(2, crate::ATTRIBUTE_BUCKET).unwrap(), 1);
        assert_eq!(index.count_of_type(1, crate::ENTITY_BODY).unwrap(), 6);
        assert_eq!(index.count(2).unwrap(), 9);
    }

    #[test]
    fn compaction_is_idempotent() {
        let index = TestIndex::new();
        for version in 1..6 {
            index.put(version, TestPart::entity(1, format!("v{}", version))).unwrap();
            index.put(version, TestPart::price(version as i64, version)).unwrap();
            index.flush(version).unwrap();
        }

        let first_path = index.dir().join("first.odb");
        let first = index.compact(&first_path).unwrap();
        let compacted = offsetdb_core::OffsetIndex::open_file(
            &first_path,
            first.clone(),
            crate::test_registry(),
            index.options().clone(),
        )
        .unwrap();

        let second_path = index.dir().join("second.odb");
        let second = compacted.compact(&second_path).unwrap();
        assert_eq!(first.file_size, second.file_size);
        assert_eq!(
            std::fs::read(&first_path).unwrap(),
            std::fs::read(&second_path).unwrap()
        );
        assert_eq!(
            compacted.get(5, TestPart::entity_key(1)).unwrap(),
            Some(TestPart::entity(1, "v5"))
        );
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn every_version_reads_its_snapshot(batches in version_batches_strategy(1, 8)) {
            let mut harness = IntegrationHarness::new();
            harness.apply_batches(&batches);
            harness.verify_all();
        }

        #[test]
        fn reopen_replays_latest_state(batches in version_batches_strategy(1, 8)) {
            let mut harness = IntegrationHarness::new();
            harness.apply_batches(&batches);
            let harness = harness.reopen();
            harness.verify_version(harness.latest_version());
            prop_assert!(harness.index.pending_versions().is_empty());
        }
    }
}
