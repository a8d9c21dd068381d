//! Volatile MVCC overlay.
//!
//! Two kinds of in-memory layers sit on top of the shared map:
//!
//! - a [`NonFlushedValueSet`] per pending catalog version, holding writes
//!   that are in the file but not yet described by a fragment
//! - a [`PastMemory`] per flushed catalog version, holding the values that
//!   flush replaced, for readers still working with older versions
//!
//! Both lists are kept sorted by catalog version inside an `Arc<Vec<_>>`
//! that is replaced wholesale on change, so readers never observe a
//! partially updated list.
//!
//! Pending sets are only mutated by the single writer. History is managed
//! under its own bookkeeping lock: [`VolatileValues::purge`] only records a
//! threshold and the next promotion drops the memories at or below it.

use crate::shared::SharedIndex;
use crate::types::{RecordKey, StoredLocation, VersionedValue};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
struct NonFlushedState {
    values: HashMap<RecordKey, VersionedValue>,
    added: HashSet<RecordKey>,
    removed: HashSet<RecordKey>,
    counts: HashMap<i8, i64>,
}

/// Writes of one pending catalog version.
#[derive(Debug)]
pub struct NonFlushedValueSet {
    catalog_version: u64,
    state: RwLock<NonFlushedState>,
}

impl NonFlushedValueSet {
    fn new(catalog_version: u64) -> Self {
        Self {
            catalog_version,
            state: RwLock::new(NonFlushedState::default()),
        }
    }

    /// The catalog version of the writes.
    #[must_use]
    pub fn catalog_version(&self) -> u64 {
        self.catalog_version
    }

    /// The newest value written for `key` in this version.
    #[must_use]
    pub fn get(&self, key: RecordKey) -> Option<VersionedValue> {
        self.state.read().values.get(&key).copied()
    }

    /// Net change of live keys of `record_type`.
    #[must_use]
    pub fn count_delta(&self, record_type: i8) -> i64 {
        self.state.read().counts.get(&record_type).copied().unwrap_or(0)
    }

    /// Net change of live keys over all types.
    #[must_use]
    pub fn total_delta(&self) -> i64 {
        self.state.read().counts.values().sum()
    }

    /// Snapshot of all values, removals included.
    #[must_use]
    pub fn values(&self) -> Vec<VersionedValue> {
        self.state.read().values.values().copied().collect()
    }

    /// Keys created in this version.
    #[must_use]
    pub fn added(&self) -> HashSet<RecordKey> {
        self.state.read().added.clone()
    }

    /// Keys removed in this version that existed before it.
    #[must_use]
    pub fn removed(&self) -> HashSet<RecordKey> {
        self.state.read().removed.clone()
    }

    fn put(&self, key: RecordKey, value: VersionedValue, is_new: bool) {
        let mut state = self.state.write();
        state.values.insert(key, value);
        if is_new {
            *state.counts.entry(key.record_type).or_insert(0) += 1;
            if !state.removed.remove(&key) {
                state.added.insert(key);
            }
        }
    }

    fn remove(&self, key: RecordKey, removal: VersionedValue) {
        let mut state = self.state.write();
        state.values.insert(key, removal);
        *state.counts.entry(key.record_type).or_insert(0) -= 1;
        if !state.added.remove(&key) {
            state.removed.insert(key);
        }
    }
}

/// Values replaced by the flush of one catalog version.
#[derive(Debug)]
pub struct PastMemory {
    catalog_version: u64,
    previous: HashMap<RecordKey, VersionedValue>,
    added: HashSet<RecordKey>,
    removed: HashSet<RecordKey>,
    counts: HashMap<i8, i64>,
    created: Instant,
}

impl PastMemory {
    fn new(catalog_version: u64) -> Self {
        Self {
            catalog_version,
            previous: HashMap::new(),
            added: HashSet::new(),
            removed: HashSet::new(),
            counts: HashMap::new(),
            created: Instant::now(),
        }
    }

    /// The catalog version whose flush this memory describes.
    #[must_use]
    pub fn catalog_version(&self) -> u64 {
        self.catalog_version
    }

    /// When the memory was recorded.
    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Net change of live keys of `record_type` made by the flush.
    #[must_use]
    pub fn count_delta(&self, record_type: i8) -> i64 {
        self.counts.get(&record_type).copied().unwrap_or(0)
    }

    fn touches(&self, key: RecordKey) -> bool {
        self.added.contains(&key) || self.previous.contains_key(&key)
    }
}

/// Outcome of a historical lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoricalValue {
    /// The value valid for the requested version, if the key existed.
    pub value: Option<VersionedValue>,
    /// The key was removed by a later flush.
    pub removed: bool,
    /// The key was created by a later flush, so it did not exist yet.
    pub added_in_future: bool,
}

/// Counts of a promotion, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionSummary {
    /// Keys that did not exist before.
    pub inserted: usize,
    /// Keys whose location changed.
    pub updated: usize,
    /// Keys that disappeared.
    pub removed: usize,
}

/// The overlay of pending and historical values.
#[derive(Debug, Default)]
pub struct VolatileValues {
    pending: RwLock<Arc<Vec<Arc<NonFlushedValueSet>>>>,
    history: RwLock<Arc<Vec<Arc<PastMemory>>>>,
    history_lock: Mutex<()>,
    purge_up_to: Mutex<Option<u64>>,
}

impl VolatileValues {
    /// Creates an empty overlay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pending_snapshot(&self) -> Arc<Vec<Arc<NonFlushedValueSet>>> {
        Arc::clone(&self.pending.read())
    }

    fn history_snapshot(&self) -> Arc<Vec<Arc<PastMemory>>> {
        Arc::clone(&self.history.read())
    }

    fn set_for(&self, version: u64) -> Arc<NonFlushedValueSet> {
        let mut guard = self.pending.write();
        if let Some(last) = guard.last() {
            if last.catalog_version == version {
                return Arc::clone(last);
            }
        }
        let set = Arc::new(NonFlushedValueSet::new(version));
        let mut next = (**guard).clone();
        next.push(Arc::clone(&set));
        *guard = Arc::new(next);
        set
    }

    /// Records a write. Versions must arrive in non-decreasing order.
    pub fn put_value(&self, version: u64, key: RecordKey, value: VersionedValue, is_new: bool) {
        self.set_for(version).put(key, value, is_new);
    }

    /// Records the removal of the live value stored at `prior`.
    pub fn remove_value(&self, version: u64, key: RecordKey, prior: VersionedValue) {
        let removal = VersionedValue::removal(key.primary_key, key.record_type, prior.location);
        self.set_for(version).remove(key, removal);
    }

    /// The newest pending value of `key` visible to `version`.
    ///
    /// A removal is returned as such; callers treat it as "absent".
    #[must_use]
    pub fn get_non_flushed(&self, version: u64, key: RecordKey) -> Option<VersionedValue> {
        let pending = self.pending_snapshot();
        let visible = pending.partition_point(|set| set.catalog_version <= version);
        pending[..visible].iter().rev().find_map(|set| set.get(key))
    }

    /// The value `key` had for readers of `version`, according to flushes
    /// of later versions. The memory of `version` itself is skipped, since
    /// its changes are visible to readers of that version.
    ///
    /// Returns `None` when no later flush touched the key.
    #[must_use]
    pub fn get_historical(&self, version: u64, key: RecordKey) -> Option<HistoricalValue> {
        let history = self.history_snapshot();
        let first = history.partition_point(|memory| memory.catalog_version < version);
        history[first..]
            .iter()
            .filter(|memory| memory.catalog_version != version)
            .find(|memory| memory.touches(key))
            .map(|memory| {
                if memory.added.contains(&key) {
                    HistoricalValue {
                        value: None,
                        removed: false,
                        added_in_future: true,
                    }
                } else {
                    HistoricalValue {
                        value: memory.previous.get(&key).copied(),
                        removed: memory.removed.contains(&key),
                        added_in_future: false,
                    }
                }
            })
    }

    /// Pending sets in ascending version order.
    #[must_use]
    pub fn pending_sets(&self) -> Vec<Arc<NonFlushedValueSet>> {
        self.pending_snapshot().iter().cloned().collect()
    }

    /// Catalog versions with pending writes.
    #[must_use]
    pub fn pending_versions(&self) -> Vec<u64> {
        self.pending_snapshot()
            .iter()
            .map(|set| set.catalog_version)
            .collect()
    }

    /// Highest catalog version with pending writes.
    #[must_use]
    pub fn max_pending_version(&self) -> Option<u64> {
        self.pending_snapshot().last().map(|set| set.catalog_version)
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending_snapshot().is_empty()
    }

    /// Catalog versions with recorded history.
    #[must_use]
    pub fn historical_versions(&self) -> Vec<u64> {
        self.history_snapshot()
            .iter()
            .map(|memory| memory.catalog_version)
            .collect()
    }

    /// Creation time of the oldest retained memory.
    #[must_use]
    pub fn oldest_history(&self) -> Option<Instant> {
        self.history_snapshot().first().map(|memory| memory.created)
    }

    /// Net pending change of live keys visible to `version`.
    #[must_use]
    pub fn pending_count_delta(&self, version: u64, record_type: Option<i8>) -> i64 {
        self.pending_snapshot()
            .iter()
            .take_while(|set| set.catalog_version <= version)
            .map(|set| match record_type {
                Some(t) => set.count_delta(t),
                None => set.total_delta(),
            })
            .sum()
    }

    /// Net change of live keys made by flushes newer than `version`.
    ///
    /// Only memories up to `flushed_version` count; newer ones belong to a
    /// flush whose map is not published yet.
    #[must_use]
    pub fn history_count_delta(
        &self,
        version: u64,
        flushed_version: Option<u64>,
        record_type: Option<i8>,
    ) -> i64 {
        let flushed = flushed_version.unwrap_or(0);
        self.history_snapshot()
            .iter()
            .filter(|memory| memory.catalog_version > version && memory.catalog_version <= flushed)
            .map(|memory| match record_type {
                Some(t) => memory.count_delta(t),
                None => memory.counts.values().sum(),
            })
            .sum()
    }

    /// Undoes, in `map`, the flushes of versions newer than `version`.
    pub fn rollback(&self, version: u64, map: &mut HashMap<RecordKey, VersionedValue>) {
        let history = self.history_snapshot();
        for memory in history.iter().rev() {
            if memory.catalog_version <= version {
                break;
            }
            for key in &memory.added {
                map.remove(key);
            }
            for (key, previous) in &memory.previous {
                map.insert(*key, *previous);
            }
        }
    }

    /// Applies, in `map`, the pending writes visible to `version`.
    pub fn apply_pending(&self, version: u64, map: &mut HashMap<RecordKey, VersionedValue>) {
        for set in self.pending_snapshot().iter() {
            if set.catalog_version > version {
                break;
            }
            for value in set.values() {
                if value.is_removal() {
                    map.remove(&value.key());
                } else {
                    map.insert(value.key(), value);
                }
            }
        }
    }

    /// Marks memories of versions at or below `version` for removal at the
    /// next promotion.
    pub fn purge(&self, version: u64) {
        let mut threshold = self.purge_up_to.lock();
        *threshold = Some(threshold.map_or(version, |current| current.max(version)));
        tracing::debug!(version, "history purge scheduled");
    }

    /// Applies `sets` to a copy of `shared`, records what they replaced and
    /// returns the new map. History is installed before returning, so it is
    /// in place when the caller publishes the new map.
    pub fn promote(
        &self,
        sets: &[Arc<NonFlushedValueSet>],
        shared: &SharedIndex,
        flushed_version: u64,
    ) -> (SharedIndex, PromotionSummary) {
        let mut next = shared.clone();
        next.flushed_version = Some(flushed_version);
        let mut memories = Vec::with_capacity(sets.len());
        let mut summary = PromotionSummary::default();

        for set in sets {
            let mut memory = PastMemory::new(set.catalog_version);
            let mut values = set.values();
            values.sort_by_key(VersionedValue::key);

            for value in values {
                let key = value.key();
                if value.is_removal() {
                    if let Some(prev) = next.locations.remove(&key) {
                        memory.previous.insert(
                            key,
                            VersionedValue::new(key.primary_key, key.record_type, prev.location),
                        );
                        memory.removed.insert(key);
                        *memory.counts.entry(key.record_type).or_insert(0) -= 1;
                        if let Some(count) = next.histogram.get_mut(&key.record_type) {
                            *count = count.saturating_sub(1);
                        }
                        next.total_size = next
                            .total_size
                            .saturating_sub(u64::from(prev.location.length));
                        summary.removed += 1;
                    }
                    continue;
                }

                let stored = StoredLocation {
                    location: value.location,
                    generation: set.catalog_version,
                };
                match next.locations.insert(key, stored) {
                    Some(prev) => {
                        memory.previous.insert(
                            key,
                            VersionedValue::new(key.primary_key, key.record_type, prev.location),
                        );
                        next.total_size = next
                            .total_size
                            .saturating_sub(u64::from(prev.location.length))
                            + u64::from(value.location.length);
                        summary.updated += 1;
                    }
                    None => {
                        memory.added.insert(key);
                        *memory.counts.entry(key.record_type).or_insert(0) += 1;
                        *next.histogram.entry(key.record_type).or_insert(0) += 1;
                        next.total_size += u64::from(value.location.length);
                        summary.inserted += 1;
                    }
                }
                next.max_record_size = next.max_record_size.max(value.location.length);
            }
            memories.push(Arc::new(memory));
        }

        self.install_history(memories);
        (next, summary)
    }

    fn install_history(&self, memories: Vec<Arc<PastMemory>>) {
        let _bookkeeping = self.history_lock.lock();
        let threshold = self.purge_up_to.lock().take();
        let mut history: Vec<Arc<PastMemory>> = (**self.history.read()).clone();
        if let Some(threshold) = threshold {
            let before = history.len();
            history.retain(|memory| memory.catalog_version > threshold);
            tracing::debug!(
                threshold,
                dropped = before - history.len(),
                "history purged"
            );
        }
        history.extend(memories);
        *self.history.write() = Arc::new(history);
    }

    /// Drops pending sets of versions at or below `version`.
    pub fn discard_pending(&self, version: u64) {
        let mut guard = self.pending.write();
        let remaining: Vec<_> = guard
            .iter()
            .filter(|set| set.catalog_version > version)
            .cloned()
            .collect();
        *guard = Arc::new(remaining);
    }
}

/// Final state of every key changed by `sets`, as written to fragments.
///
/// Later sets win. Removals of keys that never reached the shared map are
/// dropped. The result is sorted by key.
#[must_use]
pub fn merge_for_flush(sets: &[Arc<NonFlushedValueSet>], shared: &SharedIndex) -> Vec<VersionedValue> {
    let mut merged: BTreeMap<RecordKey, VersionedValue> = BTreeMap::new();
    for set in sets {
        for value in set.values() {
            merged.insert(value.key(), value);
        }
    }
    merged
        .into_iter()
        .filter(|(key, value)| !value.is_removal() || shared.locations.contains_key(key))
        .map(|(_, value)| value)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileLocation;

    const A: RecordKey = RecordKey::new(1, 1);
    const B: RecordKey = RecordKey::new(2, 5);

    fn value(key: RecordKey, start: u64) -> VersionedValue {
        VersionedValue::new(key.primary_key, key.record_type, FileLocation::new(start, 30))
    }

    fn flush(volatile: &VolatileValues, shared: &SharedIndex, version: u64) -> SharedIndex {
        let sets = volatile.pending_sets();
        let (next, _) = volatile.promote(&sets, shared, version);
        volatile.discard_pending(version);
        next
    }

    #[test]
    fn non_flushed_lookup_respects_version() {
        let volatile = VolatileValues::new();
        volatile.put_value(1, A, value(A, 0), true);
        volatile.put_value(3, A, value(A, 100), false);

        assert_eq!(volatile.get_non_flushed(0, A), None);
        assert_eq!(volatile.get_non_flushed(1, A), Some(value(A, 0)));
        assert_eq!(volatile.get_non_flushed(2, A), Some(value(A, 0)));
        assert_eq!(volatile.get_non_flushed(5, A), Some(value(A, 100)));
        assert_eq!(volatile.pending_versions(), vec![1, 3]);
        assert_eq!(volatile.max_pending_version(), Some(3));
    }

    #[test]
    fn removal_within_pending_version_is_visible() {
        let volatile = VolatileValues::new();
        volatile.put_value(3, B, value(B, 0), true);
        volatile.remove_value(3, B, value(B, 0));

        let found = volatile.get_non_flushed(3, B).unwrap();
        assert!(found.is_removal());
        assert_eq!(volatile.pending_count_delta(3, Some(2)), 0);

        let set = &volatile.pending_sets()[0];
        assert!(set.added().is_empty());
        assert!(set.removed().is_empty());
    }

    #[test]
    fn promotion_records_past_values() {
        let volatile = VolatileValues::new();
        let shared = SharedIndex::default();

        volatile.put_value(1, A, value(A, 0), true);
        let shared = flush(&volatile, &shared, 1);
        volatile.put_value(2, A, value(A, 100), false);
        let shared = flush(&volatile, &shared, 2);

        assert_eq!(shared.get(2, A), Some(value(A, 100)));
        assert!(shared.get(1, A).is_none());
        assert_eq!(shared.count_of_type(1), 1);

        let past = volatile.get_historical(1, A).unwrap();
        assert_eq!(past.value, Some(value(A, 0)));
        assert!(!past.added_in_future);

        let before = volatile.get_historical(0, A).unwrap();
        assert!(before.added_in_future);
        assert_eq!(before.value, None);
    }

    #[test]
    fn historical_lookup_skips_exact_version() {
        let volatile = VolatileValues::new();
        let shared = SharedIndex::default();

        volatile.put_value(1, A, value(A, 0), true);
        let shared = flush(&volatile, &shared, 1);
        volatile.put_value(2, A, value(A, 100), false);
        flush(&volatile, &shared, 2);

        // the change made at version 2 is visible to version 2 itself
        assert_eq!(volatile.get_historical(2, A), None);
        // version 1 sees the value version 2 replaced
        assert_eq!(volatile.get_historical(1, A).unwrap().value, Some(value(A, 0)));
    }

    #[test]
    fn removal_history_and_counts() {
        let volatile = VolatileValues::new();
        let shared = SharedIndex::default();

        volatile.put_value(1, B, value(B, 0), true);
        let shared = flush(&volatile, &shared, 1);
        volatile.remove_value(2, B, value(B, 0));
        assert_eq!(volatile.pending_count_delta(2, Some(2)), -1);
        assert_eq!(volatile.pending_count_delta(1, Some(2)), 0);

        let shared = flush(&volatile, &shared, 2);
        assert_eq!(shared.count_of_type(2), 0);
        assert_eq!(shared.total_size, 0);

        let past = volatile.get_historical(1, B).unwrap();
        assert!(past.removed);
        assert_eq!(past.value, Some(value(B, 0)));
        assert_eq!(volatile.history_count_delta(1, Some(2), Some(2)), -1);
        // a memory newer than the published map does not count yet
        assert_eq!(volatile.history_count_delta(1, Some(1), Some(2)), 0);
    }

    #[test]
    fn purge_applies_on_next_promotion() {
        let volatile = VolatileValues::new();
        let mut shared = SharedIndex::default();
        for version in 1..=3 {
            volatile.put_value(version, A, value(A, version * 100), version == 1);
            shared = flush(&volatile, &shared, version);
        }
        assert_eq!(volatile.historical_versions(), vec![1, 2, 3]);

        volatile.purge(2);
        assert_eq!(volatile.historical_versions(), vec![1, 2, 3]);

        volatile.put_value(4, B, value(B, 900), true);
        flush(&volatile, &shared, 4);
        assert_eq!(volatile.historical_versions(), vec![3, 4]);
        assert!(volatile.oldest_history().is_some());
    }

    #[test]
    fn rollback_and_apply_pending_rebuild_a_version() {
        let volatile = VolatileValues::new();
        let shared = SharedIndex::default();

        volatile.put_value(1, A, value(A, 0), true);
        let shared = flush(&volatile, &shared, 1);
        volatile.put_value(2, A, value(A, 100), false);
        volatile.put_value(2, B, value(B, 200), true);
        let shared = flush(&volatile, &shared, 2);
        volatile.remove_value(3, A, value(A, 100));

        let current = || -> HashMap<RecordKey, VersionedValue> {
            shared
                .locations
                .iter()
                .map(|(k, s)| (*k, VersionedValue::new(k.primary_key, k.record_type, s.location)))
                .collect()
        };

        let mut at_one = current();
        volatile.rollback(1, &mut at_one);
        volatile.apply_pending(1, &mut at_one);
        assert_eq!(at_one.len(), 1);
        assert_eq!(at_one[&A], value(A, 0));

        let mut at_three = current();
        volatile.rollback(3, &mut at_three);
        volatile.apply_pending(3, &mut at_three);
        assert_eq!(at_three.len(), 1);
        assert!(at_three.contains_key(&B));
    }

    #[test]
    fn merge_for_flush_drops_unknown_removals() {
        let volatile = VolatileValues::new();
        let mut shared = SharedIndex::default();
        shared.locations.insert(
            A,
            StoredLocation {
                location: FileLocation::new(0, 30),
                generation: 0,
            },
        );

        volatile.put_value(3, B, value(B, 40), true);
        volatile.remove_value(3, B, value(B, 40));
        volatile.remove_value(3, A, value(A, 0));

        let merged = merge_for_flush(&volatile.pending_sets(), &shared);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_removal());
        assert_eq!(merged[0].key(), A);
    }

    proptest::proptest! {
        #[test]
        fn newest_pending_write_wins(
            mut writes in proptest::collection::vec((0u64..4, 0i64..5), 1..40)
        ) {
            writes.sort_by_key(|(version, _)| *version);
            let volatile = VolatileValues::new();
            for (index, (version, pk)) in writes.iter().enumerate() {
                let key = RecordKey::new(1, *pk);
                volatile.put_value(*version, key, value(key, index as u64), true);
            }

            for query in 0..4u64 {
                for pk in 0..5i64 {
                    let expected = writes
                        .iter()
                        .enumerate()
                        .filter(|(_, (version, p))| *version <= query && *p == pk)
                        .map(|(index, _)| index as u64)
                        .last();
                    let found = volatile
                        .get_non_flushed(query, RecordKey::new(1, pk))
                        .map(|v| v.location.start);
                    proptest::prop_assert_eq!(found, expected);
                }
            }
        }
    }
}
