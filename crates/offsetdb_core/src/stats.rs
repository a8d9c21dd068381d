//! Index statistics.
//!
//! [`IndexStats`] holds operation counters that can be read while the index
//! is in use. [`OffsetIndexStatistics`] is the result of a full file scan.
//!
//! # Usage
//!
//! ```rust,ignore
//! let stats = index.stats().snapshot();
//! println!("Reads: {}", stats.reads);
//! println!("Flushes: {}", stats.flushes);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters of an offset index.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct IndexStats {
    reads: AtomicU64,
    writes: AtomicU64,
    removals: AtomicU64,
    flushes: AtomicU64,
    soft_flushes: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    compactions: AtomicU64,
}

impl IndexStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    // === Increment methods (internal use) ===

    pub(crate) fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, bytes: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_soft_flush(&self) {
        self.soft_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    // === Getter methods (public API) ===

    /// Returns the number of successful value reads.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of values written.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns the number of removals.
    pub fn removals(&self) -> u64 {
        self.removals.load(Ordering::Relaxed)
    }

    /// Returns the number of flushes that wrote fragments.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Returns the number of syncs forced by reads.
    pub fn soft_flushes(&self) -> u64 {
        self.soft_flushes.load(Ordering::Relaxed)
    }

    /// Returns the bytes appended to the file, values and fragments alike.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Returns the bytes of values read back.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Returns the number of compactions and snapshot copies.
    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads(),
            writes: self.writes(),
            removals: self.removals(),
            flushes: self.flushes(),
            soft_flushes: self.soft_flushes(),
            bytes_written: self.bytes_written(),
            bytes_read: self.bytes_read(),
            compactions: self.compactions(),
        }
    }
}

/// A point-in-time copy of [`IndexStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Successful value reads.
    pub reads: u64,
    /// Values written.
    pub writes: u64,
    /// Removals.
    pub removals: u64,
    /// Flushes that wrote fragments.
    pub flushes: u64,
    /// Syncs forced by reads.
    pub soft_flushes: u64,
    /// Bytes appended.
    pub bytes_written: u64,
    /// Bytes of values read back.
    pub bytes_read: u64,
    /// Compactions and snapshot copies.
    pub compactions: u64,
}

/// Statistics of a verified data file.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OffsetIndexStatistics {
    /// Live keys in the shared map.
    pub living_record_count: u64,
    /// Bytes occupied by live records.
    pub living_record_size: u64,
    /// Physical records in the file.
    pub record_count: u64,
    /// File size.
    pub total_size: u64,
    /// Largest physical record.
    pub max_record_size: u32,
}

impl OffsetIndexStatistics {
    /// Share of the file occupied by live records, 1.0 for an empty file.
    #[must_use]
    pub fn living_object_share(&self) -> f64 {
        if self.total_size == 0 {
            1.0
        } else {
            self.living_record_size as f64 / self.total_size as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = IndexStats::new();
        assert_eq!(stats.reads(), 0);
        assert_eq!(stats.writes(), 0);
        assert_eq!(stats.flushes(), 0);
    }

    #[test]
    fn snapshot() {
        let stats = IndexStats::new();
        stats.record_read(10);
        stats.record_write(20);
        stats.record_flush(58);
        stats.record_removal();
        stats.record_soft_flush();

        let snap = stats.snapshot();
        assert_eq!(snap.reads, 1);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.removals, 1);
        assert_eq!(snap.soft_flushes, 1);
        assert_eq!(snap.bytes_read, 10);
        assert_eq!(snap.bytes_written, 78);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(IndexStats::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let s = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    s.record_read(1);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.reads(), 800);
        assert_eq!(stats.bytes_read(), 800);
    }

    #[test]
    fn living_share() {
        let empty = OffsetIndexStatistics::default();
        assert!((empty.living_object_share() - 1.0).abs() < f64::EPSILON);

        let half = OffsetIndexStatistics {
            living_record_size: 50,
            total_size: 100,
            ..OffsetIndexStatistics::default()
        };
        assert!((half.living_object_share() - 0.5).abs() < f64::EPSILON);
    }
}
