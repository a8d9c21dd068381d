//! Core value types of the offset index.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a stored value: its record type and primary key.
///
/// On disk, a negative record type marks a tombstone of the corresponding
/// positive type. Keys held by the index always carry the positive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    /// Record type id (positive).
    pub record_type: i8,
    /// Primary key, unique within the record type.
    pub primary_key: i64,
}

impl RecordKey {
    /// Creates a new record key.
    #[must_use]
    pub const fn new(record_type: i8, primary_key: i64) -> Self {
        Self {
            record_type,
            primary_key,
        }
    }

    /// The same key with the tombstone sign stripped.
    #[must_use]
    pub const fn normalized(self) -> Self {
        Self {
            record_type: self.record_type.wrapping_abs(),
            primary_key: self.primary_key,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.record_type, self.primary_key)
    }
}

/// A byte range holding exactly one framed value (possibly split into
/// several continuation pieces).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FileLocation {
    /// Offset of the first byte.
    pub start: u64,
    /// Total length in bytes.
    pub length: u32,
}

impl FileLocation {
    /// Creates a new file location.
    #[must_use]
    pub const fn new(start: u64, length: u32) -> Self {
        Self { start, length }
    }

    /// Offset right after the last byte.
    #[must_use]
    pub const fn end(self) -> u64 {
        self.start + self.length as u64
    }
}

impl fmt::Display for FileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.start, self.length)
    }
}

/// A location tagged with the key it belongs to, as kept by the overlays.
///
/// A negative `record_type` marks a removal; the location then points at
/// the value that was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionedValue {
    /// Primary key.
    pub primary_key: i64,
    /// Record type, negated for removals.
    pub record_type: i8,
    /// Where the value is stored.
    pub location: FileLocation,
}

impl VersionedValue {
    /// A live value.
    #[must_use]
    pub const fn new(primary_key: i64, record_type: i8, location: FileLocation) -> Self {
        Self {
            primary_key,
            record_type,
            location,
        }
    }

    /// A removal of the value stored at `location`.
    #[must_use]
    pub const fn removal(primary_key: i64, record_type: i8, location: FileLocation) -> Self {
        Self {
            primary_key,
            record_type: -record_type.wrapping_abs(),
            location,
        }
    }

    /// Returns true for removals.
    #[must_use]
    pub const fn is_removal(&self) -> bool {
        self.record_type < 0
    }

    /// The key this value belongs to.
    #[must_use]
    pub const fn key(&self) -> RecordKey {
        RecordKey::new(self.record_type.wrapping_abs(), self.primary_key)
    }
}

/// A location in the shared map together with the catalog version that
/// made it durable. Readers of older versions must not see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredLocation {
    /// Where the value is stored.
    pub location: FileLocation,
    /// Catalog version of the write that produced it (0 after replay).
    pub generation: u64,
}

/// Location and size of the last fragment written by a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLocationAndWrittenBytes {
    /// Location of the tail fragment.
    pub location: FileLocation,
    /// Bytes written by the operation (fragments, and copies for snapshots).
    pub written_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removal_uses_negative_type() {
        let location = FileLocation::new(10, 20);
        let removal = VersionedValue::removal(5, 3, location);
        assert!(removal.is_removal());
        assert_eq!(removal.record_type, -3);
        assert_eq!(removal.key(), RecordKey::new(3, 5));

        assert!(!VersionedValue::new(5, 3, location).is_removal());
    }

    #[test]
    fn normalized_key_ignores_tombstone_sign() {
        assert_eq!(RecordKey::new(-4, 1).normalized(), RecordKey::new(4, 1));
        assert_eq!(RecordKey::new(4, 1).normalized(), RecordKey::new(4, 1));
    }

    #[test]
    fn location_end_and_display() {
        let location = FileLocation::new(100, 21);
        assert_eq!(location.end(), 121);
        assert_eq!(location.to_string(), "100+21");
        assert_eq!(RecordKey::new(2, 7).to_string(), "2:7");
    }
}
