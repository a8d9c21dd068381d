//! Fragment payload codec.
//!
//! A fragment lists the key changes of one flush (or part of it) and points
//! at the fragment written before it:
//!
//! ```text
//! | prev offset (8) | prev length (4) | count (4) | count x entry (21) |
//! entry = | primary key (8) | record type (1) | offset (8) | length (4) |
//! ```
//!
//! The root fragment stores offset `-1` and length `0`. A negative record
//! type marks a removal.

use crate::error::{CoreError, CoreResult};
use crate::record::RECORD_OVERHEAD;
use crate::types::{FileLocation, VersionedValue};

/// Size of the fragment header.
pub const FRAGMENT_HEADER_SIZE: usize = 16;
/// Size of one fragment entry.
pub const FRAGMENT_ENTRY_SIZE: usize = 21;

/// Number of entries that fit a fragment framed within `buffer_size` bytes.
#[must_use]
pub const fn max_records_per_fragment(buffer_size: usize) -> usize {
    buffer_size.saturating_sub(RECORD_OVERHEAD + FRAGMENT_HEADER_SIZE) / FRAGMENT_ENTRY_SIZE
}

/// Number of fragments a flush of `entry_count` entries produces.
///
/// Returns 0 if the buffer cannot hold a single entry.
#[must_use]
pub fn compute_expected_record_count(buffer_size: usize, entry_count: usize) -> usize {
    match max_records_per_fragment(buffer_size) {
        0 => 0,
        max => entry_count.div_ceil(max).max(1),
    }
}

/// One decoded fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// The fragment written before this one.
    pub previous: Option<FileLocation>,
    /// Key changes, removals carrying a negative record type.
    pub entries: Vec<VersionedValue>,
}

fn take<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[at..at + N]);
    buf
}

impl Fragment {
    /// Encodes the fragment payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(FRAGMENT_HEADER_SIZE + self.entries.len() * FRAGMENT_ENTRY_SIZE);
        match self.previous {
            Some(prev) => {
                buf.extend_from_slice(&(prev.start as i64).to_le_bytes());
                buf.extend_from_slice(&(prev.length as i32).to_le_bytes());
            }
            None => {
                buf.extend_from_slice(&(-1i64).to_le_bytes());
                buf.extend_from_slice(&0i32.to_le_bytes());
            }
        }
        buf.extend_from_slice(&(self.entries.len() as i32).to_le_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.primary_key.to_le_bytes());
            buf.push(entry.record_type as u8);
            buf.extend_from_slice(&(entry.location.start as i64).to_le_bytes());
            buf.extend_from_slice(&(entry.location.length as i32).to_le_bytes());
        }
        buf
    }

    /// Decodes a fragment payload read from `position`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptedRecord`] if the payload is malformed.
    pub fn decode(bytes: &[u8], position: u64) -> CoreResult<Self> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(CoreError::corrupted(
                "fragment header is incomplete",
                position,
                FRAGMENT_HEADER_SIZE as i64,
                bytes.len() as i64,
            ));
        }
        let prev_offset = i64::from_le_bytes(take(bytes, 0));
        let prev_length = i32::from_le_bytes(take(bytes, 8));
        let count = i32::from_le_bytes(take(bytes, 12));

        let expected_len = i64::from(count) * FRAGMENT_ENTRY_SIZE as i64 + FRAGMENT_HEADER_SIZE as i64;
        if count < 0 || expected_len != bytes.len() as i64 {
            return Err(CoreError::corrupted(
                format!("fragment declares {count} entries"),
                position,
                expected_len,
                bytes.len() as i64,
            ));
        }

        let previous = if prev_offset < 0 {
            None
        } else if prev_length <= 0 || prev_offset as u64 >= position {
            return Err(CoreError::corrupted(
                "fragment points at an invalid predecessor",
                position,
                position as i64,
                prev_offset,
            ));
        } else {
            Some(FileLocation::new(prev_offset as u64, prev_length as u32))
        };

        let mut entries = Vec::with_capacity(count as usize);
        for index in 0..count as usize {
            let at = FRAGMENT_HEADER_SIZE + index * FRAGMENT_ENTRY_SIZE;
            let primary_key = i64::from_le_bytes(take(bytes, at));
            let record_type = bytes[at + 8] as i8;
            let offset = i64::from_le_bytes(take(bytes, at + 9));
            let length = i32::from_le_bytes(take(bytes, at + 17));
            if record_type == 0 || offset < 0 || length <= 0 {
                return Err(CoreError::corrupted(
                    format!("fragment entry #{index} is malformed"),
                    position,
                    0,
                    i64::from(record_type),
                ));
            }
            entries.push(VersionedValue::new(
                primary_key,
                record_type,
                FileLocation::new(offset as u64, length as u32),
            ));
        }

        Ok(Self { previous, entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_matches_buffer() {
        assert_eq!(max_records_per_fragment(57), 0);
        assert_eq!(max_records_per_fragment(58), 1);
        assert_eq!(max_records_per_fragment(37 + 21 * 100), 100);

        assert_eq!(compute_expected_record_count(57, 10), 0);
        assert_eq!(compute_expected_record_count(58, 3), 3);
        assert_eq!(compute_expected_record_count(37 + 21 * 100, 0), 1);
        assert_eq!(compute_expected_record_count(37 + 21 * 100, 250), 3);
    }

    #[test]
    fn root_fragment_header() {
        let fragment = Fragment {
            previous: None,
            entries: vec![VersionedValue::removal(4, 2, FileLocation::new(0, 30))],
        };
        let bytes = fragment.encode();
        assert_eq!(bytes.len(), FRAGMENT_HEADER_SIZE + FRAGMENT_ENTRY_SIZE);
        assert_eq!(i64::from_le_bytes(take(&bytes, 0)), -1);
        assert_eq!(i32::from_le_bytes(take(&bytes, 8)), 0);
        assert_eq!(bytes[FRAGMENT_HEADER_SIZE + 8] as i8, -2);

        let decoded = Fragment::decode(&bytes, 100).unwrap();
        assert_eq!(decoded, fragment);
        assert!(decoded.entries[0].is_removal());
    }

    #[test]
    fn chained_fragment_keeps_predecessor() {
        let fragment = Fragment {
            previous: Some(FileLocation::new(50, 58)),
            entries: vec![VersionedValue::new(1, 1, FileLocation::new(0, 22))],
        };
        let decoded = Fragment::decode(&fragment.encode(), 200).unwrap();
        assert_eq!(decoded.previous, Some(FileLocation::new(50, 58)));
    }

    #[test]
    fn predecessor_after_fragment_is_rejected() {
        let fragment = Fragment {
            previous: Some(FileLocation::new(500, 58)),
            entries: Vec::new(),
        };
        let result = Fragment::decode(&fragment.encode(), 200);
        assert!(matches!(result, Err(CoreError::CorruptedRecord { .. })));
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let fragment = Fragment {
            previous: None,
            entries: vec![VersionedValue::new(1, 1, FileLocation::new(0, 22))],
        };
        let mut bytes = fragment.encode();
        bytes.truncate(bytes.len() - 1);
        assert!(Fragment::decode(&bytes, 0).is_err());
    }
}
