//! Offset index serialization.
//!
//! The durable state of an index is a chain of fragments appended after the
//! values they describe. Each flush writes one or more fragments; the last
//! of them carries the generation-closing bit and becomes the new tail.
//! Rebuilding the index walks the chain from the tail back to the root.
//!
//! ## Replay Rules
//!
//! - Newer fragments win: a key registered once is never overwritten
//! - A removal suppresses every older registration of its key
//! - A fragment must point at an earlier offset, so the walk terminates
//!
//! ## Verification Rules
//!
//! [`verify`] scans the file from the first byte and fails on the first of:
//!
//! - a record shorter than the envelope or extending past the file end
//! - a checksum mismatch (records carrying the CRC bit)
//! - a catalog version lower than the one before it
//! - a version not greater than a preceding non-zero closed generation
//! - a continuation piece followed by a different version or the file end

mod builder;
mod fragment;

pub use builder::{CollectingIndexBuilder, FilteringIndexBuilder, IndexBuilder};
pub use fragment::{
    compute_expected_record_count, max_records_per_fragment, Fragment, FRAGMENT_ENTRY_SIZE,
    FRAGMENT_HEADER_SIZE,
};

use crate::error::{CoreError, CoreResult};
use crate::record::{self, PieceHeader, RecordFormat, RecordSink, HEADER_SIZE, RECORD_OVERHEAD};
use crate::types::{FileLocation, FileLocationAndWrittenBytes, RecordKey, VersionedValue};
use offsetdb_storage::StorageReader;
use std::collections::{HashMap, HashSet};

/// Statistics gathered by [`verify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStatistics {
    /// Number of physical records.
    pub record_count: u64,
    /// Size of the scanned file.
    pub total_size: u64,
    /// Length of the largest physical record.
    pub max_record_size: u32,
}

/// Writes `entries` as a chain of fragments linked to `previous`.
///
/// An empty entry list still produces a single (empty) fragment, so the
/// result always has a tail.
///
/// # Errors
///
/// Returns an error if the buffer cannot hold a fragment entry or a write fails.
pub fn serialize(
    sink: &mut dyn RecordSink,
    entries: &[VersionedValue],
    previous: Option<FileLocation>,
    catalog_version: u64,
    format: RecordFormat,
) -> CoreResult<FileLocationAndWrittenBytes> {
    let max_records = max_records_per_fragment(format.max_record_size);
    if max_records == 0 {
        return Err(CoreError::invalid_configuration(format!(
            "output buffer of {} bytes cannot hold a single fragment entry",
            format.max_record_size
        )));
    }

    let format = format.uncompressed();
    let fragment_count = compute_expected_record_count(format.max_record_size, entries.len());
    let mut previous = previous;
    let mut written_bytes = 0u64;
    let mut tail = None;

    for index in 0..fragment_count {
        let from = index * max_records;
        let to = (from + max_records).min(entries.len());
        let fragment = Fragment {
            previous,
            entries: entries[from..to].to_vec(),
        };
        let last = index + 1 == fragment_count;
        let location = record::write(sink, catalog_version, last, &fragment.encode(), format)?;
        written_bytes += u64::from(location.length);
        previous = Some(location);
        tail = Some(location);
    }

    let location = tail.ok_or_else(|| CoreError::invalid_operation("no fragment was written"))?;
    tracing::trace!(
        entries = entries.len(),
        fragments = fragment_count,
        %location,
        "fragments written"
    );
    Ok(FileLocationAndWrittenBytes {
        location,
        written_bytes,
    })
}

/// Walks the fragment chain from `tail` to the root, feeding `builder`.
///
/// Returns the number of fragments visited.
///
/// # Errors
///
/// Returns an error if a fragment cannot be read or is corrupted.
pub fn deserialize(
    reader: &dyn StorageReader,
    tail: Option<FileLocation>,
    builder: &mut dyn IndexBuilder,
    verify_crc: bool,
) -> CoreResult<usize> {
    let mut removed: HashSet<RecordKey> = HashSet::new();
    let mut next = tail;
    let mut fragments = 0usize;

    while let Some(location) = next {
        if builder.is_complete() {
            break;
        }
        let stored = record::read(reader, location, verify_crc)?;
        let fragment = Fragment::decode(&stored.payload, location.start)?;
        for entry in &fragment.entries {
            let key = entry.key();
            if builder.contains(key) || removed.contains(&key) {
                continue;
            }
            if entry.is_removal() {
                removed.insert(key);
                builder.register_removal(key);
            } else {
                builder.register(key, entry.location);
            }
        }
        fragments += 1;
        next = fragment.previous;
    }

    Ok(fragments)
}

fn numbered(err: CoreError, record_no: u64) -> CoreError {
    match err {
        CoreError::CorruptedRecord {
            message,
            position,
            expected,
            actual,
        } => CoreError::CorruptedRecord {
            message: format!("record #{record_no}: {message}"),
            position,
            expected,
            actual,
        },
        other => other,
    }
}

/// Scans `file_size` bytes from the start, validating every record.
///
/// # Errors
///
/// Returns [`CoreError::CorruptedRecord`] for the first violation, naming
/// the record number and its file position.
pub fn verify(
    reader: &dyn StorageReader,
    file_size: u64,
    verify_crc: bool,
) -> CoreResult<FileStatistics> {
    let mut stats = FileStatistics {
        total_size: file_size,
        ..FileStatistics::default()
    };
    let mut position = 0u64;
    let mut record_no = 0u64;
    let mut previous: Option<PieceHeader> = None;

    while position < file_size {
        let remaining = file_size - position;
        let head = reader.read_at(position, (HEADER_SIZE as u64).min(remaining) as usize)?;
        let header = PieceHeader::parse(&head).ok_or_else(|| {
            CoreError::corrupted(
                format!("record #{record_no}: record prematurely ended"),
                position,
                HEADER_SIZE as i64,
                remaining as i64,
            )
        })?;
        if header.length < RECORD_OVERHEAD as i32 || header.length as u64 > remaining {
            return Err(CoreError::corrupted(
                format!("record #{record_no}: record length exceeds the file"),
                position,
                remaining as i64,
                i64::from(header.length),
            ));
        }

        let bytes = reader.read_at(position, header.length as usize)?;
        record::check_piece(&bytes, position, verify_crc).map_err(|e| numbered(e, record_no))?;

        if let Some(prev) = previous {
            if header.catalog_version < prev.catalog_version {
                return Err(CoreError::corrupted(
                    format!("record #{record_no}: catalog version decreased"),
                    position,
                    prev.catalog_version,
                    header.catalog_version,
                ));
            }
            if prev.control.is_continuation() && header.catalog_version != prev.catalog_version {
                return Err(CoreError::corrupted(
                    format!("record #{record_no}: continuation carries a different version"),
                    position,
                    prev.catalog_version,
                    header.catalog_version,
                ));
            }
            if prev.control.closes_generation()
                && prev.catalog_version > 0
                && header.catalog_version <= prev.catalog_version
            {
                return Err(CoreError::corrupted(
                    format!("record #{record_no}: version reuses a closed generation"),
                    position,
                    prev.catalog_version + 1,
                    header.catalog_version,
                ));
            }
        }

        stats.record_count += 1;
        stats.max_record_size = stats.max_record_size.max(header.length as u32);
        previous = Some(header);
        record_no += 1;
        position += header.length as u64;
    }

    if previous.is_some_and(|p| p.control.is_continuation()) {
        return Err(CoreError::corrupted(
            format!("record #{record_no}: file ends inside a continued record"),
            position,
            (position + RECORD_OVERHEAD as u64) as i64,
            file_size as i64,
        ));
    }

    Ok(stats)
}

/// Progress of a snapshot copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyProgress {
    /// Records copied so far.
    pub copied: usize,
    /// Records to copy in total.
    pub total: usize,
}

/// Result of [`copy_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCopy {
    /// Tail fragment of the copy and the total bytes written.
    pub tail: FileLocationAndWrittenBytes,
    /// Bytes occupied by the copied and overriding records.
    pub live_bytes: u64,
    /// Number of records described by the fragments.
    pub records: usize,
}

/// Copies the records in `live` into `sink` and appends fragments that
/// describe only them.
///
/// Records are copied verbatim in their original file order, so catalog
/// versions stay non-decreasing. Keys present in `overrides` are not
/// copied; their replacement payloads are written afterwards, stamped with
/// `catalog_version`. The fragments are stamped with `catalog_version` too.
///
/// # Errors
///
/// Returns an error if a source record is corrupted or a write fails.
pub fn copy_snapshot(
    reader: &dyn StorageReader,
    sink: &mut dyn RecordSink,
    live: &[VersionedValue],
    overrides: &[(RecordKey, Vec<u8>)],
    catalog_version: u64,
    format: RecordFormat,
    progress: &mut dyn FnMut(CopyProgress),
) -> CoreResult<SnapshotCopy> {
    let overridden: HashMap<RecordKey, &[u8]> = overrides
        .iter()
        .map(|(key, payload)| (*key, payload.as_slice()))
        .collect();

    let mut sources: Vec<&VersionedValue> = live
        .iter()
        .filter(|value| !value.is_removal() && !overridden.contains_key(&value.key()))
        .collect();
    sources.sort_by_key(|value| value.location.start);

    let total = sources.len() + overridden.len();
    let mut entries = Vec::with_capacity(total);
    let mut written_bytes = 0u64;

    for source in sources {
        let raw = record::read_raw(reader, source.location)?;
        record::decode(&raw, source.location.start, format.crc)?;
        let start = sink.write_bytes(&raw)?;
        let location = FileLocation::new(start, source.location.length);
        written_bytes += u64::from(location.length);
        entries.push(VersionedValue::new(
            source.primary_key,
            source.record_type,
            location,
        ));
        progress(CopyProgress {
            copied: entries.len(),
            total,
        });
    }

    let mut replacements: Vec<(&RecordKey, &&[u8])> = overridden.iter().collect();
    replacements.sort_by_key(|(key, _)| **key);
    for (key, payload) in replacements {
        let location = record::write(sink, catalog_version, false, payload, format)?;
        written_bytes += u64::from(location.length);
        entries.push(VersionedValue::new(
            key.primary_key,
            key.record_type,
            location,
        ));
        progress(CopyProgress {
            copied: entries.len(),
            total,
        });
    }

    entries.sort_by_key(VersionedValue::key);
    let tail = serialize(sink, &entries, None, catalog_version, format)?;
    Ok(SnapshotCopy {
        tail: FileLocationAndWrittenBytes {
            location: tail.location,
            written_bytes: written_bytes + tail.written_bytes,
        },
        live_bytes: written_bytes,
        records: entries.len(),
    })
}
