//! Storage record envelope.
//!
//! Every value and every fragment is framed as one storage record:
//!
//! ```text
//! | length (4) | control (1) | catalog version (8) | payload (N) | crc32c (8) |
//! ```
//!
//! - `length` covers the whole physical record including itself
//! - the trailer is always present; it holds the CRC32C widened to 64 bits
//!   when the CRC bit is set and [`NULL_CRC`] otherwise
//! - the checksum covers the catalog version and the payload, followed by
//!   the control byte
//!
//! ## Control Bits
//!
//! | bit | meaning |
//! |-----|---------|
//! | 0 | payload is snappy-compressed |
//! | 1 | continuation: the value goes on in the next physical record |
//! | 2 | closes the generation (last fragment of a flush) |
//! | 3 | trailer holds a real checksum |
//!
//! A value larger than the output buffer is split into several physical
//! records sharing the same catalog version. All but the last carry the
//! continuation bit, and its [`FileLocation`] spans all of them.

use crate::config::StorageOptions;
use crate::error::{CoreError, CoreResult};
use crate::types::FileLocation;
use offsetdb_codec::CodecError;
use offsetdb_storage::{StorageReader, WriteAccess};
use std::io::Write;

/// Size of the length, control and catalog version fields.
pub const HEADER_SIZE: usize = 13;
/// Size of the checksum trailer.
pub const CRC_SIZE: usize = 8;
/// Fixed bytes every physical record carries besides its payload.
pub const RECORD_OVERHEAD: usize = HEADER_SIZE + CRC_SIZE;
/// Trailer value of records written without a checksum.
pub const NULL_CRC: i64 = -1;

/// Leading bytes excluded from the checksum (length and control).
const CRC_NOT_COVERED_HEAD: usize = 5;
/// Payloads shorter than this are never compressed.
const COMPRESSION_THRESHOLD: usize = 64;

/// Control byte of a physical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlFlags(u8);

impl ControlFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Payload is compressed.
    pub const COMPRESSED: Self = Self(0x01);
    /// Value continues in the next physical record.
    pub const CONTINUATION: Self = Self(0x02);
    /// Record closes its generation.
    pub const CLOSES_GENERATION: Self = Self(0x04);
    /// Trailer holds a checksum.
    pub const CRC: Self = Self(0x08);

    /// Creates flags from the raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        Self(b)
    }

    /// Returns the raw byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Checks whether all bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other` when `enabled`.
    #[must_use]
    pub const fn with(self, other: Self, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | other.0)
        } else {
            self
        }
    }

    /// Checks the compressed bit.
    #[must_use]
    pub const fn is_compressed(self) -> bool {
        self.contains(Self::COMPRESSED)
    }

    /// Checks the continuation bit.
    #[must_use]
    pub const fn is_continuation(self) -> bool {
        self.contains(Self::CONTINUATION)
    }

    /// Checks the generation-closing bit.
    #[must_use]
    pub const fn closes_generation(self) -> bool {
        self.contains(Self::CLOSES_GENERATION)
    }

    /// Checks the checksum bit.
    #[must_use]
    pub const fn has_crc(self) -> bool {
        self.contains(Self::CRC)
    }
}

/// Framing parameters derived from [`StorageOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFormat {
    /// Largest physical record.
    pub max_record_size: usize,
    /// Compress payloads.
    pub compress: bool,
    /// Write and verify checksums.
    pub crc: bool,
}

impl RecordFormat {
    /// Format used for a given set of options.
    #[must_use]
    pub fn from_options(options: &StorageOptions) -> Self {
        Self {
            max_record_size: options.output_buffer_size,
            compress: options.compress,
            crc: options.compute_crc32c,
        }
    }

    /// Same format with compression switched off.
    #[must_use]
    pub const fn uncompressed(self) -> Self {
        Self {
            compress: false,
            ..self
        }
    }
}

/// Header fields of one physical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceHeader {
    /// Declared length of the physical record.
    pub length: i32,
    /// Control byte.
    pub control: ControlFlags,
    /// Catalog version stamped on the record.
    pub catalog_version: i64,
}

impl PieceHeader {
    /// Parses the header at the start of `bytes`.
    ///
    /// Returns `None` if fewer than [`HEADER_SIZE`] bytes are available.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: read_i32(bytes, 0),
            control: ControlFlags::from_byte(bytes[4]),
            catalog_version: read_i64(bytes, 5),
        })
    }
}

/// A value read back from its framed representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRecord {
    /// Catalog version the value was written with.
    pub catalog_version: i64,
    /// Control byte of the last physical record.
    pub control: ControlFlags,
    /// Decompressed, reassembled payload.
    pub payload: Vec<u8>,
    /// Number of physical records the value was stored in.
    pub pieces: usize,
}

impl StorageRecord {
    /// Whether the record closes its generation.
    #[must_use]
    pub fn closes_generation(&self) -> bool {
        self.control.closes_generation()
    }
}

/// Destination of framed records.
pub trait RecordSink {
    /// Offset at which the next write lands.
    fn position(&self) -> u64;

    /// Appends bytes, returning their offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails.
    fn write_bytes(&mut self, bytes: &[u8]) -> CoreResult<u64>;
}

impl RecordSink for WriteAccess<'_> {
    fn position(&self) -> u64 {
        WriteAccess::position(self)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> CoreResult<u64> {
        Ok(self.write(bytes)?)
    }
}

/// Adapts any [`Write`] into a [`RecordSink`] counting from zero.
pub struct StreamSink<'a> {
    out: &'a mut dyn Write,
    position: u64,
}

impl<'a> StreamSink<'a> {
    /// Wraps `out`; its first byte is position zero.
    pub fn new(out: &'a mut dyn Write) -> Self {
        Self { out, position: 0 }
    }
}

impl RecordSink for StreamSink<'_> {
    fn position(&self) -> u64 {
        self.position
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> CoreResult<u64> {
        let offset = self.position;
        self.out.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(offset)
    }
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    i32::from_le_bytes(buf)
}

fn read_i64(bytes: &[u8], at: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(buf)
}

/// Checksum of a physical record: version and payload, then the control byte.
#[must_use]
pub fn compute_crc(control: ControlFlags, covered: &[u8]) -> i64 {
    let crc = crc32c::crc32c(covered);
    i64::from(crc32c::crc32c_append(crc, &[control.as_byte()]))
}

fn push_piece(out: &mut Vec<u8>, control: ControlFlags, catalog_version: i64, payload: &[u8]) {
    let start = out.len();
    let length = RECORD_OVERHEAD + payload.len();
    out.extend_from_slice(&(length as i32).to_le_bytes());
    out.push(control.as_byte());
    out.extend_from_slice(&catalog_version.to_le_bytes());
    out.extend_from_slice(payload);
    let crc = if control.has_crc() {
        compute_crc(control, &out[start + CRC_NOT_COVERED_HEAD..])
    } else {
        NULL_CRC
    };
    out.extend_from_slice(&crc.to_le_bytes());
}

/// Frames `payload` into one or more physical records.
///
/// # Errors
///
/// Returns an error if compression fails or the framed value does not fit
/// a [`FileLocation`].
pub fn encode(
    catalog_version: u64,
    closes_generation: bool,
    payload: &[u8],
    format: RecordFormat,
) -> CoreResult<Vec<u8>> {
    let compressed = if format.compress && payload.len() >= COMPRESSION_THRESHOLD {
        let packed = snap::raw::Encoder::new()
            .compress_vec(payload)
            .map_err(|e| CodecError::encoding_failed(format!("compression failed: {e}")))?;
        (packed.len() < payload.len()).then_some(packed)
    } else {
        None
    };
    let is_compressed = compressed.is_some();
    let body = compressed.as_deref().unwrap_or(payload);

    let max_payload = format.max_record_size.saturating_sub(RECORD_OVERHEAD).max(1);
    let piece_count = body.len().div_ceil(max_payload).max(1);
    let version = catalog_version as i64;
    let mut out = Vec::with_capacity(body.len() + piece_count * RECORD_OVERHEAD);

    for index in 0..piece_count {
        let last = index + 1 == piece_count;
        let from = index * max_payload;
        let to = (from + max_payload).min(body.len());
        let control = ControlFlags::NONE
            .with(ControlFlags::COMPRESSED, is_compressed)
            .with(ControlFlags::CONTINUATION, !last)
            .with(ControlFlags::CLOSES_GENERATION, last && closes_generation)
            .with(ControlFlags::CRC, format.crc);
        push_piece(&mut out, control, version, &body[from..to]);
    }

    if u32::try_from(out.len()).is_err() {
        return Err(CoreError::invalid_operation(format!(
            "framed value of {} bytes exceeds the addressable record size",
            out.len()
        )));
    }
    Ok(out)
}

/// Frames `payload` and appends it to `sink`.
///
/// # Errors
///
/// Returns an error if framing or the write fails.
pub fn write(
    sink: &mut dyn RecordSink,
    catalog_version: u64,
    closes_generation: bool,
    payload: &[u8],
    format: RecordFormat,
) -> CoreResult<FileLocation> {
    let framed = encode(catalog_version, closes_generation, payload, format)?;
    let start = sink.write_bytes(&framed)?;
    Ok(FileLocation::new(start, framed.len() as u32))
}

/// Validates one physical record at the start of `bytes`.
///
/// `position` is the file offset of `bytes[0]` and only used for errors.
/// Returns the header and the payload slice of the piece.
///
/// # Errors
///
/// Returns [`CoreError::CorruptedRecord`] on a bad length or checksum.
pub fn check_piece(bytes: &[u8], position: u64, verify_crc: bool) -> CoreResult<(PieceHeader, &[u8])> {
    let header = PieceHeader::parse(bytes).ok_or_else(|| {
        CoreError::corrupted(
            "record prematurely ended",
            position,
            RECORD_OVERHEAD as i64,
            bytes.len() as i64,
        )
    })?;
    let length = header.length;
    if length < RECORD_OVERHEAD as i32 || length as usize > bytes.len() {
        return Err(CoreError::corrupted(
            "record length differs from the available bytes",
            position,
            bytes.len() as i64,
            i64::from(length),
        ));
    }

    let length = length as usize;
    let trailer = read_i64(bytes, length - CRC_SIZE);
    if verify_crc && header.control.has_crc() {
        let computed = compute_crc(header.control, &bytes[CRC_NOT_COVERED_HEAD..length - CRC_SIZE]);
        if computed != trailer {
            return Err(CoreError::corrupted(
                "record checksum mismatch",
                position,
                trailer,
                computed,
            ));
        }
    }
    Ok((header, &bytes[HEADER_SIZE..length - CRC_SIZE]))
}

/// Reassembles the value framed in `bytes`, which must span exactly one value.
///
/// # Errors
///
/// Returns [`CoreError::CorruptedRecord`] if a piece is damaged, the pieces
/// disagree on the catalog version, or the value does not fill `bytes`.
pub fn decode(bytes: &[u8], position: u64, verify_crc: bool) -> CoreResult<StorageRecord> {
    let mut offset = 0usize;
    let mut payload = Vec::new();
    let mut version = None;
    let mut pieces = 0usize;

    let last = loop {
        let (header, piece) = check_piece(&bytes[offset..], position + offset as u64, verify_crc)?;
        if let Some(expected) = version {
            if expected != header.catalog_version {
                return Err(CoreError::corrupted(
                    "continuation record carries a different catalog version",
                    position + offset as u64,
                    expected,
                    header.catalog_version,
                ));
            }
        }
        version = Some(header.catalog_version);
        payload.extend_from_slice(piece);
        pieces += 1;
        offset += header.length as usize;
        if !header.control.is_continuation() {
            break header;
        }
        if offset >= bytes.len() {
            return Err(CoreError::corrupted(
                "continuation record is not followed by its remainder",
                position + offset as u64,
                (offset + RECORD_OVERHEAD) as i64,
                bytes.len() as i64,
            ));
        }
    };

    if offset != bytes.len() {
        return Err(CoreError::corrupted(
            "record length differs from its location",
            position,
            bytes.len() as i64,
            offset as i64,
        ));
    }

    let payload = if last.control.is_compressed() {
        snap::raw::Decoder::new().decompress_vec(&payload).map_err(|e| {
            CoreError::corrupted(
                format!("payload cannot be decompressed: {e}"),
                position,
                0,
                payload.len() as i64,
            )
        })?
    } else {
        payload
    };

    Ok(StorageRecord {
        catalog_version: last.catalog_version,
        control: last.control,
        payload,
        pieces,
    })
}

/// Reads the framed value at `location`, without decompressing or joining.
///
/// # Errors
///
/// Returns a storage error if the range is not present.
pub fn read_raw(reader: &dyn StorageReader, location: FileLocation) -> CoreResult<Vec<u8>> {
    Ok(reader.read_at(location.start, location.length as usize)?)
}

/// Reads and decodes the value at `location`.
///
/// # Errors
///
/// Returns an error if the bytes are missing or corrupted.
pub fn read(
    reader: &dyn StorageReader,
    location: FileLocation,
    verify_crc: bool,
) -> CoreResult<StorageRecord> {
    let bytes = read_raw(reader, location)?;
    decode(&bytes, location.start, verify_crc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(max_record_size: usize) -> RecordFormat {
        RecordFormat {
            max_record_size,
            compress: false,
            crc: true,
        }
    }

    #[test]
    fn single_piece_layout() {
        let bytes = encode(7, false, b"abc", format(1024)).unwrap();
        assert_eq!(bytes.len(), RECORD_OVERHEAD + 3);

        let header = PieceHeader::parse(&bytes).unwrap();
        assert_eq!(header.length as usize, bytes.len());
        assert_eq!(header.catalog_version, 7);
        assert!(header.control.has_crc());
        assert!(!header.control.is_continuation());

        let record = decode(&bytes, 0, true).unwrap();
        assert_eq!(record.payload, b"abc");
        assert_eq!(record.pieces, 1);
        assert!(!record.closes_generation());
    }

    #[test]
    fn record_without_crc_stores_null_trailer() {
        let mut fmt = format(1024);
        fmt.crc = false;
        let bytes = encode(1, true, b"x", fmt).unwrap();
        let trailer = read_i64(&bytes, bytes.len() - CRC_SIZE);
        assert_eq!(trailer, NULL_CRC);

        let record = decode(&bytes, 0, true).unwrap();
        assert!(record.closes_generation());
    }

    #[test]
    fn flipped_payload_byte_fails_checksum() {
        let mut bytes = encode(3, false, b"payload", format(1024)).unwrap();
        bytes[HEADER_SIZE + 2] ^= 0x01;

        match decode(&bytes, 40, true) {
            Err(CoreError::CorruptedRecord { position, .. }) => assert_eq!(position, 40),
            other => panic!("expected corruption, got {other:?}"),
        }
        // unchecked reads accept the damaged bytes
        assert!(decode(&bytes, 40, false).is_ok());
    }

    #[test]
    fn flipped_control_byte_fails_checksum() {
        let mut bytes = encode(3, false, b"payload", format(1024)).unwrap();
        bytes[4] |= ControlFlags::CLOSES_GENERATION.as_byte();
        assert!(decode(&bytes, 0, true).is_err());
    }

    #[test]
    fn oversized_value_is_split_into_continuations() {
        let payload: Vec<u8> = (0..250u32).map(|i| (i % 251) as u8).collect();
        let bytes = encode(9, true, &payload, format(121)).unwrap();

        // 100 payload bytes per piece
        assert_eq!(bytes.len(), 3 * RECORD_OVERHEAD + 250);
        let first = PieceHeader::parse(&bytes).unwrap();
        assert!(first.control.is_continuation());
        assert!(!first.control.closes_generation());

        let record = decode(&bytes, 0, true).unwrap();
        assert_eq!(record.pieces, 3);
        assert_eq!(record.payload, payload);
        assert!(record.closes_generation());
        assert_eq!(record.catalog_version, 9);
    }

    #[test]
    fn truncated_continuation_is_corrupted() {
        let payload = vec![7u8; 250];
        let bytes = encode(9, false, &payload, format(121)).unwrap();
        let first_piece = PieceHeader::parse(&bytes).unwrap().length as usize;

        let result = decode(&bytes[..first_piece], 0, true);
        assert!(matches!(result, Err(CoreError::CorruptedRecord { .. })));
    }

    #[test]
    fn location_longer_than_record_is_corrupted() {
        let mut bytes = encode(1, false, b"abc", format(1024)).unwrap();
        bytes.extend_from_slice(&[0u8; 4]);
        let result = decode(&bytes, 0, true);
        assert!(matches!(result, Err(CoreError::CorruptedRecord { .. })));
    }

    #[test]
    fn compression_is_used_when_it_pays_off() {
        let payload = vec![b'a'; 4096];
        let fmt = RecordFormat {
            compress: true,
            ..format(1 << 20)
        };
        let bytes = encode(2, false, &payload, fmt).unwrap();
        assert!(bytes.len() < payload.len());
        assert!(PieceHeader::parse(&bytes).unwrap().control.is_compressed());
        assert_eq!(decode(&bytes, 0, true).unwrap().payload, payload);

        let small = encode(2, false, b"tiny", fmt).unwrap();
        assert!(!PieceHeader::parse(&small).unwrap().control.is_compressed());
    }

    #[test]
    fn stream_sink_counts_positions() {
        let mut out = Vec::new();
        let mut sink = StreamSink::new(&mut out);
        let first = write(&mut sink, 1, false, b"one", format(1024)).unwrap();
        let second = write(&mut sink, 1, true, b"two", format(1024)).unwrap();
        assert_eq!(first, FileLocation::new(0, 24));
        assert_eq!(second.start, 24);
        assert_eq!(out.len() as u64, second.end());
    }
}
