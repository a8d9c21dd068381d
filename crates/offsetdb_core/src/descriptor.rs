//! Index descriptor.
//!
//! An [`OffsetIndexDescriptor`] describes the durable state reached by a
//! flush: where the fragment chain ends, which key ids were assigned and
//! which codec reads the payloads. Opening an index from a descriptor
//! replays the chain from its tail.
//!
//! Everything but the codec factory is mirrored by [`DescriptorHeader`],
//! which is persisted as CBOR next to the data file.

use crate::error::CoreResult;
use crate::types::FileLocation;
use offsetdb_codec::{CodecError, CodecFactory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Durable state of an offset index.
pub struct OffsetIndexDescriptor<P> {
    /// Incremented by every flush that wrote fragments.
    pub version: u64,
    /// Catalog version of the last flush.
    pub catalog_version: u64,
    /// Tail of the fragment chain; `None` for an index never flushed.
    pub file_location: Option<FileLocation>,
    /// Key compressor table.
    pub compressed_keys: BTreeMap<i32, String>,
    /// Creates codecs for the payloads.
    pub codec_factory: Arc<dyn CodecFactory<P>>,
    /// Share of the file occupied by live records.
    pub active_record_share: f64,
    /// File size when the descriptor was taken.
    pub file_size: u64,
}

impl<P> OffsetIndexDescriptor<P> {
    /// Descriptor of an empty index.
    #[must_use]
    pub fn empty(codec_factory: Arc<dyn CodecFactory<P>>) -> Self {
        Self {
            version: 0,
            catalog_version: 0,
            file_location: None,
            compressed_keys: BTreeMap::new(),
            codec_factory,
            active_record_share: 1.0,
            file_size: 0,
        }
    }

    /// Restores a descriptor from a persisted header.
    #[must_use]
    pub fn from_header(header: DescriptorHeader, codec_factory: Arc<dyn CodecFactory<P>>) -> Self {
        Self {
            version: header.version,
            catalog_version: header.catalog_version,
            file_location: header.file_location,
            compressed_keys: header.compressed_keys,
            codec_factory,
            active_record_share: header.active_record_share,
            file_size: header.file_size,
        }
    }

    /// The persistable part of the descriptor.
    #[must_use]
    pub fn header(&self) -> DescriptorHeader {
        DescriptorHeader {
            version: self.version,
            catalog_version: self.catalog_version,
            file_location: self.file_location,
            compressed_keys: self.compressed_keys.clone(),
            codec: self.codec_factory.name().to_string(),
            active_record_share: self.active_record_share,
            file_size: self.file_size,
        }
    }
}

impl<P> Clone for OffsetIndexDescriptor<P> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            catalog_version: self.catalog_version,
            file_location: self.file_location,
            compressed_keys: self.compressed_keys.clone(),
            codec_factory: Arc::clone(&self.codec_factory),
            active_record_share: self.active_record_share,
            file_size: self.file_size,
        }
    }
}

impl<P> fmt::Debug for OffsetIndexDescriptor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetIndexDescriptor")
            .field("version", &self.version)
            .field("catalog_version", &self.catalog_version)
            .field("file_location", &self.file_location)
            .field("compressed_keys", &self.compressed_keys.len())
            .field("codec", &self.codec_factory.name())
            .field("active_record_share", &self.active_record_share)
            .field("file_size", &self.file_size)
            .finish()
    }
}

/// Persisted form of an [`OffsetIndexDescriptor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorHeader {
    /// Descriptor version counter.
    pub version: u64,
    /// Catalog version of the last flush.
    pub catalog_version: u64,
    /// Tail of the fragment chain.
    pub file_location: Option<FileLocation>,
    /// Key compressor table.
    pub compressed_keys: BTreeMap<i32, String>,
    /// Name of the codec factory that wrote the payloads.
    pub codec: String,
    /// Share of the file occupied by live records.
    pub active_record_share: f64,
    /// File size when the descriptor was taken.
    pub file_size: u64,
}

impl DescriptorHeader {
    /// Encodes the header as CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if encoding fails.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes a header written by [`DescriptorHeader::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns a codec error if the bytes are not a valid header.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        Ok(ciborium::from_reader(bytes)
            .map_err(|e| CodecError::decoding_failed(format!("descriptor header: {e}")))?)
    }
}
