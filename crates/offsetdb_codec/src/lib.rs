//! # OffsetDB Codec
//!
//! Payload codecs and key compression for OffsetDB.
//!
//! The offset index never interprets record payloads. It stores whatever a
//! [`PayloadCodec`] produces and hands the bytes back to a codec on read.
//! Codec instances are created by a [`CodecFactory`] and bound to a
//! [`ReadOnlyKeyCompressor`] snapshot, so payloads may refer to frequently
//! repeated keys by a small integer id.
//!
//! ## Usage
//!
//! ```
//! use offsetdb_codec::{CborCodecFactory, CodecFactory, KeyCompressor};
//!
//! let keys = KeyCompressor::new();
//! let factory = CborCodecFactory::<(i64, String)>::new();
//! let mut codec = factory.create(keys.read_only());
//!
//! let bytes = codec.encode(&(7, "seven".to_string())).unwrap();
//! let decoded = codec.decode(&bytes, 1).unwrap();
//! assert_eq!(decoded, (7, "seven".to_string()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod keys;

pub use codec::{CborCodec, CborCodecFactory, CodecFactory, PayloadCodec};
pub use error::{CodecError, CodecResult};
pub use keys::{KeyCompressor, ReadOnlyKeyCompressor};
