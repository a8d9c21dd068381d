//! Payload codec contract and the CBOR implementation.

use crate::error::{CodecError, CodecResult};
use crate::keys::ReadOnlyKeyCompressor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Turns record payloads into bytes and back.
///
/// Instances are not shared between threads; the index pools them and hands
/// one to each borrower. `decode` receives the record type id stored next to
/// the payload so codecs for tagged unions can pick the right variant.
pub trait PayloadCodec<P>: Send {
    /// Encodes `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented.
    fn encode(&mut self, value: &P) -> CodecResult<Vec<u8>>;

    /// Decodes a payload previously produced by [`PayloadCodec::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid payload.
    fn decode(&mut self, bytes: &[u8], record_type: i8) -> CodecResult<P>;
}

/// Creates [`PayloadCodec`] instances bound to a key-compressor snapshot.
pub trait CodecFactory<P>: Send + Sync {
    /// Creates a codec that resolves compressed keys through `keys`.
    fn create(&self, keys: Arc<ReadOnlyKeyCompressor>) -> Box<dyn PayloadCodec<P>>;

    /// Short name for diagnostics.
    fn name(&self) -> &'static str;
}

/// CBOR codec for any serde-compatible payload type.
#[derive(Debug)]
pub struct CborCodec<P> {
    keys: Arc<ReadOnlyKeyCompressor>,
    scratch: Vec<u8>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> CborCodec<P> {
    /// Creates a codec bound to `keys`.
    #[must_use]
    pub fn new(keys: Arc<ReadOnlyKeyCompressor>) -> Self {
        Self {
            keys,
            scratch: Vec::with_capacity(256),
            _payload: PhantomData,
        }
    }

    /// The key snapshot this codec was created with.
    #[must_use]
    pub fn keys(&self) -> &ReadOnlyKeyCompressor {
        &self.keys
    }
}

impl<P> PayloadCodec<P> for CborCodec<P>
where
    P: Serialize + DeserializeOwned,
{
    fn encode(&mut self, value: &P) -> CodecResult<Vec<u8>> {
        self.scratch.clear();
        ciborium::into_writer(value, &mut self.scratch)
            .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
        Ok(self.scratch.clone())
    }

    fn decode(&mut self, bytes: &[u8], _record_type: i8) -> CodecResult<P> {
        ciborium::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
    }
}

/// Factory for [`CborCodec`].
#[derive(Debug)]
pub struct CborCodecFactory<P> {
    _payload: PhantomData<fn() -> P>,
}

impl<P> CborCodecFactory<P> {
    /// Creates the factory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<P> Default for CborCodecFactory<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> CodecFactory<P> for CborCodecFactory<P>
where
    P: Serialize + DeserializeOwned + 'static,
{
    fn create(&self, keys: Arc<ReadOnlyKeyCompressor>) -> Box<dyn PayloadCodec<P>> {
        Box::new(CborCodec::new(keys))
    }

    fn name(&self) -> &'static str {
        "cbor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Part {
        Entity { id: i64, name: String },
        Price { id: i64, cents: u64 },
    }

    fn codec() -> Box<dyn PayloadCodec<Part>> {
        CborCodecFactory::<Part>::new().create(Arc::new(ReadOnlyKeyCompressor::default()))
    }

    #[test]
    fn cbor_codec_preserves_variant() {
        let mut codec = codec();
        let value = Part::Price { id: 9, cents: 1250 };
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes, 2).unwrap(), value);
    }

    #[test]
    fn cbor_codec_rejects_garbage() {
        let mut codec = codec();
        let result = codec.decode(&[0xff, 0x00, 0x13], 1);
        assert!(matches!(result, Err(CodecError::DecodingFailed { .. })));
    }

    #[test]
    fn codec_reuses_scratch_between_calls() {
        let mut codec = codec();
        let first = codec
            .encode(&Part::Entity {
                id: 1,
                name: "a rather long entity name".to_string(),
            })
            .unwrap();
        let second = codec.encode(&Part::Price { id: 2, cents: 3 }).unwrap();
        assert!(second.len() < first.len());
        assert_eq!(
            codec.decode(&second, 2).unwrap(),
            Part::Price { id: 2, cents: 3 }
        );
    }

    proptest! {
        #[test]
        fn entity_names_survive_encoding(id in any::<i64>(), name in ".{0,64}") {
            let mut codec = codec();
            let value = Part::Entity { id, name };
            let bytes = codec.encode(&value).unwrap();
            prop_assert_eq!(codec.decode(&bytes, 1).unwrap(), value);
        }
    }
}
