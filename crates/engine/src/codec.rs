//! Pluggable value codec
//!
//! Results and metadata pass through a [`Codec`] on their way to the object
//! store. The byte format is opaque to the engine; the only contract is that
//! `decode(encode(v)) == v` and that `encode` is deterministic for equal
//! inputs (fingerprints are derived from canonical JSON, not from the codec
//! output, so a non-canonical codec still yields correct identity — but a
//! non-deterministic one wastes store space).

use crate::{Error, Result};

/// Encodes and decodes JSON values to and from a byte representation.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Encode a value to bytes.
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>>;

    /// Decode bytes back into a value.
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

/// The default codec: compact JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::serialization(format!("encode failed: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::serialization(format!("decode failed: {e}")))
    }
}
