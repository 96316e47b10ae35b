//! Content fingerprints
//!
//! A [`Fingerprint`] is a fixed-width SHA-256 digest of a value's canonical
//! byte encoding, stable across processes, machines, and runs. Composite
//! values are hashed through canonical JSON: object maps are key-sorted
//! (serde_json's map is `BTreeMap`-backed), so insertion order never leaks
//! into the digest. Unordered collections of digests can be combined
//! order-insensitively with [`Fingerprint::combine_unordered`].
//!
//! Values that fail to encode canonically produce
//! [`Error::NotHashable`](crate::Error::NotHashable) — a wrong cache hit is
//! never the failure mode. Note that non-finite floats canonicalize to JSON
//! `null`; callers that distinguish NaN payloads should fingerprint an
//! explicit encoding instead.

use crate::{Error, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A 32-byte content digest, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of a byte sequence.
    #[must_use]
    pub fn of_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(digest.into())
    }

    /// Fingerprint of any serde-serializable value, via canonical JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotHashable`] if the value has no canonical JSON
    /// encoding (serializer failure, non-string-convertible map keys, ...).
    pub fn of_value<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let canonical = serde_json::to_value(value)
            .map_err(|e| Error::not_hashable(format!("cannot canonicalize value: {e}")))?;
        Self::of_json(&canonical)
    }

    /// Fingerprint of an already-canonicalized JSON value.
    pub fn of_json(value: &serde_json::Value) -> Result<Self> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| Error::not_hashable(format!("cannot encode canonical form: {e}")))?;
        Ok(Self::of_bytes(&bytes))
    }

    /// Order-sensitive combination of component fingerprints.
    #[must_use]
    pub fn combine<I: IntoIterator<Item = Fingerprint>>(parts: I) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.0);
        }
        Self(hasher.finalize().into())
    }

    /// Order-insensitive combination: element fingerprints are sorted before
    /// combining, so unordered containers hash identically regardless of
    /// iteration order.
    #[must_use]
    pub fn combine_unordered<I: IntoIterator<Item = Fingerprint>>(parts: I) -> Self {
        let mut sorted: Vec<Fingerprint> = parts.into_iter().collect();
        sorted.sort_unstable();
        Self::combine(sorted)
    }

    /// The all-zeros sentinel, reserved for internal bookkeeping (the index
    /// entry in the object store). Never produced by SHA-256 hashing in
    /// practice.
    #[must_use]
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Lowercase hex rendering, usable as an object-store key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::serialization(format!("invalid fingerprint hex: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::serialization("fingerprint must be 32 bytes"))?;
        Ok(Self(arr))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
