//! Cache key computation
//!
//! A call's identity has five components: the function's name, its version,
//! a fingerprint of its arguments, a fingerprint of the free state it
//! declares it reads, and a fingerprint of group-level system state. The
//! components are carried in a [`KeyEnvelope`] whose canonical JSON digest
//! is the [`CacheKey`]; the envelope itself is kept alongside the entry
//! metadata for debugging.

use crate::{Error, Fingerprint, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Envelope of identity components for one memoizable invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEnvelope {
    /// Call-site name (stable storage location for the function)
    pub function: String,
    /// Function version; changes when the function's behavior could change
    pub version: Fingerprint,
    /// Fingerprint of the canonicalized arguments
    pub args: Fingerprint,
    /// Fingerprint of the declared captured/free state
    pub captures: Fingerprint,
    /// Fingerprint of group-level system state
    pub system: Fingerprint,
}

/// Compute the deterministic cache key for an envelope.
///
/// Returns the key along with the canonical envelope value for storage in
/// the entry metadata.
pub fn compute_key(envelope: &KeyEnvelope) -> Result<(CacheKey, serde_json::Value)> {
    let json = serde_json::to_value(envelope)
        .map_err(|e| Error::serialization(format!("failed to encode key envelope: {e}")))?;
    let digest = Fingerprint::of_json(&json)?;
    Ok((CacheKey(digest), json))
}

/// The content-derived identity of one invocation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey(Fingerprint);

impl CacheKey {
    /// Hex rendering, usable as an object-store key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// The reserved key under which the group index is stored.
    #[must_use]
    pub(crate) fn index_key() -> Self {
        Self(Fingerprint::zero())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..12])
    }
}

impl FromStr for CacheKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(s.parse()?))
    }
}

/// A function's version fingerprint.
///
/// Either supplied explicitly (bump the label to invalidate old entries) or
/// derived from a fingerprint of the function's own source tokens plus its
/// declared captures, so a semantic change invalidates old entries even
/// though the on-disk location for the function is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionVersion(Fingerprint);

impl FunctionVersion {
    /// An explicit, user-managed version label.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        Self(Fingerprint::of_bytes(label.as_bytes()))
    }

    /// Derive a version from a source fingerprint (see
    /// [`source_fingerprint!`](crate::source_fingerprint)) and the declared
    /// captures. Changing either changes the version.
    #[must_use]
    pub fn derived(source: Fingerprint, captures: &Captures) -> Self {
        Self(Fingerprint::combine([source, captures.fingerprint()]))
    }

    /// The version digest.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.0
    }
}

/// Explicit, enumerable declaration of free state a computation reads.
///
/// The engine cannot see through a Rust closure, so every value the
/// computation reads that is not an explicit argument must be declared here
/// by name. Transitive dependencies are included by declaring the dependee's
/// own [`FunctionVersion`] with [`Captures::with_version`] — the inspection
/// depth is exactly the chain of explicit declarations, a conservative
/// approximation by construction.
#[derive(Debug, Clone, Default)]
pub struct Captures {
    entries: BTreeMap<String, Fingerprint>,
}

impl Captures {
    /// An empty capture set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a captured value by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotHashable`] if the value has no deterministic
    /// encoding.
    pub fn with<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Result<Self> {
        let fp = Fingerprint::of_value(value)?;
        self.entries.insert(name.to_string(), fp);
        Ok(self)
    }

    /// Declare a capture by a pre-computed fingerprint (e.g. file contents
    /// hashed by the caller).
    #[must_use]
    pub fn with_fingerprint(mut self, name: &str, fp: Fingerprint) -> Self {
        self.entries.insert(name.to_string(), fp);
        self
    }

    /// Declare a dependency on another versioned function, chaining its
    /// version into this capture set.
    #[must_use]
    pub fn with_version(self, name: &str, version: FunctionVersion) -> Self {
        self.with_fingerprint(name, version.fingerprint())
    }

    /// True if nothing has been declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fold the declared captures into one fingerprint. Names are hashed
    /// along with values, in sorted name order.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::combine(
            self.entries
                .iter()
                .map(|(name, fp)| Fingerprint::combine([Fingerprint::of_bytes(name.as_bytes()), *fp])),
        )
    }
}

/// Group-level state that participates in every key.
///
/// Always includes the keepsake version (an engine upgrade invalidates all
/// entries, the safe direction); an optional callback contributes extra
/// state such as an environment snapshot or a TTL epoch.
#[derive(Clone)]
pub struct SystemState {
    extra: Option<Arc<dyn Fn() -> serde_json::Value + Send + Sync>>,
}

impl SystemState {
    /// System state with no extra contribution.
    #[must_use]
    pub fn new() -> Self {
        Self { extra: None }
    }

    /// System state extended by a callback evaluated at each key
    /// computation.
    #[must_use]
    pub fn with_extra(f: impl Fn() -> serde_json::Value + Send + Sync + 'static) -> Self {
        Self {
            extra: Some(Arc::new(f)),
        }
    }

    /// Current system-state fingerprint.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        let version_fp = Fingerprint::of_bytes(env!("CARGO_PKG_VERSION").as_bytes());
        match &self.extra {
            None => Ok(version_fp),
            Some(f) => {
                let extra_fp = Fingerprint::of_json(&f())?;
                Ok(Fingerprint::combine([version_fp, extra_fp]))
            }
        }
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemState")
            .field("extra", &self.extra.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// Fingerprint the token stream of an expression.
///
/// Hashing `stringify!` of the wrapped function expression gives a
/// version component that changes whenever the body is edited. Formatting
/// changes inside the tokens also change the digest — false invalidation is
/// the safe direction.
#[macro_export]
macro_rules! source_fingerprint {
    ($($body:tt)*) => {
        $crate::Fingerprint::of_bytes(stringify!($($body)*).as_bytes())
    };
}
