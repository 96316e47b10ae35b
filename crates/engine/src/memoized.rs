//! Memoized call facade
//!
//! [`Memoized`] wraps one pure function and answers calls from the group's
//! cache when it can. The failure policy at the call boundary: errors in the
//! wrapped computation are the caller's business (panics propagate
//! unchanged), while failures in the caching machinery degrade to a plain
//! recompute with a warning, so a full disk or a corrupted entry slows the
//! program down but never changes its answer.

use crate::group::MemoGroup;
use crate::index::Ttl;
use crate::key::{compute_key, CacheKey, Captures, FunctionVersion, KeyEnvelope};
use crate::{Error, Fingerprint, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

/// A function wrapped with transparent caching.
pub struct Memoized<A, R, F> {
    group: Arc<MemoGroup>,
    name: String,
    version: FunctionVersion,
    captures: Captures,
    ttl: Option<Ttl>,
    func: F,
    _marker: PhantomData<fn(&A) -> R>,
}

/// Configures a [`Memoized`] wrapper.
pub struct MemoizedBuilder {
    group: Arc<MemoGroup>,
    name: String,
    version: Option<FunctionVersion>,
    source: Option<Fingerprint>,
    captures: Captures,
    ttl: Option<Ttl>,
}

impl MemoizedBuilder {
    /// Start configuring a wrapper for the function stored as `name` in
    /// `group`. The name is the entry's stable address: two wrappers with
    /// the same name in one group share entries.
    #[must_use]
    pub fn new(group: Arc<MemoGroup>, name: impl Into<String>) -> Self {
        Self {
            group,
            name: name.into(),
            version: None,
            source: None,
            captures: Captures::new(),
            ttl: None,
        }
    }

    /// Set the function version explicitly. Bump it whenever the function's
    /// behavior changes; entries recorded under other versions become
    /// unreachable.
    #[must_use]
    pub fn version(mut self, version: FunctionVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Shorthand for an explicit version label.
    #[must_use]
    pub fn version_label(self, label: &str) -> Self {
        self.version(FunctionVersion::from_label(label))
    }

    /// Derive the version from a fingerprint of the function's source (see
    /// [`source_fingerprint!`](crate::source_fingerprint)) combined with
    /// the declared captures. Ignored when an explicit version is set.
    #[must_use]
    pub fn source_fingerprint(mut self, source: Fingerprint) -> Self {
        self.source = Some(source);
        self
    }

    /// Declare the free state the function reads beyond its arguments.
    /// The capture fingerprints are folded into every key, so a change in
    /// captured state is a miss, not a wrong hit.
    #[must_use]
    pub fn captures(mut self, captures: Captures) -> Self {
        self.captures = captures;
        self
    }

    /// Bound entry freshness: entries older than `ttl` read as misses.
    #[must_use]
    pub fn ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Attach the function and register the version with the group. If no
    /// explicit version was given, one is derived from the source
    /// fingerprint (when set) and the declared captures.
    pub fn build<A, R, F>(self, func: F) -> Memoized<A, R, F>
    where
        A: Serialize,
        R: Serialize + DeserializeOwned,
        F: Fn(&A) -> R,
    {
        let version = self.version.unwrap_or_else(|| {
            FunctionVersion::derived(self.source.unwrap_or_else(Fingerprint::zero), &self.captures)
        });
        self.group.register(&self.name, version);
        Memoized {
            group: self.group,
            name: self.name,
            version,
            captures: self.captures,
            ttl: self.ttl,
            func,
            _marker: PhantomData,
        }
    }
}

impl<A, R, F> Memoized<A, R, F>
where
    A: Serialize,
    R: Serialize + DeserializeOwned,
    F: Fn(&A) -> R,
{
    /// The wrapper's version, for chaining into a dependent function's
    /// captures.
    #[must_use]
    pub fn version(&self) -> FunctionVersion {
        self.version
    }

    /// The call-site name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning group.
    #[must_use]
    pub fn group(&self) -> &Arc<MemoGroup> {
        &self.group
    }

    /// Call the function through the cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotHashable`] if the arguments cannot be
    /// fingerprinted (unless the group is best-effort, which computes
    /// without caching instead) and [`Error::Serialization`] if the result
    /// cannot be encoded. Store and lock failures never surface here; they
    /// degrade to recomputation.
    pub fn call(&self, args: &A) -> Result<R> {
        let started = Instant::now();
        let (key, envelope) = match self.key_for(args) {
            Ok(pair) => pair,
            Err(e @ Error::NotHashable { .. }) if self.group.best_effort() => {
                tracing::warn!(function = %self.name, error = %e, "arguments not hashable; computing without cache");
                return Ok((self.func)(args));
            }
            Err(e) => return Err(e),
        };

        match self.group.lookup_value(&key, self.version.fingerprint()) {
            Ok(Some((value, compute_cost))) => {
                match serde_json::from_value::<R>(value) {
                    Ok(result) => {
                        self.group.note_hit(compute_cost, started.elapsed());
                        self.group.warn_if_net_loss(&self.name);
                        return Ok(result);
                    }
                    Err(e) => {
                        // The recompute below overwrites the bad entry.
                        tracing::warn!(function = %self.name, key = %key, error = %e, "cached value failed to decode; recomputing");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(function = %self.name, error = %e, "cache lookup failed; computing without cache");
                return Ok((self.func)(args));
            }
        }

        let compute_started = Instant::now();
        let result = (self.func)(args);
        let compute_cost = compute_started.elapsed();

        let value = match serde_json::to_value(&result) {
            Ok(value) => value,
            Err(e) if self.group.best_effort() => {
                tracing::warn!(function = %self.name, error = %e, "result not serializable; returning uncached");
                return Ok(result);
            }
            Err(e) => {
                return Err(Error::serialization(format!(
                    "result of {} cannot be encoded: {e}",
                    self.name
                )))
            }
        };

        if let Err(e) = self.group.store_value(
            &key,
            envelope,
            &self.name,
            self.version.fingerprint(),
            self.ttl,
            &value,
            compute_cost,
        ) {
            tracing::warn!(function = %self.name, key = %key, error = %e, "failed to record cache entry");
        }
        // A failed insert is still a miss; degraded calls must show up in
        // the counters.
        let overhead = started.elapsed().saturating_sub(compute_cost);
        self.group.note_miss(overhead);
        self.group.warn_if_net_loss(&self.name);
        Ok(result)
    }

    /// True if [`call`](Self::call) with these arguments would be answered
    /// from the cache. No counters, no recency update, no value read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotHashable`] if the arguments cannot be
    /// fingerprinted, unless the group is best-effort: a call that would
    /// bypass the cache reports as a miss.
    pub fn would_hit(&self, args: &A) -> Result<bool> {
        let (key, _) = match self.key_for(args) {
            Ok(pair) => pair,
            Err(Error::NotHashable { .. }) if self.group.best_effort() => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(self
            .group
            .contains_fresh(&key, self.version.fingerprint())
            .unwrap_or_else(|e| {
                tracing::warn!(function = %self.name, error = %e, "cache probe failed");
                false
            }))
    }

    fn key_for(&self, args: &A) -> Result<(CacheKey, Value)> {
        let envelope = KeyEnvelope {
            function: self.name.clone(),
            version: self.version.fingerprint(),
            args: Fingerprint::of_value(args)?,
            captures: self.captures.fingerprint(),
            system: self.group.system_fingerprint()?,
        };
        compute_key(&envelope)
    }
}

impl<A, R, F> std::fmt::Debug for Memoized<A, R, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memoized")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Wrap a function expression, deriving its version from its own source
/// tokens so editing the body invalidates old entries:
///
/// ```
/// use keepsake::{memoized, MemoGroup};
/// use std::sync::Arc;
///
/// let group = Arc::new(MemoGroup::builder().in_memory().build().unwrap());
/// let double = memoized!(group, double, |x: &u64| -> u64 { x * 2 });
/// assert_eq!(double.call(&21).unwrap(), 42);
/// ```
#[macro_export]
macro_rules! memoized {
    ($group:expr, $name:ident, $func:expr) => {
        $crate::MemoizedBuilder::new($group, stringify!($name))
            .source_fingerprint($crate::source_fingerprint!($func))
            .build($func)
    };
    ($group:expr, $name:ident, captures = $captures:expr, $func:expr) => {
        $crate::MemoizedBuilder::new($group, stringify!($name))
            .source_fingerprint($crate::source_fingerprint!($func))
            .captures($captures)
            .build($func)
    };
}
