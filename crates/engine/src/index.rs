//! Group index
//!
//! The index is the in-memory catalogue of live entries: per-key metadata
//! (identity envelope, insertion time, measured compute cost, size, TTL,
//! sub-entry names). It is persisted inside the object store itself, under a
//! reserved all-zeros key, as part of the group checkpoint. The store remains
//! the source of truth: an index lost or corrupted can be rebuilt from the
//! per-entry metadata parts.

use crate::key::CacheKey;
use crate::policy::GreedyDualSize;
use crate::stats::GroupStats;
use crate::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Sub-entry name holding an entry's own metadata.
pub(crate) const META_PART: &str = "meta";
/// Sub-entry name holding a whole-entry value.
pub(crate) const VALUE_PART: &str = "value";
/// Sub-entry name holding the group checkpoint, under the reserved key.
pub(crate) const INDEX_PART: &str = "index";

/// Prefix for per-field sub-entries of a fine-grained value.
pub(crate) const FIELD_PART_PREFIX: &str = "f-";

/// A bound on an entry's freshness: a window after insertion, or an
/// absolute deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ttl {
    /// Fresh for this many seconds after insertion
    After {
        /// Window length in seconds
        seconds: u64,
    },
    /// Fresh until this instant, regardless of insertion time
    Until(DateTime<Utc>),
}

impl Ttl {
    /// TTL of `seconds` seconds after insertion.
    #[must_use]
    pub fn seconds(seconds: u64) -> Self {
        Self::After { seconds }
    }

    /// TTL of `minutes` minutes after insertion.
    #[must_use]
    pub fn minutes(minutes: u64) -> Self {
        Self::seconds(minutes * 60)
    }

    /// TTL of `hours` hours after insertion.
    #[must_use]
    pub fn hours(hours: u64) -> Self {
        Self::seconds(hours * 3600)
    }

    /// TTL of `days` days after insertion.
    #[must_use]
    pub fn days(days: u64) -> Self {
        Self::seconds(days * 86_400)
    }

    /// Fresh until `deadline`.
    #[must_use]
    pub fn until(deadline: DateTime<Utc>) -> Self {
        Self::Until(deadline)
    }

    /// True if an entry inserted at `inserted_at` is still fresh at `now`.
    #[must_use]
    pub fn is_fresh(&self, inserted_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Self::After { seconds } => {
                let age = now.signed_duration_since(inserted_at);
                match i64::try_from(*seconds) {
                    Ok(limit) => age.num_seconds() < limit,
                    // A window too large for chrono arithmetic never lapses.
                    Err(_) => true,
                }
            }
            Self::Until(deadline) => now < *deadline,
        }
    }
}

/// Per-entry metadata tracked by the index and mirrored into the entry's
/// `meta` sub-entry for rebuilds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Call-site name the entry belongs to
    pub function: String,
    /// Function version fingerprint at insertion time
    pub version: Fingerprint,
    /// The full identity envelope, kept for inspection
    pub envelope: serde_json::Value,
    /// Insertion timestamp
    pub inserted_at: DateTime<Utc>,
    /// Measured compute cost in seconds
    pub compute_cost_secs: f64,
    /// Total encoded size in bytes across all sub-entries
    pub size: u64,
    /// Optional freshness bound
    pub ttl: Option<Ttl>,
    /// Names of the value-bearing sub-entries (`value`, or `f-<field>`
    /// entries for fine-grained values)
    pub parts: Vec<String>,
}

impl EntryMeta {
    /// The measured compute cost as a [`Duration`].
    #[must_use]
    pub fn compute_cost(&self) -> Duration {
        Duration::from_secs_f64(self.compute_cost_secs.max(0.0))
    }

    /// True if the entry is still fresh at `now` under its own TTL.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.ttl.is_none_or(|ttl| ttl.is_fresh(self.inserted_at, now))
    }
}

/// Outcome of an index probe.
#[derive(Debug)]
pub(crate) enum Lookup<'a> {
    /// A live, fresh entry
    Hit(&'a EntryMeta),
    /// An entry exists but its TTL has lapsed or its version moved on
    Stale,
    /// No entry
    Miss,
}

/// Catalogue of live entries for one group.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheIndex {
    entries: BTreeMap<CacheKey, EntryMeta>,
}

impl CacheIndex {
    /// Empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe for `key`, expecting `version`. An entry under the right key
    /// with a different version fingerprint is stale, not a hit.
    pub(crate) fn lookup(
        &self,
        key: &CacheKey,
        version: Fingerprint,
        now: DateTime<Utc>,
    ) -> Lookup<'_> {
        match self.entries.get(key) {
            None => Lookup::Miss,
            Some(meta) if meta.version != version => Lookup::Stale,
            Some(meta) if !meta.is_fresh(now) => Lookup::Stale,
            Some(meta) => Lookup::Hit(meta),
        }
    }

    /// Metadata for `key`, fresh or not.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<&EntryMeta> {
        self.entries.get(key)
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, key: CacheKey, meta: EntryMeta) {
        self.entries.insert(key, meta);
    }

    /// Remove an entry, returning its metadata if present.
    pub fn remove(&mut self, key: &CacheKey) -> Option<EntryMeta> {
        self.entries.remove(key)
    }

    /// True if `key` is catalogued.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of catalogued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is catalogued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &EntryMeta)> {
        self.entries.iter()
    }

    /// All catalogued keys.
    #[must_use]
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.keys().copied().collect()
    }

    /// Keys that no registered call site can hit again: entries whose
    /// function is absent from `registry`, or registered under a different
    /// version.
    #[must_use]
    pub fn orphans(&self, registry: &BTreeMap<String, Fingerprint>) -> Vec<CacheKey> {
        self.entries
            .iter()
            .filter(|(_, meta)| registry.get(&meta.function) != Some(&meta.version))
            .map(|(key, _)| *key)
            .collect()
    }

    /// Adopt entries catalogued by a peer process. Ours win on conflict;
    /// entries only the peer knows are adopted as-is.
    pub fn merge(&mut self, other: CacheIndex) {
        for (key, meta) in other.entries {
            self.entries.entry(key).or_insert(meta);
        }
    }
}

/// The persisted snapshot of group state: index, replacement-policy state,
/// and usage counters, plus a generation counter incremented on every write
/// so readers can detect that a peer has checkpointed in between.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Checkpoint {
    pub generation: u64,
    pub index: CacheIndex,
    pub policy: GreedyDualSize,
    pub stats: GroupStats,
}
