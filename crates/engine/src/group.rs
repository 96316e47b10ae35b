//! Cache group coordination
//!
//! A [`MemoGroup`] owns one object store, one readers-writer lock, and one
//! checkpoint (index + replacement policy + usage counters). All memoized
//! functions attached to the group share its capacity and evict against each
//! other. The checkpoint is persisted inside the store under a reserved
//! all-zeros key, so a group directory is self-contained; peers detect each
//! other's checkpoints through a generation counter and merge on conflict.
//!
//! Lock discipline: the shared lock guards the store against cross-process
//! races (readers hold it shared while fetching values, writers hold it
//! exclusively while inserting, evicting, and checkpointing). In-process
//! state sits behind a mutex taken only after the shared lock, always in
//! that order.

use crate::codec::{Codec, JsonCodec};
use crate::config::{resolve_cache_root, GroupConfig};
use crate::index::{
    Checkpoint, EntryMeta, Lookup, Ttl, FIELD_PART_PREFIX, INDEX_PART, META_PART, VALUE_PART,
};
use crate::key::{CacheKey, FunctionVersion};
use crate::policy::PolicyKey;
use crate::stats::GroupStats;
use crate::{Error, Fingerprint, Result, SystemState};
use chrono::Utc;
use keepsake_store::{
    is_valid_part, DirStore, FileRwLock, LocalRwLock, MemoryStore, ObjStore, SharedLock,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const LOCK_FILE: &str = ".lock";
const NET_LOSS_MIN_CALLS: u64 = 16;

/// Shared cache state for a set of memoized functions.
pub struct MemoGroup {
    store: Arc<dyn ObjStore>,
    lock: Box<dyn SharedLock>,
    codec: Arc<dyn Codec>,
    system: SystemState,
    config: GroupConfig,
    state: Mutex<GroupState>,
}

struct GroupState {
    checkpoint: Checkpoint,
    /// Generation of the stored checkpoint our state is based on; a stored
    /// generation beyond this means a peer has written in between.
    base_generation: u64,
    /// Current version per call-site name, filled in as wrappers are built.
    registry: BTreeMap<String, Fingerprint>,
    warned_net_loss: bool,
}

/// Configures and opens a [`MemoGroup`].
pub struct GroupBuilder {
    config: GroupConfig,
    store: Option<Arc<dyn ObjStore>>,
    codec: Option<Arc<dyn Codec>>,
    lock: Option<Box<dyn SharedLock>>,
    system: SystemState,
}

impl GroupBuilder {
    /// Eviction threshold in bytes.
    #[must_use]
    pub fn capacity(mut self, bytes: u64) -> Self {
        self.config.capacity = bytes;
        self
    }

    /// Keep everything in process memory; nothing survives the process and
    /// no cross-process coordination happens.
    #[must_use]
    pub fn in_memory(mut self) -> Self {
        self.config.persistent = false;
        self
    }

    /// Explicit on-disk root, overriding `KEEPSAKE_CACHE_DIR` and the
    /// platform default.
    #[must_use]
    pub fn root(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.config.root = Some(path.into());
        self
    }

    /// Store JSON-object values one sub-entry per top-level field.
    #[must_use]
    pub fn fine_grain_persistence(mut self, on: bool) -> Self {
        self.config.fine_grain_persistence = on;
        self
    }

    /// Let the policy evict individual sub-entries. Implies fine-grain
    /// persistence for values that support it.
    #[must_use]
    pub fn fine_grain_eviction(mut self, on: bool) -> Self {
        self.config.fine_grain_eviction = on;
        if on {
            self.config.fine_grain_persistence = true;
        }
        self
    }

    /// Coordinate with other processes through a file lock (the default for
    /// persistent groups).
    #[must_use]
    pub fn shared_across_processes(mut self, on: bool) -> Self {
        self.config.shared_across_processes = on;
        self
    }

    /// Treat un-fingerprintable arguments as a cache bypass instead of an
    /// error.
    #[must_use]
    pub fn best_effort(mut self, on: bool) -> Self {
        self.config.best_effort = on;
        self
    }

    /// Freshness bound for entries whose wrapper declares no TTL of its
    /// own.
    #[must_use]
    pub fn default_ttl(mut self, ttl: Ttl) -> Self {
        self.config.default_ttl = Some(ttl);
        self
    }

    /// Use a custom lock in place of the file or process-local default.
    #[must_use]
    pub fn lock(mut self, lock: Box<dyn SharedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Extra system state folded into every key.
    #[must_use]
    pub fn system(mut self, system: SystemState) -> Self {
        self.system = system;
        self
    }

    /// Use a custom store backend. Cross-process locking is disabled for
    /// custom backends; the backend is responsible for its own coherence.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ObjStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom value codec in place of compact JSON.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Open the group, resolving the store root and loading any existing
    /// checkpoint.
    pub fn build(self) -> Result<MemoGroup> {
        let custom_store = self.store.is_some();
        let (store, lock): (Arc<dyn ObjStore>, Box<dyn SharedLock>) = match self.store {
            Some(store) => (store, Box::new(LocalRwLock::new())),
            None if self.config.persistent => {
                let root = resolve_cache_root(self.config.root.as_deref())?;
                let store: Arc<dyn ObjStore> = Arc::new(DirStore::open(&root)?);
                let lock: Box<dyn SharedLock> = if self.config.shared_across_processes {
                    Box::new(FileRwLock::new(root.join(LOCK_FILE)))
                } else {
                    Box::new(LocalRwLock::new())
                };
                (store, lock)
            }
            None => (Arc::new(MemoryStore::new()), Box::new(LocalRwLock::new())),
        };
        let lock = self.lock.unwrap_or(lock);

        let mut config = self.config;
        if custom_store || !config.persistent {
            config.shared_across_processes = false;
        }

        let group = MemoGroup {
            store,
            lock,
            codec: self.codec.unwrap_or_else(|| Arc::new(JsonCodec)),
            system: self.system,
            config,
            state: Mutex::new(GroupState {
                checkpoint: Checkpoint::default(),
                base_generation: 0,
                registry: BTreeMap::new(),
                warned_net_loss: false,
            }),
        };

        {
            let _guard = group.lock.reader()?;
            let mut state = group.state.lock();
            group.refresh_locked(&mut state)?;
        }
        Ok(group)
    }
}

/// A hit's payload, cloned out of the index so no borrow escapes the state
/// mutex.
enum Probe {
    Hit { parts: Vec<String>, cost: Duration },
    Stale,
    Miss,
}

impl MemoGroup {
    /// Start configuring a group.
    #[must_use]
    pub fn builder() -> GroupBuilder {
        GroupBuilder {
            config: GroupConfig::default(),
            store: None,
            codec: None,
            lock: None,
            system: SystemState::new(),
        }
    }

    /// Snapshot of the usage counters.
    #[must_use]
    pub fn stats(&self) -> GroupStats {
        self.state.lock().checkpoint.stats.clone()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().checkpoint.index.len()
    }

    /// True if no entries are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether un-fingerprintable arguments bypass the cache.
    #[must_use]
    pub(crate) fn best_effort(&self) -> bool {
        self.config.best_effort
    }

    pub(crate) fn system_fingerprint(&self) -> Result<Fingerprint> {
        self.system.fingerprint()
    }

    /// Write the checkpoint out now instead of waiting for drop.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.lock.writer()?;
        let mut state = self.state.lock();
        self.refresh_locked(&mut state)?;
        self.write_checkpoint_locked(&mut state)
    }

    /// Drop every entry and reset all counters.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.writer()?;
        let mut state = self.state.lock();
        self.store.clear()?;
        state.checkpoint = Checkpoint::default();
        state.base_generation = 0;
        self.write_checkpoint_locked(&mut state)
    }

    /// Record the current version for a call-site name. Entries recorded
    /// under other versions of a registered name are orphans.
    pub fn register(&self, function: &str, version: FunctionVersion) {
        self.state
            .lock()
            .registry
            .insert(function.to_string(), version.fingerprint());
    }

    /// Drop entries that can never be hit again: entries whose call-site
    /// name is no longer registered (the function was renamed or removed),
    /// entries of a registered function whose version has moved on, and
    /// store keys the index knows nothing about (crash debris). The registry
    /// defines the live set, so call this after every wrapper has been
    /// built. Returns how many entries were removed.
    pub fn remove_orphans(&self) -> Result<usize> {
        let _guard = self.lock.writer()?;
        let mut state = self.state.lock();
        self.refresh_locked(&mut state)?;

        let orphans = state.checkpoint.index.orphans(&state.registry);
        for key in &orphans {
            self.store.delete_key(&key.to_hex())?;
            state.checkpoint.index.remove(key);
            state.checkpoint.policy.invalidate_key(key);
            state.checkpoint.stats.record_invalidation();
        }

        let index_hex = CacheKey::index_key().to_hex();
        for key_hex in self.store.list_keys()? {
            if key_hex == index_hex {
                continue;
            }
            let known = key_hex
                .parse::<CacheKey>()
                .is_ok_and(|key| state.checkpoint.index.contains(&key));
            if !known {
                tracing::debug!(key = %key_hex, "deleting unindexed store key");
                self.store.delete_key(&key_hex)?;
            }
        }

        if !orphans.is_empty() {
            tracing::info!(removed = orphans.len(), "removed orphaned entries");
        }
        self.write_checkpoint_locked(&mut state)?;
        Ok(orphans.len())
    }

    /// Rebuild the index from per-entry metadata, discarding the stored
    /// checkpoint. Entries whose metadata is missing or unreadable are
    /// deleted as junk. Returns the number of recovered entries.
    pub fn rebuild(&self) -> Result<usize> {
        let _guard = self.lock.writer()?;
        let mut state = self.state.lock();

        let mut checkpoint = Checkpoint::default();
        let index_hex = CacheKey::index_key().to_hex();
        for key_hex in self.store.list_keys()? {
            if key_hex == index_hex {
                continue;
            }
            let Ok(key) = key_hex.parse::<CacheKey>() else {
                tracing::warn!(key = %key_hex, "dropping entry with malformed key");
                self.store.delete_key(&key_hex)?;
                continue;
            };
            let meta: EntryMeta = match self.store.get(&key_hex, META_PART)? {
                Some(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(meta) => meta,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "dropping entry with unreadable metadata");
                        self.store.delete_key(&key_hex)?;
                        continue;
                    }
                },
                None => {
                    tracing::warn!(key = %key, "dropping entry without metadata");
                    self.store.delete_key(&key_hex)?;
                    continue;
                }
            };
            self.track(&mut checkpoint, key, &meta);
            checkpoint.index.insert(key, meta);
        }

        let recovered = checkpoint.index.len();
        state.checkpoint = checkpoint;
        state.base_generation = 0;
        self.write_checkpoint_locked(&mut state)?;
        tracing::info!(recovered, "rebuilt index from store");
        Ok(recovered)
    }

    /// Log a one-line usage report at info level.
    pub fn log_usage_report(&self) {
        let stats = self.stats();
        tracing::info!(
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            invalidations = stats.invalidations,
            time_saved_secs = stats.time_saved().as_secs_f64(),
            time_spent_secs = stats.time_spent().as_secs_f64(),
            "cache usage report"
        );
    }

    /// Fetch a fresh cached value for `(key, version)`. Returns the decoded
    /// value and its recorded compute cost, or `None` on miss, stale entry,
    /// or partially evicted value. Marks the entry recently used.
    pub(crate) fn lookup_value(
        &self,
        key: &CacheKey,
        version: Fingerprint,
    ) -> Result<Option<(Value, Duration)>> {
        let _guard = self.lock.reader()?;
        let mut state = self.state.lock();

        let mut probe = Self::probe_locked(&state, key, version);
        if matches!(probe, Probe::Miss) && self.config.shared_across_processes {
            // A peer may have inserted this entry since our last refresh.
            self.refresh_locked(&mut state)?;
            probe = Self::probe_locked(&state, key, version);
        }

        let (parts, cost) = match probe {
            Probe::Hit { parts, cost } => (parts, cost),
            // Stale and partially evicted entries are overwritten by the
            // recompute; nothing to clean up under a reader lock.
            Probe::Stale | Probe::Miss => return Ok(None),
        };

        let hex = key.to_hex();
        let mut payloads = Vec::with_capacity(parts.len());
        for part in &parts {
            match self.store.get(&hex, part)? {
                Some(bytes) => payloads.push(bytes),
                None => return Ok(None),
            }
        }

        let value = self.assemble(&parts, &payloads)?;
        if self.config.fine_grain_eviction {
            for part in &parts {
                state.checkpoint.policy.access(&PolicyKey::part(*key, part.clone()));
            }
        } else {
            state.checkpoint.policy.access(&PolicyKey::whole(*key));
        }
        Ok(Some((value, cost)))
    }

    /// True if a call with this key would be served from the cache, without
    /// touching the value, the policy, or the counters.
    pub(crate) fn contains_fresh(&self, key: &CacheKey, version: Fingerprint) -> Result<bool> {
        let _guard = self.lock.reader()?;
        let mut state = self.state.lock();
        let mut probe = Self::probe_locked(&state, key, version);
        if matches!(probe, Probe::Miss) && self.config.shared_across_processes {
            self.refresh_locked(&mut state)?;
            probe = Self::probe_locked(&state, key, version);
        }
        let Probe::Hit { parts, .. } = probe else {
            return Ok(false);
        };
        // A partially evicted entry would not be served.
        let hex = key.to_hex();
        for part in &parts {
            if self.store.part_size(&hex, part)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Insert a computed value, evicting over capacity, and checkpoint.
    pub(crate) fn store_value(
        &self,
        key: &CacheKey,
        envelope: Value,
        function: &str,
        version: Fingerprint,
        ttl: Option<Ttl>,
        value: &Value,
        cost: Duration,
    ) -> Result<()> {
        let parts = self.split(value)?;
        let size: u64 = parts.iter().map(|(_, bytes)| bytes.len() as u64).sum();
        let ttl = ttl.or(self.config.default_ttl);
        let meta = EntryMeta {
            function: function.to_string(),
            version,
            envelope,
            inserted_at: Utc::now(),
            compute_cost_secs: cost.as_secs_f64(),
            size,
            ttl,
            parts: parts.iter().map(|(name, _)| name.clone()).collect(),
        };

        let _guard = self.lock.writer()?;
        let mut state = self.state.lock();
        if self.config.shared_across_processes {
            self.refresh_locked(&mut state)?;
        }

        let hex = key.to_hex();
        if state.checkpoint.index.contains(key) {
            // Replacing an entry: old sub-entries may not exist in the new
            // part set.
            state.checkpoint.policy.invalidate_key(key);
            self.store.delete_key(&hex)?;
        }
        for (part, bytes) in &parts {
            self.store.put(&hex, part, bytes)?;
        }
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| Error::serialization(format!("cannot encode entry metadata: {e}")))?;
        self.store.put(&hex, META_PART, &meta_bytes)?;

        self.track(&mut state.checkpoint, *key, &meta);
        state.checkpoint.index.insert(*key, meta);

        let evicted = state.checkpoint.policy.evict_over(self.config.capacity);
        state.checkpoint.stats.record_evictions(evicted.len() as u64);
        self.apply_evictions(&mut state.checkpoint, &evicted)?;

        self.write_checkpoint_locked(&mut state)
    }

    pub(crate) fn note_hit(&self, compute_cost: Duration, overhead: Duration) {
        self.state
            .lock()
            .checkpoint
            .stats
            .record_hit(compute_cost, overhead);
    }

    pub(crate) fn note_miss(&self, overhead: Duration) {
        self.state.lock().checkpoint.stats.record_miss(overhead);
    }

    /// Warn once per group when the machinery has cost more time than it
    /// has saved, after enough calls for the judgement to mean something.
    pub(crate) fn warn_if_net_loss(&self, function: &str) {
        let mut state = self.state.lock();
        let stats = &state.checkpoint.stats;
        if state.warned_net_loss || stats.hits + stats.misses < NET_LOSS_MIN_CALLS {
            return;
        }
        if stats.is_net_loss() {
            tracing::warn!(
                function,
                time_saved_secs = stats.time_saved().as_secs_f64(),
                time_spent_secs = stats.time_spent().as_secs_f64(),
                "cache overhead exceeds time saved; consider disabling caching here"
            );
            state.warned_net_loss = true;
        }
    }

    fn probe_locked(state: &GroupState, key: &CacheKey, version: Fingerprint) -> Probe {
        match state.checkpoint.index.lookup(key, version, Utc::now()) {
            Lookup::Hit(meta) => Probe::Hit {
                parts: meta.parts.clone(),
                cost: meta.compute_cost(),
            },
            Lookup::Stale => Probe::Stale,
            Lookup::Miss => Probe::Miss,
        }
    }

    /// Merge the stored checkpoint if a peer has advanced it past our base.
    fn refresh_locked(&self, state: &mut GroupState) -> Result<()> {
        let index_hex = CacheKey::index_key().to_hex();
        let Some(bytes) = self.store.get(&index_hex, INDEX_PART)? else {
            return Ok(());
        };
        let stored: Checkpoint = match serde_json::from_slice(&bytes) {
            Ok(stored) => stored,
            Err(e) => {
                // Recoverable: the store itself is the source of truth.
                tracing::warn!(error = %e, "stored checkpoint is unreadable; run rebuild() to recover entries");
                return Ok(());
            }
        };
        if stored.generation <= state.base_generation {
            return Ok(());
        }
        tracing::debug!(
            ours = state.base_generation,
            theirs = stored.generation,
            "merging peer checkpoint"
        );
        state.base_generation = stored.generation;
        state.checkpoint.index.merge(stored.index);
        state.checkpoint.policy.merge(stored.policy);
        state.checkpoint.stats.reconcile(&stored.stats);
        Ok(())
    }

    fn write_checkpoint_locked(&self, state: &mut GroupState) -> Result<()> {
        state.checkpoint.generation = state.base_generation + 1;
        let bytes = serde_json::to_vec(&state.checkpoint)
            .map_err(|e| Error::serialization(format!("cannot encode checkpoint: {e}")))?;
        self.store
            .put(&CacheKey::index_key().to_hex(), INDEX_PART, &bytes)?;
        state.base_generation = state.checkpoint.generation;
        Ok(())
    }

    /// Encode a value into its sub-entry parts per the group's granularity.
    fn split(&self, value: &Value) -> Result<Vec<(String, Vec<u8>)>> {
        if self.config.fine_grain_persistence {
            if let Value::Object(map) = value {
                let splittable = !map.is_empty()
                    && map
                        .keys()
                        .all(|field| is_valid_part(&format!("{FIELD_PART_PREFIX}{field}")));
                if splittable {
                    let mut parts = Vec::with_capacity(map.len());
                    for (field, field_value) in map {
                        parts.push((
                            format!("{FIELD_PART_PREFIX}{field}"),
                            self.codec.encode(field_value)?,
                        ));
                    }
                    return Ok(parts);
                }
            }
        }
        Ok(vec![(VALUE_PART.to_string(), self.codec.encode(value)?)])
    }

    /// Reassemble a value from its sub-entry payloads.
    fn assemble(&self, parts: &[String], payloads: &[Vec<u8>]) -> Result<Value> {
        if parts.len() == 1 && parts[0] == VALUE_PART {
            return self.codec.decode(&payloads[0]);
        }
        let mut map = serde_json::Map::with_capacity(parts.len());
        for (part, bytes) in parts.iter().zip(payloads) {
            let field = part.strip_prefix(FIELD_PART_PREFIX).ok_or_else(|| {
                Error::serialization(format!("unexpected sub-entry name: {part}"))
            })?;
            map.insert(field.to_string(), self.codec.decode(bytes)?);
        }
        Ok(Value::Object(map))
    }

    /// Register an entry's parts with the replacement policy. Fine-grain
    /// eviction splits the compute cost across sub-entries in proportion to
    /// their size.
    fn track(&self, checkpoint: &mut Checkpoint, key: CacheKey, meta: &EntryMeta) {
        if self.config.fine_grain_eviction && meta.parts.len() > 1 {
            let total = meta.size.max(1);
            for part in &meta.parts {
                let part_size = self
                    .store
                    .part_size(&key.to_hex(), part)
                    .ok()
                    .flatten()
                    .unwrap_or(meta.size / meta.parts.len() as u64);
                let share = meta.compute_cost().as_secs_f64() * part_size as f64 / total as f64;
                checkpoint.policy.add(
                    PolicyKey::part(key, part.clone()),
                    Duration::from_secs_f64(share),
                    part_size,
                );
            }
        } else {
            checkpoint
                .policy
                .add(PolicyKey::whole(key), meta.compute_cost(), meta.size);
        }
    }

    /// Delete evicted sub-entries from the store and the index.
    fn apply_evictions(&self, checkpoint: &mut Checkpoint, evicted: &[PolicyKey]) -> Result<()> {
        for policy_key in evicted {
            let hex = policy_key.key.to_hex();
            match &policy_key.part {
                None => {
                    checkpoint.index.remove(&policy_key.key);
                    self.store.delete_key(&hex)?;
                }
                Some(part) => {
                    // The index keeps the full part list: an entry missing
                    // any sub-entry reads as a miss and is overwritten by
                    // the recompute, never served incomplete.
                    self.store.delete(&hex, part)?;
                    let drained = checkpoint.index.get(&policy_key.key).is_some_and(|meta| {
                        meta.parts
                            .iter()
                            .all(|p| !checkpoint.policy.contains(&PolicyKey::part(policy_key.key, p.clone())))
                    });
                    if drained {
                        checkpoint.index.remove(&policy_key.key);
                        self.store.delete_key(&hex)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for MemoGroup {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to checkpoint cache group on drop");
        }
    }
}

impl std::fmt::Debug for MemoGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoGroup")
            .field("config", &self.config)
            .field("entries", &self.state.lock().checkpoint.index.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{compute_key, Captures, KeyEnvelope};
    use serde_json::json;
    use tempfile::TempDir;

    fn version(label: &str) -> Fingerprint {
        FunctionVersion::from_label(label).fingerprint()
    }

    fn key_for(function: &str, arg: i64, ver: &str) -> (CacheKey, Value) {
        let envelope = KeyEnvelope {
            function: function.into(),
            version: version(ver),
            args: Fingerprint::of_value(&arg).unwrap(),
            captures: Captures::new().fingerprint(),
            system: SystemState::new().fingerprint().unwrap(),
        };
        compute_key(&envelope).unwrap()
    }

    fn put(group: &MemoGroup, function: &str, arg: i64, ver: &str, value: Value, cost_ms: u64) {
        let (key, envelope) = key_for(function, arg, ver);
        group
            .store_value(
                &key,
                envelope,
                function,
                version(ver),
                None,
                &value,
                Duration::from_millis(cost_ms),
            )
            .unwrap();
    }

    #[test]
    fn test_store_and_lookup_roundtrip() {
        let dir = TempDir::new().unwrap();
        let group = MemoGroup::builder().root(dir.path()).build().unwrap();

        put(&group, "f", 1, "v1", json!({"answer": 42}), 100);
        let (key, _) = key_for("f", 1, "v1");
        let (value, cost) = group.lookup_value(&key, version("v1")).unwrap().unwrap();
        assert_eq!(value, json!({"answer": 42}));
        assert_eq!(cost, Duration::from_millis(100));
    }

    #[test]
    fn test_version_change_misses() {
        let dir = TempDir::new().unwrap();
        let group = MemoGroup::builder().root(dir.path()).build().unwrap();

        put(&group, "f", 1, "v1", json!(1), 10);
        let (key, _) = key_for("f", 1, "v1");
        assert!(group.lookup_value(&key, version("v2")).unwrap().is_none());
    }

    #[test]
    fn test_reopen_recovers_entries() {
        let dir = TempDir::new().unwrap();
        {
            let group = MemoGroup::builder().root(dir.path()).build().unwrap();
            put(&group, "f", 1, "v1", json!("persisted"), 10);
        }
        let group = MemoGroup::builder().root(dir.path()).build().unwrap();
        let (key, _) = key_for("f", 1, "v1");
        let (value, _) = group.lookup_value(&key, version("v1")).unwrap().unwrap();
        assert_eq!(value, json!("persisted"));
    }

    #[test]
    fn test_two_groups_share_one_root() {
        let dir = TempDir::new().unwrap();
        let writer = MemoGroup::builder().root(dir.path()).build().unwrap();
        let reader = MemoGroup::builder().root(dir.path()).build().unwrap();

        put(&writer, "f", 1, "v1", json!(7), 10);
        // The reader refreshes from the stored checkpoint on local miss.
        let (key, _) = key_for("f", 1, "v1");
        let (value, _) = reader.lookup_value(&key, version("v1")).unwrap().unwrap();
        assert_eq!(value, json!(7));
    }

    #[test]
    fn test_capacity_evicts_lowest_value_entry() {
        let dir = TempDir::new().unwrap();
        let group = MemoGroup::builder()
            .root(dir.path())
            .capacity(30)
            .build()
            .unwrap();

        // Sizes are the encoded JSON lengths; pad to comparable sizes.
        put(&group, "f", 1, "v1", json!("aaaaaaaaaa"), 2000);
        put(&group, "f", 2, "v1", json!("bbbbbbbbbb"), 8000);
        put(&group, "f", 3, "v1", json!("cccccccccc"), 1000);

        let (cheap, _) = key_for("f", 3, "v1");
        assert!(group.lookup_value(&cheap, version("v1")).unwrap().is_none());
        let (dear, _) = key_for("f", 2, "v1");
        assert!(group.lookup_value(&dear, version("v1")).unwrap().is_some());
        assert_eq!(group.stats().evictions, 1);
    }

    #[test]
    fn test_remove_orphans() {
        let dir = TempDir::new().unwrap();
        let group = MemoGroup::builder().root(dir.path()).build().unwrap();

        put(&group, "f", 1, "v1", json!(1), 10);
        put(&group, "f", 2, "v1", json!(2), 10);
        put(&group, "f", 1, "v2", json!(10), 10);
        put(&group, "g", 1, "v1", json!(100), 10);

        group.register("f", FunctionVersion::from_label("v2"));
        group.register("g", FunctionVersion::from_label("v1"));
        let removed = group.remove_orphans().unwrap();
        assert_eq!(removed, 2);
        assert_eq!(group.len(), 2);

        let (kept, _) = key_for("f", 1, "v2");
        assert!(group.lookup_value(&kept, version("v2")).unwrap().is_some());
        let (other_fn, _) = key_for("g", 1, "v1");
        assert!(group.lookup_value(&other_fn, version("v1")).unwrap().is_some());
    }

    #[test]
    fn test_remove_orphans_drops_unregistered_functions() {
        let dir = TempDir::new().unwrap();
        let group = MemoGroup::builder().root(dir.path()).build().unwrap();

        put(&group, "kept_fn", 1, "v1", json!(1), 10);
        put(&group, "removed_fn", 1, "v1", json!(2), 10);

        // Only "kept_fn" is registered this session; "removed_fn" no longer
        // exists anywhere and its entry is unreachable.
        group.register("kept_fn", FunctionVersion::from_label("v1"));
        let removed = group.remove_orphans().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(group.len(), 1);

        let (gone, _) = key_for("removed_fn", 1, "v1");
        assert!(group.lookup_value(&gone, version("v1")).unwrap().is_none());
        assert!(group
            .store
            .list_parts(&gone.to_hex())
            .unwrap()
            .is_empty());
        let (kept, _) = key_for("kept_fn", 1, "v1");
        assert!(group.lookup_value(&kept, version("v1")).unwrap().is_some());
    }

    #[test]
    fn test_remove_orphans_sweeps_unindexed_keys() {
        let dir = TempDir::new().unwrap();
        let group = MemoGroup::builder().root(dir.path()).build().unwrap();
        put(&group, "f", 1, "v1", json!(1), 10);
        group.register("f", FunctionVersion::from_label("v1"));

        // Crash debris: a stored key the index never learned about.
        let debris = "ff".repeat(32);
        group.store.put(&debris, "value", b"junk").unwrap();

        assert_eq!(group.remove_orphans().unwrap(), 0);
        assert!(group.store.part_size(&debris, "value").unwrap().is_none());
        let (kept, _) = key_for("f", 1, "v1");
        assert!(group.lookup_value(&kept, version("v1")).unwrap().is_some());
    }

    #[test]
    fn test_rebuild_from_store() {
        let dir = TempDir::new().unwrap();
        let group = MemoGroup::builder().root(dir.path()).build().unwrap();
        put(&group, "f", 1, "v1", json!([1, 2, 3]), 10);
        put(&group, "f", 2, "v1", json!([4]), 10);

        // Corrupt the stored checkpoint; entries must still be recoverable.
        let index_hex = CacheKey::index_key().to_hex();
        group.store.put(&index_hex, INDEX_PART, b"garbage").unwrap();

        let recovered = group.rebuild().unwrap();
        assert_eq!(recovered, 2);
        let (key, _) = key_for("f", 1, "v1");
        let (value, _) = group.lookup_value(&key, version("v1")).unwrap().unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn test_clear_resets_everything() {
        let dir = TempDir::new().unwrap();
        let group = MemoGroup::builder().root(dir.path()).build().unwrap();
        put(&group, "f", 1, "v1", json!(1), 10);

        group.clear().unwrap();
        assert!(group.is_empty());
        let (key, _) = key_for("f", 1, "v1");
        assert!(group.lookup_value(&key, version("v1")).unwrap().is_none());
        assert_eq!(group.stats().evictions, 0);
    }

    #[test]
    fn test_fine_grain_persistence_splits_fields() {
        let dir = TempDir::new().unwrap();
        let group = MemoGroup::builder()
            .root(dir.path())
            .fine_grain_persistence(true)
            .build()
            .unwrap();

        put(&group, "f", 1, "v1", json!({"alpha": [1, 2], "beta": "x"}), 10);
        let (key, _) = key_for("f", 1, "v1");
        let parts = group.store.list_parts(&key.to_hex()).unwrap();
        assert_eq!(parts, vec!["f-alpha", "f-beta", "meta"]);

        let (value, _) = group.lookup_value(&key, version("v1")).unwrap().unwrap();
        assert_eq!(value, json!({"alpha": [1, 2], "beta": "x"}));
    }

    #[test]
    fn test_fine_grain_eviction_drops_sub_entries() {
        let dir = TempDir::new().unwrap();
        let group = MemoGroup::builder()
            .root(dir.path())
            .fine_grain_eviction(true)
            .capacity(40)
            .build()
            .unwrap();

        // One big cheap field, one small field; the big one should go alone.
        put(
            &group,
            "f",
            1,
            "v1",
            json!({"bulk": "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx", "tiny": 1}),
            10,
        );
        let (key, _) = key_for("f", 1, "v1");
        let parts = group.store.list_parts(&key.to_hex()).unwrap();
        assert!(!parts.contains(&"f-bulk".to_string()));
        assert!(parts.contains(&"f-tiny".to_string()));

        // The partially evicted value reads as a miss.
        assert!(group.lookup_value(&key, version("v1")).unwrap().is_none());
    }

    #[test]
    fn test_in_memory_group() {
        let group = MemoGroup::builder().in_memory().build().unwrap();
        put(&group, "f", 1, "v1", json!(5), 10);
        let (key, _) = key_for("f", 1, "v1");
        assert!(group.lookup_value(&key, version("v1")).unwrap().is_some());
    }
}
