//! Greedy-Dual-Size replacement policy
//!
//! Each live entry carries a priority `H = clock + cost/size`. The global
//! clock is monotone: every eviction raises it to the evicted entry's
//! priority, so surviving entries' relative priority reflects credit already
//! spent, and recently accessed entries (re-priced at the current clock)
//! float above long-untouched ones without any full re-sort.
//!
//! Policy state lives inside the group's write-locked state and is persisted
//! with the index checkpoint, so the clock survives restarts. The policy
//! never runs outside a held write lock, which is also what keeps it from
//! evicting an entry that is mid-write: writes and evictions are serialized.

use crate::key::CacheKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// What the policy tracks: a whole entry, or one sub-entry when fine-grain
/// eviction is enabled.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyKey {
    /// The owning cache key
    pub key: CacheKey,
    /// Sub-entry name, when tracked at sub-key granularity
    pub part: Option<String>,
}

impl PolicyKey {
    /// Whole-entry policy key.
    #[must_use]
    pub fn whole(key: CacheKey) -> Self {
        Self { key, part: None }
    }

    /// Sub-entry policy key.
    #[must_use]
    pub fn part(key: CacheKey, part: impl Into<String>) -> Self {
        Self {
            key,
            part: Some(part.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolicyEntry {
    cost_secs: f64,
    size: u64,
    priority: f64,
    seq: u64,
}

/// Greedy-Dual-Size eviction state.
#[derive(Debug, Serialize, Deserialize)]
pub struct GreedyDualSize {
    clock: f64,
    next_seq: u64,
    #[serde(with = "entries_as_pairs")]
    entries: BTreeMap<PolicyKey, PolicyEntry>,
}

/// JSON map keys must be strings, so the entry map crosses the checkpoint
/// boundary as a list of pairs.
mod entries_as_pairs {
    use super::{PolicyEntry, PolicyKey};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        entries: &BTreeMap<PolicyKey, PolicyEntry>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(entries.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<PolicyKey, PolicyEntry>, D::Error> {
        let pairs = Vec::<(PolicyKey, PolicyEntry)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

impl GreedyDualSize {
    /// Empty policy with the clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: 0.0,
            next_seq: 0,
            entries: BTreeMap::new(),
        }
    }

    fn ratio(cost_secs: f64, size: u64) -> f64 {
        cost_secs / size.max(1) as f64
    }

    /// Insert a new entry at priority `clock + cost/size`. The caller is
    /// responsible for following up with [`evict_over`](Self::evict_over)
    /// when the configured capacity is exceeded.
    pub fn add(&mut self, key: PolicyKey, cost: Duration, size: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let cost_secs = cost.as_secs_f64();
        self.entries.insert(
            key,
            PolicyEntry {
                cost_secs,
                size,
                priority: self.clock + Self::ratio(cost_secs, size),
                seq,
            },
        );
    }

    /// Re-price an entry at the current clock, marking it recently used.
    pub fn access(&mut self, key: &PolicyKey) {
        let clock = self.clock;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.priority = clock + Self::ratio(entry.cost_secs, entry.size);
        }
    }

    /// Adjust an entry's measured cost/size without touching its position
    /// history: the priority keeps its accumulated clock base.
    pub fn update(&mut self, key: &PolicyKey, cost: Duration, size: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            let old_ratio = Self::ratio(entry.cost_secs, entry.size);
            entry.cost_secs = cost.as_secs_f64();
            entry.size = size;
            entry.priority = entry.priority - old_ratio + Self::ratio(entry.cost_secs, entry.size);
        }
    }

    /// Unconditionally remove an entry (TTL expiry, version mismatch,
    /// orphan). Returns true if it was tracked.
    pub fn invalidate(&mut self, key: &PolicyKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every policy entry belonging to `key`, at any granularity.
    pub fn invalidate_key(&mut self, key: &CacheKey) {
        self.entries.retain(|pk, _| pk.key != *key);
    }

    /// Total tracked size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if `key` is tracked.
    #[must_use]
    pub fn contains(&self, key: &PolicyKey) -> bool {
        self.entries.contains_key(key)
    }

    fn victim(&self) -> Option<PolicyKey> {
        self.entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.priority
                    .total_cmp(&b.priority)
                    // Equal priority: oldest insertion goes first.
                    .then_with(|| a.seq.cmp(&b.seq))
            })
            .map(|(key, _)| key.clone())
    }

    /// Evict lowest-priority entries until total size is at most
    /// `capacity`, raising the clock to each evicted entry's priority.
    /// Returns the evicted keys so the store and index can drop them.
    pub fn evict_over(&mut self, capacity: u64) -> Vec<PolicyKey> {
        let mut evicted = Vec::new();
        let mut total = self.total_size();
        while total > capacity {
            let Some(victim) = self.victim() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&victim) {
                self.clock = self.clock.max(entry.priority);
                total -= entry.size.min(total);
                tracing::debug!(
                    key = %victim.key,
                    part = victim.part.as_deref().unwrap_or("-"),
                    size = entry.size,
                    priority = entry.priority,
                    new_total = total,
                    "evicted entry"
                );
                evicted.push(victim);
            }
        }
        evicted
    }

    /// Merge state checkpointed by a peer process: entries we do not track
    /// are adopted, ours win on conflict, and the clock advances to the
    /// larger of the two.
    pub fn merge(&mut self, other: GreedyDualSize) {
        self.clock = self.clock.max(other.clock);
        for (key, entry) in other.entries {
            self.next_seq = self.next_seq.max(entry.seq + 1);
            self.entries.entry(key).or_insert(entry);
        }
    }
}

impl Default for GreedyDualSize {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{compute_key, Captures, FunctionVersion, KeyEnvelope, SystemState};
    use crate::Fingerprint;

    fn ck(tag: &str) -> CacheKey {
        let envelope = KeyEnvelope {
            function: tag.into(),
            version: FunctionVersion::from_label("v1").fingerprint(),
            args: Fingerprint::of_bytes(tag.as_bytes()),
            captures: Captures::new().fingerprint(),
            system: SystemState::new().fingerprint().unwrap(),
        };
        compute_key(&envelope).unwrap().0
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_worked_eviction_example() {
        // capacity 10; A(size 4, cost 2), B(4, 8), C(4, 1): evict C only.
        let mut policy = GreedyDualSize::new();
        let (a, b, c) = (ck("a"), ck("b"), ck("c"));
        policy.add(PolicyKey::whole(a), secs(2), 4);
        policy.add(PolicyKey::whole(b), secs(8), 4);
        policy.add(PolicyKey::whole(c), secs(1), 4);
        assert_eq!(policy.total_size(), 12);

        let evicted = policy.evict_over(10);
        assert_eq!(evicted, vec![PolicyKey::whole(c)]);
        assert_eq!(policy.total_size(), 8);
        assert!(policy.contains(&PolicyKey::whole(a)));
        assert!(policy.contains(&PolicyKey::whole(b)));
    }

    #[test]
    fn test_clock_rises_to_evicted_priority() {
        let mut policy = GreedyDualSize::new();
        policy.add(PolicyKey::whole(ck("cheap")), secs(1), 4);
        policy.add(PolicyKey::whole(ck("dear")), secs(8), 4);
        let _ = policy.evict_over(4);

        // A fresh insert now starts above the spent credit: its priority
        // includes the raised clock.
        let late = ck("late");
        policy.add(PolicyKey::whole(late), secs(1), 4);
        let _ = policy.evict_over(4);
        // "late" (H = 0.25 clock + 0.25 = 0.5) loses to "dear" (H = 2.0).
        assert!(!policy.contains(&PolicyKey::whole(late)));
        assert!(policy.contains(&PolicyKey::whole(ck("dear"))));
    }

    #[test]
    fn test_tie_break_is_oldest_insertion() {
        let mut policy = GreedyDualSize::new();
        let first = ck("first");
        let second = ck("second");
        policy.add(PolicyKey::whole(first), secs(2), 4);
        policy.add(PolicyKey::whole(second), secs(2), 4);

        let evicted = policy.evict_over(4);
        assert_eq!(evicted, vec![PolicyKey::whole(first)]);
    }

    #[test]
    fn test_access_refreshes_priority() {
        let mut policy = GreedyDualSize::new();
        let hot = ck("hot");
        let cold = ck("cold");
        // Same cost/size; "hot" inserted first would lose ties.
        policy.add(PolicyKey::whole(hot), secs(2), 4);
        policy.add(PolicyKey::whole(cold), secs(2), 4);

        // Raise the clock by evicting a filler entry.
        policy.add(PolicyKey::whole(ck("filler")), secs(1), 100);
        let _ = policy.evict_over(8);

        policy.access(&PolicyKey::whole(hot));
        let evicted = policy.evict_over(4);
        assert_eq!(evicted, vec![PolicyKey::whole(cold)]);
        assert!(policy.contains(&PolicyKey::whole(hot)));
    }

    #[test]
    fn test_invalidate_ignores_size_pressure() {
        let mut policy = GreedyDualSize::new();
        let k = ck("k");
        policy.add(PolicyKey::whole(k), secs(100), 1);
        assert!(policy.invalidate(&PolicyKey::whole(k)));
        assert!(!policy.invalidate(&PolicyKey::whole(k)));
        assert_eq!(policy.total_size(), 0);
    }

    #[test]
    fn test_update_keeps_clock_base() {
        let mut policy = GreedyDualSize::new();
        policy.add(PolicyKey::whole(ck("filler")), secs(4), 4);
        let _ = policy.evict_over(0); // clock now 1.0

        let k = ck("k");
        policy.add(PolicyKey::whole(k), secs(2), 4); // priority 1.5
        policy.update(&PolicyKey::whole(k), secs(4), 4); // ratio 0.5 -> 1.0
        policy.add(PolicyKey::whole(ck("other")), secs(6), 4); // priority 2.5

        let evicted = policy.evict_over(4);
        assert_eq!(evicted, vec![PolicyKey::whole(k)]); // 2.0 < 2.5
    }

    #[test]
    fn test_part_granularity() {
        let mut policy = GreedyDualSize::new();
        let k = ck("k");
        policy.add(PolicyKey::part(k, "col_a"), secs(1), 6);
        policy.add(PolicyKey::part(k, "col_b"), secs(9), 6);

        let evicted = policy.evict_over(6);
        assert_eq!(evicted, vec![PolicyKey::part(k, "col_a")]);

        policy.invalidate_key(&k);
        assert!(policy.is_empty());
    }

    #[test]
    fn test_serde_roundtrip_with_entries() {
        let mut policy = GreedyDualSize::new();
        policy.add(PolicyKey::whole(ck("a")), secs(2), 4);
        policy.add(PolicyKey::part(ck("b"), "f-col"), secs(8), 16);
        let _ = policy.evict_over(16);

        let bytes = serde_json::to_vec(&policy).unwrap();
        let back: GreedyDualSize = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.total_size(), policy.total_size());
        assert_eq!(back.len(), policy.len());
        assert!(back.contains(&PolicyKey::part(ck("b"), "f-col")));
    }

    #[test]
    fn test_merge_adopts_unknown_entries() {
        let mut ours = GreedyDualSize::new();
        let shared = ck("shared");
        let theirs_only = ck("theirs");
        ours.add(PolicyKey::whole(shared), secs(2), 4);

        let mut theirs = GreedyDualSize::new();
        theirs.add(PolicyKey::whole(shared), secs(9), 9);
        theirs.add(PolicyKey::whole(theirs_only), secs(3), 4);

        ours.merge(theirs);
        assert!(ours.contains(&PolicyKey::whole(theirs_only)));
        // Ours wins on conflict.
        assert_eq!(ours.total_size(), 4 + 4);
    }
}
