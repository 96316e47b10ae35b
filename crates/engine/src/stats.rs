//! Group usage accounting
//!
//! Tracks hit/miss counters and the two aggregate durations that decide
//! whether caching is paying for itself: time spent on cache machinery
//! (hashing, locking, store IO) versus compute time avoided by hits. The
//! counters persist with the group checkpoint so the judgement spans runs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cumulative usage counters for one cache group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupStats {
    /// Calls answered from the cache
    pub hits: u64,
    /// Calls that had to compute
    pub misses: u64,
    /// Entries dropped by the replacement policy
    pub evictions: u64,
    /// Entries dropped because their TTL had lapsed or their version moved
    pub invalidations: u64,
    time_saved_secs: f64,
    time_spent_secs: f64,
}

impl GroupStats {
    /// Fresh counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit that avoided `compute_cost` of work, at `overhead`
    /// machinery cost.
    pub fn record_hit(&mut self, compute_cost: Duration, overhead: Duration) {
        self.hits += 1;
        self.time_saved_secs += compute_cost.as_secs_f64();
        self.time_spent_secs += overhead.as_secs_f64();
    }

    /// Record a miss whose machinery cost `overhead` on top of the compute.
    pub fn record_miss(&mut self, overhead: Duration) {
        self.misses += 1;
        self.time_spent_secs += overhead.as_secs_f64();
    }

    /// Record entries dropped by the replacement policy.
    pub fn record_evictions(&mut self, count: u64) {
        self.evictions += count;
    }

    /// Record an entry dropped by TTL or version invalidation.
    pub fn record_invalidation(&mut self) {
        self.invalidations += 1;
    }

    /// Total compute time avoided by hits.
    #[must_use]
    pub fn time_saved(&self) -> Duration {
        Duration::from_secs_f64(self.time_saved_secs.max(0.0))
    }

    /// Total time spent on cache machinery.
    #[must_use]
    pub fn time_spent(&self) -> Duration {
        Duration::from_secs_f64(self.time_spent_secs.max(0.0))
    }

    /// Hit rate over all completed calls, or `None` before the first call.
    #[must_use]
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits + self.misses;
        (total > 0).then(|| self.hits as f64 / total as f64)
    }

    /// True when the machinery has cost more time than it has saved. Used
    /// to warn once per group when the cache is a net loss.
    #[must_use]
    pub fn is_net_loss(&self) -> bool {
        self.time_spent_secs > self.time_saved_secs
    }

    /// Reconcile with counters checkpointed by a peer process. Both sides
    /// accumulated from the same loaded baseline, so field-wise maximum is
    /// the closest recoverable value without per-writer deltas.
    pub fn reconcile(&mut self, other: &GroupStats) {
        self.hits = self.hits.max(other.hits);
        self.misses = self.misses.max(other.misses);
        self.evictions = self.evictions.max(other.evictions);
        self.invalidations = self.invalidations.max(other.invalidations);
        self.time_saved_secs = self.time_saved_secs.max(other.time_saved_secs);
        self.time_spent_secs = self.time_spent_secs.max(other.time_spent_secs);
    }

    /// Fold in counters from a disjoint accounting period.
    pub fn merge(&mut self, other: &GroupStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.evictions += other.evictions;
        self.invalidations += other.invalidations;
        self.time_saved_secs += other.time_saved_secs;
        self.time_spent_secs += other.time_spent_secs;
    }
}
