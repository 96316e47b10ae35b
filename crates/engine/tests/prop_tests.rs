//! Property tests for fingerprints, key identity, and the eviction policy.

use keepsake::{
    compute_key, CacheKey, Captures, Fingerprint, FunctionVersion, GreedyDualSize, KeyEnvelope,
    PolicyKey, SystemState,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::time::Duration;

fn key_from_seed(seed: u64) -> CacheKey {
    let envelope = KeyEnvelope {
        function: "prop".into(),
        version: FunctionVersion::from_label("v1").fingerprint(),
        args: Fingerprint::of_value(&seed).unwrap(),
        captures: Captures::new().fingerprint(),
        system: SystemState::new().fingerprint().unwrap(),
    };
    compute_key(&envelope).unwrap().0
}

proptest! {
    #[test]
    fn fingerprint_is_deterministic(data: Vec<u8>) {
        prop_assert_eq!(Fingerprint::of_bytes(&data), Fingerprint::of_bytes(&data));
    }

    #[test]
    fn fingerprint_hex_roundtrips(data: Vec<u8>) {
        let fp = Fingerprint::of_bytes(&data);
        let parsed: Fingerprint = fp.to_hex().parse().unwrap();
        prop_assert_eq!(fp, parsed);
    }

    #[test]
    fn map_iteration_order_never_leaks(pairs: Vec<(String, i64)>) {
        let forward: HashMap<_, _> = pairs.iter().cloned().collect();
        let reverse: HashMap<_, _> = pairs.iter().rev().cloned().collect();
        prop_assert_eq!(
            Fingerprint::of_value(&forward).unwrap(),
            Fingerprint::of_value(&reverse).unwrap()
        );
    }

    #[test]
    fn distinct_args_give_distinct_keys(a: u64, b: u64) {
        prop_assume!(a != b);
        prop_assert_ne!(key_from_seed(a), key_from_seed(b));
    }

    #[test]
    fn eviction_respects_capacity(
        entries in prop::collection::vec((1u64..=64, 1u64..=1000), 1..40),
        capacity in 0u64..2000,
    ) {
        let mut policy = GreedyDualSize::new();
        for (i, (size, cost_ms)) in entries.iter().enumerate() {
            policy.add(
                PolicyKey::whole(key_from_seed(i as u64)),
                Duration::from_millis(*cost_ms),
                *size,
            );
        }
        let evicted = policy.evict_over(capacity);
        prop_assert!(policy.total_size() <= capacity);
        // Eviction only ever removes entries, never adds.
        prop_assert_eq!(policy.len() + evicted.len(), entries.len());
    }

    #[test]
    fn accessed_entries_outlive_untouched_peers(n in 4usize..10) {
        // Equal cost and size for all entries; refresh one under pressure
        // and it must be the last survivor.
        let mut policy = GreedyDualSize::new();
        for i in 0..n {
            policy.add(
                PolicyKey::whole(key_from_seed(i as u64)),
                Duration::from_secs(1),
                4,
            );
        }
        // Evict exactly one entry (the oldest) to raise the clock above the
        // founding priorities.
        let _ = policy.evict_over((n as u64 - 1) * 4);

        let favorite = PolicyKey::whole(key_from_seed(1));
        policy.access(&favorite);

        let _ = policy.evict_over(4);
        prop_assert!(policy.contains(&favorite));
        prop_assert_eq!(policy.len(), 1);
    }
}
