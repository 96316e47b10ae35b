//! Transparent, persistent memoization for pure functions
//!
//! keepsake caches function results under a content-derived key: the
//! function's name, a version fingerprint, the canonicalized arguments,
//! declared captured state, and group-level system state. Equal inputs hash
//! equally across processes, machines, and runs, so a result computed
//! yesterday on another host is a hit today — and any change to the inputs
//! is a miss, never a wrong answer.
//!
//! Results live in an object store shared by a [`MemoGroup`]: by default a
//! directory tree with atomic sub-key-granular writes, coordinated across
//! processes with an advisory file lock. When the group exceeds its capacity
//! it evicts by Greedy-Dual-Size, favoring entries that are small and were
//! expensive to compute.
//!
//! ```
//! use keepsake::{memoized, MemoGroup};
//! use std::sync::Arc;
//!
//! let group = Arc::new(MemoGroup::builder().in_memory().build().unwrap());
//! let total = memoized!(group, total, |xs: &Vec<u64>| -> u64 {
//!     xs.iter().sum()
//! });
//!
//! assert_eq!(total.call(&vec![1, 2, 3]).unwrap(), 6);
//! assert_eq!(total.call(&vec![1, 2, 3]).unwrap(), 6); // served from cache
//! ```
//!
//! Failures in the caching machinery degrade to recomputation with a
//! warning; they never change a program's answers.

mod codec;
mod config;
mod error;
mod fingerprint;
mod group;
mod index;
mod key;
mod memoized;
mod policy;
mod stats;

pub use codec::{Codec, JsonCodec};
pub use config::{resolve_cache_root, GroupConfig, CACHE_DIR_ENV};
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use group::{GroupBuilder, MemoGroup};
pub use index::{CacheIndex, EntryMeta, Ttl};
pub use key::{compute_key, CacheKey, Captures, FunctionVersion, KeyEnvelope, SystemState};
pub use memoized::{Memoized, MemoizedBuilder};
pub use policy::{GreedyDualSize, PolicyKey};
pub use stats::GroupStats;

pub use keepsake_store::{DirStore, FileRwLock, LocalRwLock, MemoryStore, ObjStore, SharedLock};
