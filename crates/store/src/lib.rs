//! Object store backends and read-write locks for keepsake
//!
//! This crate provides the storage infrastructure for the keepsake
//! memoization engine:
//! - The [`ObjStore`] capability trait: a persistent mapping from a top-level
//!   key to named sub-key payloads
//! - [`DirStore`]: the default directory-tree backend with atomic,
//!   sub-key-granular writes
//! - [`MemoryStore`]: an in-process backend for memory-only caching and tests
//! - [`SharedLock`]: scoped readers-writer locking, in a process-local and a
//!   cross-process (file-based) variant
//!
//! # Address space
//!
//! Keys are lowercase hex fingerprints (64 characters). Each key owns a set
//! of named parts (sub-keys), so listing, partial deletion, and size
//! accounting are all sub-key-granular. A reader never observes a partially
//! written part: backends must make part writes atomic.

mod dir;
mod error;
mod lock;
mod memory;

pub use dir::DirStore;
pub use error::{Error, Result};
pub use lock::{FileRwLock, LocalRwLock, SharedGuard, SharedLock};
pub use memory::MemoryStore;

/// Number of hex characters in a store key.
pub const KEY_LEN: usize = 64;

/// Returns true if `key` is a well-formed store key (64 lowercase hex chars).
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    key.len() == KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Returns true if `part` is a well-formed sub-key name.
///
/// Part names must be non-empty, consist of ASCII alphanumerics plus
/// `-`, `_`, and `.`, must not start with a dot, and must not end in `.tmp`
/// (reserved for in-flight writes).
#[must_use]
pub fn is_valid_part(part: &str) -> bool {
    !part.is_empty()
        && !part.starts_with('.')
        && !part.ends_with(".tmp")
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// An object store is a durable mapping from `(key, part)` to bytes.
///
/// Implementations must tolerate concurrent access from multiple processes:
/// a `put` is atomic at part granularity, and `get` returns either a fully
/// written value or `None`. All I/O failures surface as [`Error::Io`], never
/// silently.
pub trait ObjStore: Send + Sync + std::fmt::Debug {
    /// Store `data` under `(key, part)`, replacing any previous value.
    fn put(&self, key: &str, part: &str, data: &[u8]) -> Result<()>;

    /// Fetch the bytes stored under `(key, part)`, or `None` if absent.
    fn get(&self, key: &str, part: &str) -> Result<Option<Vec<u8>>>;

    /// Remove the value under `(key, part)`. Removing an absent part is not
    /// an error.
    fn delete(&self, key: &str, part: &str) -> Result<()>;

    /// Remove the key and all of its parts.
    fn delete_key(&self, key: &str) -> Result<()>;

    /// List all top-level keys currently present.
    fn list_keys(&self) -> Result<Vec<String>>;

    /// List the parts present under `key`, sorted by name.
    fn list_parts(&self, key: &str) -> Result<Vec<String>>;

    /// Size in bytes of the value under `(key, part)`, without reading it.
    fn part_size(&self, key: &str, part: &str) -> Result<Option<u64>>;

    /// Remove all contents. This is the only full-reset operation.
    fn clear(&self) -> Result<()>;
}
