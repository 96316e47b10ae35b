//! Group configuration and cache-root resolution
//!
//! The on-disk root is resolved from the first writable candidate: an
//! explicit path from the builder, the `KEEPSAKE_CACHE_DIR` environment
//! variable, then the platform cache directory. Writability is proven with
//! a probe file, not assumed, so a read-only candidate is skipped with a
//! debug log instead of failing the first `put`.

use crate::index::Ttl;
use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Environment variable overriding the on-disk cache root.
pub const CACHE_DIR_ENV: &str = "KEEPSAKE_CACHE_DIR";

const DEFAULT_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Tunables for one cache group, assembled by the group builder.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Eviction threshold in bytes across all value sub-entries
    pub capacity: u64,
    /// Persist entries to an on-disk store; false keeps everything in
    /// process memory and skips cross-process coordination entirely
    pub persistent: bool,
    /// Write one sub-entry per top-level field of JSON-object values
    pub fine_grain_persistence: bool,
    /// Let the policy evict individual sub-entries instead of whole entries
    pub fine_grain_eviction: bool,
    /// Coordinate with other processes through a file lock; false uses an
    /// in-process lock only
    pub shared_across_processes: bool,
    /// Explicit on-disk root, overriding the resolution chain
    pub root: Option<PathBuf>,
    /// Freshness bound applied to entries whose wrapper declares none
    pub default_ttl: Option<Ttl>,
    /// Treat un-fingerprintable arguments as a cache bypass instead of an
    /// error
    pub best_effort: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            persistent: true,
            fine_grain_persistence: false,
            fine_grain_eviction: false,
            shared_across_processes: true,
            root: None,
            default_ttl: None,
            best_effort: false,
        }
    }
}

/// Resolve the on-disk cache root from the candidate chain, proving
/// writability with a probe file.
pub fn resolve_cache_root(explicit: Option<&Path>) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    if let Some(env_root) = std::env::var_os(CACHE_DIR_ENV) {
        if !env_root.is_empty() {
            candidates.push(PathBuf::from(env_root));
        }
    }
    if let Some(base) = dirs::cache_dir() {
        candidates.push(base.join("keepsake"));
    }

    for candidate in &candidates {
        match probe_writable(candidate) {
            Ok(()) => {
                tracing::debug!(root = %candidate.display(), "resolved cache root");
                return Ok(candidate.clone());
            }
            Err(e) => {
                tracing::debug!(
                    candidate = %candidate.display(),
                    error = %e,
                    "skipping unwritable cache root candidate"
                );
            }
        }
    }

    Err(Error::configuration(
        "no writable cache root: set KEEPSAKE_CACHE_DIR or pass an explicit path",
    ))
}

fn probe_writable(root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(root)?;
    let probe = root.join(".keepsake-probe");
    std::fs::write(&probe, b"probe")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}
