//! Readers-writer locks
//!
//! A [`SharedLock`] guarantees N readers xor 1 writer over the shared cache
//! state. Two variants are provided:
//!
//! - [`LocalRwLock`]: in-process, built on `parking_lot::RwLock` (which
//!   blocks new readers once a writer is waiting, so a stream of readers
//!   cannot starve a writer)
//! - [`FileRwLock`]: cross-process, built on an advisory lock over a
//!   well-known lock file, so independent processes sharing one store
//!   serialize correctly
//!
//! Guards release on drop, on every exit path including unwinding. A lock
//! whose underlying primitive is unavailable fails with [`Error::Lock`]
//! rather than silently proceeding unsynchronized.

use crate::{Error, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Scoped acquisition of shared (reader) or exclusive (writer) access.
pub trait SharedLock: Send + Sync + std::fmt::Debug {
    /// Acquire shared read access; blocks while a writer holds the lock.
    fn reader(&self) -> Result<SharedGuard<'_>>;

    /// Acquire exclusive write access; blocks until no readers or writers
    /// hold the lock.
    fn writer(&self) -> Result<SharedGuard<'_>>;
}

/// RAII guard returned by [`SharedLock`]; the lock is released on drop.
pub struct SharedGuard<'a>(GuardInner<'a>);

enum GuardInner<'a> {
    LocalRead(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    LocalWrite(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
    File(#[allow(dead_code)] FileGuard),
}

struct FileGuard {
    file: File,
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        // Closing the descriptor releases the advisory lock anyway; the
        // explicit unlock just releases it promptly.
        let _ = fs4::fs_std::FileExt::unlock(&self.file);
    }
}

/// Process-local readers-writer lock.
#[derive(Debug, Default)]
pub struct LocalRwLock {
    inner: RwLock<()>,
}

impl LocalRwLock {
    /// Create an unlocked process-local lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedLock for LocalRwLock {
    fn reader(&self) -> Result<SharedGuard<'_>> {
        Ok(SharedGuard(GuardInner::LocalRead(self.inner.read())))
    }

    fn writer(&self) -> Result<SharedGuard<'_>> {
        Ok(SharedGuard(GuardInner::LocalWrite(self.inner.write())))
    }
}

/// Cross-process readers-writer lock over an advisory file lock.
#[derive(Debug)]
pub struct FileRwLock {
    path: PathBuf,
}

impl FileRwLock {
    /// Create a lock coordinated through the lock file at `path`.
    ///
    /// The file itself is created lazily on first acquisition; this only
    /// records the path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::lock(
                        format!("cannot create lock directory {}", parent.display()),
                        Some(e),
                    )
                })?;
            }
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                Error::lock(
                    format!("cannot open lock file {}", self.path.display()),
                    Some(e),
                )
            })
    }
}

impl SharedLock for FileRwLock {
    fn reader(&self) -> Result<SharedGuard<'_>> {
        let file = self.open()?;
        fs4::fs_std::FileExt::lock_shared(&file).map_err(|e| {
            Error::lock(
                format!("shared lock on {} failed", self.path.display()),
                Some(e),
            )
        })?;
        Ok(SharedGuard(GuardInner::File(FileGuard { file })))
    }

    fn writer(&self) -> Result<SharedGuard<'_>> {
        let file = self.open()?;
        fs4::fs_std::FileExt::lock_exclusive(&file).map_err(|e| {
            Error::lock(
                format!("exclusive lock on {} failed", self.path.display()),
                Some(e),
            )
        })?;
        Ok(SharedGuard(GuardInner::File(FileGuard { file })))
    }
}
