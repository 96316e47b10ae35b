//! Directory-tree object store
//!
//! Maps the store address space onto a directory tree using a two-level
//! fan-out to avoid filesystem limitations with large flat directories:
//!
//! ```text
//! <root>/
//!   ab/
//!     cd/
//!       abcdef123456.../   (one directory per key)
//!         value            (one file per part)
//!         meta
//! ```
//!
//! Part writes go to a temporary sibling and are atomically renamed into
//! place, so a concurrent reader sees either the old value, the new value,
//! or nothing, but never a torn write.

use crate::{is_valid_key, is_valid_part, Error, ObjStore, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Distinguishes in-flight temp files written by this process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Object store backed by a directory per key and a file per part.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open (or create) a directory store at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created, or if it exists and
    /// contains entries that are not store-shaped (guards against pointing
    /// the store at a directory it does not own).
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.exists() {
            for entry in fs::read_dir(&root).map_err(|e| Error::io(e, &root, "read_dir"))? {
                let entry = entry.map_err(|e| Error::io(e, &root, "read_dir_entry"))?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') {
                    continue;
                }
                let fanout = name.len() == 2
                    && name
                        .chars()
                        .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
                if !fanout || !entry.path().is_dir() {
                    return Err(Error::validation(format!(
                        "{} contains foreign entry {name:?}; refusing to use it as a store root",
                        root.display()
                    )));
                }
            }
        } else {
            fs::create_dir_all(&root).map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        }
        Ok(Self { root })
    }

    /// The root directory of this store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &str) -> Result<PathBuf> {
        if !is_valid_key(key) {
            return Err(Error::validation(format!("malformed store key {key:?}")));
        }
        Ok(self.root.join(&key[0..2]).join(&key[2..4]).join(key))
    }

    fn part_path(&self, key: &str, part: &str) -> Result<PathBuf> {
        if !is_valid_part(part) {
            return Err(Error::validation(format!("malformed part name {part:?}")));
        }
        Ok(self.key_dir(key)?.join(part))
    }
}

impl ObjStore for DirStore {
    fn put(&self, key: &str, part: &str, data: &[u8]) -> Result<()> {
        let path = self.part_path(key, part)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }

        // Write to a temporary sibling, then atomically rename into place.
        // The temp name carries the full part name plus a per-writer suffix:
        // part names may contain dots, so `with_extension` would map sibling
        // parts like `f-a.x` and `f-a.y` onto one temp path and let
        // concurrent writers install each other's bytes.
        let tmp_path = path.with_file_name(format!(
            "{part}.{}-{}.tmp",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let mut file =
            fs::File::create(&tmp_path).map_err(|e| Error::io(e, &tmp_path, "create"))?;
        file.write_all(data)
            .map_err(|e| Error::io(e, &tmp_path, "write"))?;
        file.sync_all()
            .map_err(|e| Error::io(e, &tmp_path, "sync"))?;
        drop(file);
        fs::rename(&tmp_path, &path).map_err(|e| Error::io(e, &path, "rename"))?;

        tracing::debug!(key = %key, part = %part, bytes = data.len(), "stored part");
        Ok(())
    }

    fn get(&self, key: &str, part: &str) -> Result<Option<Vec<u8>>> {
        let path = self.part_path(key, part)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, &path, "read")),
        }
    }

    fn delete(&self, key: &str, part: &str) -> Result<()> {
        let path = self.part_path(key, part)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &path, "remove_file")),
        }
    }

    fn delete_key(&self, key: &str) -> Result<()> {
        let dir = self.key_dir(key)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &dir, "remove_dir_all")),
        }
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if !self.root.exists() {
            return Ok(keys);
        }

        for entry1 in fs::read_dir(&self.root).map_err(|e| Error::io(e, &self.root, "read_dir"))? {
            let path1 = entry1
                .map_err(|e| Error::io(e, &self.root, "read_dir_entry"))?
                .path();
            if !path1.is_dir() {
                continue;
            }
            for entry2 in fs::read_dir(&path1).map_err(|e| Error::io(e, &path1, "read_dir"))? {
                let path2 = entry2
                    .map_err(|e| Error::io(e, &path1, "read_dir_entry"))?
                    .path();
                if !path2.is_dir() {
                    continue;
                }
                for entry3 in fs::read_dir(&path2).map_err(|e| Error::io(e, &path2, "read_dir"))? {
                    let entry3 = entry3.map_err(|e| Error::io(e, &path2, "read_dir_entry"))?;
                    if let Some(name) = entry3.file_name().to_str() {
                        if is_valid_key(name) && entry3.path().is_dir() {
                            keys.push(name.to_string());
                        }
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn list_parts(&self, key: &str) -> Result<Vec<String>> {
        let dir = self.key_dir(key)?;
        let mut parts = Vec::new();
        let iter = match fs::read_dir(&dir) {
            Ok(iter) => iter,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(parts),
            Err(e) => return Err(Error::io(e, &dir, "read_dir")),
        };
        for entry in iter {
            let entry = entry.map_err(|e| Error::io(e, &dir, "read_dir_entry"))?;
            if let Some(name) = entry.file_name().to_str() {
                if is_valid_part(name) && entry.path().is_file() {
                    parts.push(name.to_string());
                }
            }
        }
        parts.sort();
        Ok(parts)
    }

    fn part_size(&self, key: &str, part: &str) -> Result<Option<u64>> {
        let path = self.part_path(key, part)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, &path, "metadata")),
        }
    }

    fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)
                .map_err(|e| Error::io(e, &self.root, "remove_dir_all"))?;
        }
        fs::create_dir_all(&self.root).map_err(|e| Error::io(e, &self.root, "create_dir_all"))?;
        tracing::debug!(root = %self.root.display(), "cleared store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(n: u8) -> String {
        format!("{:02x}", n).repeat(32)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();

        let k = key(0xab);
        store.put(&k, "value", b"payload").unwrap();
        assert_eq!(store.get(&k, "value").unwrap().unwrap(), b"payload");
        assert_eq!(store.get(&k, "missing").unwrap(), None);
    }

    #[test]
    fn test_two_level_fanout_layout() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();

        let k = key(0xab);
        store.put(&k, "value", b"x").unwrap();
        let expected = tmp.path().join("ab").join("ab").join(&k).join("value");
        assert!(expected.exists());
    }

    #[test]
    fn test_put_replaces_existing() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();

        let k = key(1);
        store.put(&k, "value", b"old").unwrap();
        store.put(&k, "value", b"new").unwrap();
        assert_eq!(store.get(&k, "value").unwrap().unwrap(), b"new");
    }

    #[test]
    fn test_no_tmp_residue_after_put() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();

        let k = key(2);
        store.put(&k, "value", b"x").unwrap();
        let key_dir = tmp.path().join(&k[0..2]).join(&k[2..4]).join(&k);
        let names: Vec<_> = fs::read_dir(&key_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["value"]);
    }

    #[test]
    fn test_dotted_sibling_parts_keep_their_own_bytes() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();

        let k = key(8);
        store.put(&k, "f-a.x", b"alpha").unwrap();
        store.put(&k, "f-a.y", b"beta").unwrap();

        assert_eq!(store.get(&k, "f-a.x").unwrap().unwrap(), b"alpha");
        assert_eq!(store.get(&k, "f-a.y").unwrap().unwrap(), b"beta");
        assert_eq!(store.list_parts(&k).unwrap(), vec!["f-a.x", "f-a.y"]);
    }

    #[test]
    fn test_concurrent_writers_to_dotted_siblings() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();
        let k = key(9);

        // Each writer's temp path is unique, so racing puts of sibling
        // parts never rename each other's bytes into place.
        std::thread::scope(|s| {
            for (part, payload) in [("f-a.x", b"x".as_slice()), ("f-a.y", b"y".as_slice())] {
                let store = &store;
                let k = &k;
                s.spawn(move || {
                    for _ in 0..200 {
                        store.put(k, part, payload).unwrap();
                    }
                });
            }
        });

        assert_eq!(store.get(&k, "f-a.x").unwrap().unwrap(), b"x");
        assert_eq!(store.get(&k, "f-a.y").unwrap().unwrap(), b"y");
    }

    #[test]
    fn test_list_keys_and_parts() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();

        let k1 = key(0x11);
        let k2 = key(0x22);
        store.put(&k1, "value", b"a").unwrap();
        store.put(&k1, "meta", b"m").unwrap();
        store.put(&k2, "value", b"b").unwrap();

        let mut expected = vec![k1.clone(), k2];
        expected.sort();
        assert_eq!(store.list_keys().unwrap(), expected);
        assert_eq!(store.list_parts(&k1).unwrap(), vec!["meta", "value"]);
    }

    #[test]
    fn test_delete_part_and_key() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();

        let k = key(3);
        store.put(&k, "value", b"a").unwrap();
        store.put(&k, "meta", b"m").unwrap();

        store.delete(&k, "value").unwrap();
        assert_eq!(store.get(&k, "value").unwrap(), None);
        assert_eq!(store.list_parts(&k).unwrap(), vec!["meta"]);

        store.delete_key(&k).unwrap();
        assert!(store.list_parts(&k).unwrap().is_empty());
        assert!(store.list_keys().unwrap().is_empty());

        // Deleting absent things is not an error.
        store.delete(&k, "value").unwrap();
        store.delete_key(&k).unwrap();
    }

    #[test]
    fn test_part_size_without_read() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();

        let k = key(4);
        store.put(&k, "value", b"12345").unwrap();
        assert_eq!(store.part_size(&k, "value").unwrap(), Some(5));
        assert_eq!(store.part_size(&k, "other").unwrap(), None);
    }

    #[test]
    fn test_clear_resets_everything() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();

        store.put(&key(5), "value", b"a").unwrap();
        store.put(&key(6), "value", b"b").unwrap();
        store.clear().unwrap();
        assert!(store.list_keys().unwrap().is_empty());
        assert!(tmp.path().exists());
    }

    #[test]
    fn test_open_rejects_foreign_directory() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("notes.txt"), b"junk").unwrap();
        assert!(DirStore::open(tmp.path()).is_err());
    }

    #[test]
    fn test_open_accepts_own_layout() {
        let tmp = TempDir::new().unwrap();
        {
            let store = DirStore::open(tmp.path()).unwrap();
            store.put(&key(7), "value", b"a").unwrap();
        }
        let store = DirStore::open(tmp.path()).unwrap();
        assert_eq!(store.list_keys().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_key_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = DirStore::open(tmp.path()).unwrap();
        assert!(store.put("../escape", "value", b"x").is_err());
        assert!(store.get("short", "value").is_err());
    }
}
