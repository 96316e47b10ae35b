//! In-process object store
//!
//! Backs a group that disables persistence and is handy in tests. Contents
//! live for the lifetime of the process.

use crate::{is_valid_key, is_valid_part, Error, ObjStore, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Object store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check(key: &str, part: &str) -> Result<()> {
        if !is_valid_key(key) {
            return Err(Error::validation(format!("malformed store key {key:?}")));
        }
        if !is_valid_part(part) {
            return Err(Error::validation(format!("malformed part name {part:?}")));
        }
        Ok(())
    }
}

impl ObjStore for MemoryStore {
    fn put(&self, key: &str, part: &str, data: &[u8]) -> Result<()> {
        Self::check(key, part)?;
        self.data
            .write()
            .entry(key.to_string())
            .or_default()
            .insert(part.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &str, part: &str) -> Result<Option<Vec<u8>>> {
        Self::check(key, part)?;
        Ok(self
            .data
            .read()
            .get(key)
            .and_then(|parts| parts.get(part))
            .cloned())
    }

    fn delete(&self, key: &str, part: &str) -> Result<()> {
        Self::check(key, part)?;
        let mut data = self.data.write();
        if let Some(parts) = data.get_mut(key) {
            parts.remove(part);
            if parts.is_empty() {
                data.remove(key);
            }
        }
        Ok(())
    }

    fn delete_key(&self, key: &str) -> Result<()> {
        if !is_valid_key(key) {
            return Err(Error::validation(format!("malformed store key {key:?}")));
        }
        self.data.write().remove(key);
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.data.read().keys().cloned().collect())
    }

    fn list_parts(&self, key: &str) -> Result<Vec<String>> {
        if !is_valid_key(key) {
            return Err(Error::validation(format!("malformed store key {key:?}")));
        }
        Ok(self
            .data
            .read()
            .get(key)
            .map(|parts| parts.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn part_size(&self, key: &str, part: &str) -> Result<Option<u64>> {
        Self::check(key, part)?;
        Ok(self
            .data
            .read()
            .get(key)
            .and_then(|parts| parts.get(part))
            .map(|data| data.len() as u64))
    }

    fn clear(&self) -> Result<()> {
        self.data.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> String {
        format!("{:02x}", n).repeat(32)
    }

    #[test]
    fn test_roundtrip_and_listing() {
        let store = MemoryStore::new();
        let k = key(1);
        store.put(&k, "value", b"a").unwrap();
        store.put(&k, "meta", b"m").unwrap();

        assert_eq!(store.get(&k, "value").unwrap().unwrap(), b"a");
        assert_eq!(store.list_parts(&k).unwrap(), vec!["meta", "value"]);
        assert_eq!(store.part_size(&k, "meta").unwrap(), Some(1));

        store.delete(&k, "meta").unwrap();
        store.delete(&k, "value").unwrap();
        assert!(store.list_keys().unwrap().is_empty());
    }

    #[test]
    fn test_clear() {
        let store = MemoryStore::new();
        store.put(&key(1), "value", b"a").unwrap();
        store.clear().unwrap();
        assert!(store.list_keys().unwrap().is_empty());
    }
}
