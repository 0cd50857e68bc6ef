//! In-memory storage adapter.
//!
//! Backs short-lived clients and tests. An ordered map keeps prefix scans
//! cheap and gives listings the same ascending-key order as the disk and
//! object-store backends.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::error::Result;
use crate::storage::{Listing, StorageAdapter, LIST_PAGE_SIZE};

/// A storage adapter holding everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryAdapter {
    /// Creates an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl StorageAdapter for MemoryAdapter {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.data.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.read().contains_key(key))
    }

    fn list_prefix(&self, prefix: &str, cursor: Option<&str>) -> Result<Listing> {
        let data = self.data.read();
        let start = match cursor {
            Some(c) => Bound::Excluded(c.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let mut keys = Vec::new();
        let mut next_cursor = None;
        for key in data
            .range::<String, _>((start, Bound::Unbounded))
            .map(|(k, _)| k)
        {
            if !key.starts_with(prefix) {
                break;
            }
            if keys.len() == LIST_PAGE_SIZE {
                next_cursor = keys.last().cloned();
                break;
            }
            keys.push(key.clone());
        }

        Ok(Listing { keys, next_cursor })
    }

    fn batch_put(&self, items: &[(String, Vec<u8>)]) -> Result<()> {
        let mut data = self.data.write();
        for (key, bytes) in items {
            data.insert(key.clone(), bytes.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let adapter = MemoryAdapter::new();
        adapter.put("a/b", b"one").unwrap();
        assert_eq!(adapter.get("a/b").unwrap(), Some(b"one".to_vec()));
        assert!(adapter.exists("a/b").unwrap());

        adapter.delete("a/b").unwrap();
        assert_eq!(adapter.get("a/b").unwrap(), None);
        assert!(!adapter.exists("a/b").unwrap());

        // Deleting an absent key is fine
        adapter.delete("a/b").unwrap();
    }

    #[test]
    fn test_put_overwrites() {
        let adapter = MemoryAdapter::new();
        adapter.put("k", b"one").unwrap();
        adapter.put("k", b"two").unwrap();
        assert_eq!(adapter.get("k").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn test_list_prefix_ordered() {
        let adapter = MemoryAdapter::new();
        adapter.put("verbs/c", b"3").unwrap();
        adapter.put("verbs/a", b"1").unwrap();
        adapter.put("verbs/b", b"2").unwrap();
        adapter.put("nouns/x", b"0").unwrap();

        let listing = adapter.list_prefix("verbs/", None).unwrap();
        assert_eq!(listing.keys, vec!["verbs/a", "verbs/b", "verbs/c"]);
        assert!(listing.next_cursor.is_none());
    }

    #[test]
    fn test_list_prefix_pagination() {
        let adapter = MemoryAdapter::new();
        for i in 0..(LIST_PAGE_SIZE + 10) {
            adapter.put(&format!("p/{i:05}"), b"x").unwrap();
        }

        let first = adapter.list_prefix("p/", None).unwrap();
        assert_eq!(first.keys.len(), LIST_PAGE_SIZE);
        let cursor = first.next_cursor.clone().expect("expected another page");

        let second = adapter.list_prefix("p/", Some(&cursor)).unwrap();
        assert_eq!(second.keys.len(), 10);
        assert!(second.next_cursor.is_none());
        assert!(second.keys[0] > *first.keys.last().unwrap());
    }

    #[test]
    fn test_batch_put() {
        let adapter = MemoryAdapter::new();
        adapter
            .batch_put(&[
                ("a".to_string(), b"1".to_vec()),
                ("b".to_string(), b"2".to_vec()),
            ])
            .unwrap();
        assert_eq!(adapter.len(), 2);
    }
}
