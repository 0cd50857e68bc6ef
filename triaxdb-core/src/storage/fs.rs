//! Local-filesystem storage adapter.
//!
//! Keys map onto a directory tree under the adapter root: each
//! `/`-delimited segment becomes a path component, escaped so arbitrary
//! segment bytes stay filesystem-safe. Writes go through a temp file and a
//! rename, which keeps the single-key crash-safety promise of the
//! [`StorageAdapter`] contract on POSIX filesystems.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::storage::{Listing, StorageAdapter, LIST_PAGE_SIZE};

/// A storage adapter persisting every key as a file on local disk.
pub struct FsAdapter {
    root: PathBuf,
    // Serializes temp-file naming; writes themselves are atomic via rename.
    write_seq: Mutex<u64>,
}

impl FsAdapter {
    /// Opens an adapter rooted at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| Error::storage(format!("create root failed: {e}")))?;
        Ok(Self {
            root,
            write_seq: Mutex::new(0),
        })
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(escape_segment(segment));
        }
        path
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let mut segments = Vec::new();
        for component in rel.components() {
            let name = component.as_os_str().to_str()?;
            segments.push(unescape_segment(name)?);
        }
        Some(segments.join("/"))
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::storage(format!("read dir failed: {e}"))),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::storage(format!("read dir entry failed: {e}")))?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, out)?;
            } else if let Some(key) = self.key_for(&path) {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl StorageAdapter for FsAdapter {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(format!("read failed: {e}"))),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::storage(format!("create dir failed: {e}")))?;
        }

        let seq = {
            let mut guard = self.write_seq.lock();
            *guard += 1;
            *guard
        };
        let tmp = path.with_extension(format!("tmp.{}.{seq}", std::process::id()));

        let mut file =
            fs::File::create(&tmp).map_err(|e| Error::storage(format!("create failed: {e}")))?;
        file.write_all(bytes)
            .map_err(|e| Error::storage(format!("write failed: {e}")))?;
        file.sync_all()
            .map_err(|e| Error::storage(format!("sync failed: {e}")))?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::storage(format!("rename failed: {e}"))
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(format!("delete failed: {e}"))),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key).is_file())
    }

    fn list_prefix(&self, prefix: &str, cursor: Option<&str>) -> Result<Listing> {
        // Walk from the deepest directory fully covered by the prefix, then
        // filter; prefixes usually end at a segment boundary so the walk is
        // tight.
        let dir_part = match prefix.rfind('/') {
            Some(pos) => &prefix[..pos],
            None => "",
        };
        let mut dir = self.root.clone();
        for segment in dir_part.split('/').filter(|s| !s.is_empty()) {
            dir.push(escape_segment(segment));
        }

        let mut all = Vec::new();
        self.collect_keys(&dir, &mut all)?;
        all.retain(|k| k.starts_with(prefix));
        all.sort();

        let start = match cursor {
            Some(c) => match all.binary_search(&c.to_string()) {
                Ok(pos) => pos + 1,
                Err(pos) => pos,
            },
            None => 0,
        };

        let end = (start + LIST_PAGE_SIZE).min(all.len());
        let keys: Vec<String> = all[start..end].to_vec();
        let next_cursor = if end < all.len() {
            keys.last().cloned()
        } else {
            None
        };

        Ok(Listing { keys, next_cursor })
    }
}

/// Escapes a key segment into a filesystem-safe file name.
fn escape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(b as char),
            _ => {
                out.push('%');
                out.push_str(&format!("{b:02X}"));
            }
        }
    }
    out
}

fn unescape_segment(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = segment.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        for segment in ["plain", "has space", "a%b", "ünïcode", "partition-0"] {
            let escaped = escape_segment(segment);
            assert!(escaped.bytes().all(|b| b.is_ascii_graphic()));
            assert_eq!(unescape_segment(&escaped).unwrap(), segment);
        }
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FsAdapter::open(dir.path()).unwrap();

        adapter.put("nouns/Concept/n1", b"payload").unwrap();
        assert_eq!(
            adapter.get("nouns/Concept/n1").unwrap(),
            Some(b"payload".to_vec())
        );
        assert!(adapter.exists("nouns/Concept/n1").unwrap());
        assert_eq!(adapter.get("nouns/Concept/n2").unwrap(), None);
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FsAdapter::open(dir.path()).unwrap();

        adapter.put("verbs/v1", b"x").unwrap();
        adapter.delete("verbs/v1").unwrap();
        assert!(!adapter.exists("verbs/v1").unwrap());
        adapter.delete("verbs/v1").unwrap();
    }

    #[test]
    fn test_list_prefix_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FsAdapter::open(dir.path()).unwrap();

        adapter.put("verbs/b", b"2").unwrap();
        adapter.put("verbs/a", b"1").unwrap();
        adapter.put("nouns/Concept/x", b"0").unwrap();

        let listing = adapter.list_prefix("verbs/", None).unwrap();
        assert_eq!(listing.keys, vec!["verbs/a", "verbs/b"]);

        let listing = adapter.list_prefix("nouns/", None).unwrap();
        assert_eq!(listing.keys, vec!["nouns/Concept/x"]);
    }

    #[test]
    fn test_reopen_sees_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let adapter = FsAdapter::open(dir.path()).unwrap();
            adapter.put("store/meta", b"manifest").unwrap();
        }
        let adapter = FsAdapter::open(dir.path()).unwrap();
        assert_eq!(adapter.get("store/meta").unwrap(), Some(b"manifest".to_vec()));
    }
}
