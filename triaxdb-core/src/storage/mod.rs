//! Storage layer abstraction.
//!
//! The engine talks to durable storage exclusively through the
//! [`StorageAdapter`] contract: a key/blob interface that memory, local
//! disk, and object-store backends all implement with the same semantics.
//! Keys are printable ASCII, `/`-delimited; the adapter must be crash-safe
//! at single-key granularity, and multi-key atomicity is never assumed.
//!
//! Transport-level failures are retried with exponential backoff inside
//! [`RetryAdapter`]; exhausted retries surface as
//! [`StorageUnavailable`](crate::error::ErrorKind::StorageUnavailable).

pub mod frame;
pub mod fs;
pub mod memory;
pub mod records;

pub use fs::FsAdapter;
pub use memory::MemoryAdapter;

use std::time::Duration;

use rand::Rng;

use crate::error::Result;

/// One page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// Keys in ascending order.
    pub keys: Vec<String>,
    /// Opaque cursor for the next page, absent on the last page.
    pub next_cursor: Option<String>,
}

/// Key/blob contract shared by every backend.
///
/// Implementations must be `Send + Sync`; the engine serializes access
/// where ordering matters and otherwise calls concurrently.
pub trait StorageAdapter: Send + Sync {
    /// Reads a value. `Ok(None)` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes a value, replacing any existing one.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Removes a key. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Returns true if the key is present.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Lists keys under a prefix in ascending order, one page at a time.
    ///
    /// Pass the previous page's `next_cursor` to continue.
    fn list_prefix(&self, prefix: &str, cursor: Option<&str>) -> Result<Listing>;

    /// Writes several values. Atomicity is per key only.
    fn batch_put(&self, items: &[(String, Vec<u8>)]) -> Result<()> {
        for (key, bytes) in items {
            self.put(key, bytes)?;
        }
        Ok(())
    }
}

impl<A: StorageAdapter + ?Sized> StorageAdapter for std::sync::Arc<A> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        (**self).put(key, bytes)
    }
    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key)
    }
    fn list_prefix(&self, prefix: &str, cursor: Option<&str>) -> Result<Listing> {
        (**self).list_prefix(prefix, cursor)
    }
    fn batch_put(&self, items: &[(String, Vec<u8>)]) -> Result<()> {
        (**self).batch_put(items)
    }
}

/// Page size used by the built-in adapters.
pub(crate) const LIST_PAGE_SIZE: usize = 1024;

/// Key layout helpers.
///
/// Layout (prefixes, not exhaustive):
///
/// ```text
/// nouns/<type>/<id>            noun record
/// verbs/<id>                   verb record
/// hnsw/<type>/partition-<n>    serialized vector partition
/// meta/<field>/chunk-<n>       metadata index chunk
/// graph/out/<sourceId>         adjacency block (outgoing)
/// graph/in/<targetId>          adjacency block (incoming)
/// commit/<txId>                commit log entry
/// store/meta                   store manifest
/// ```
pub mod keys {
    use crate::types::{NounId, NounType, VerbId};

    /// Prefix of all verb records; the graph rebuild enumerates this.
    pub const VERBS_PREFIX: &str = "verbs/";
    /// Prefix of all noun records.
    pub const NOUNS_PREFIX: &str = "nouns/";
    /// The store manifest key.
    pub const STORE_META: &str = "store/meta";

    /// Escapes a key segment: `/`, `%`, and non-graphic bytes are
    /// percent-encoded so arbitrary field names and ids stay within the
    /// printable-ASCII `/`-delimited key grammar.
    pub fn escape(segment: &str) -> String {
        let mut out = String::with_capacity(segment.len());
        for b in segment.bytes() {
            if b.is_ascii_graphic() && b != b'/' && b != b'%' {
                out.push(b as char);
            } else {
                out.push('%');
                out.push_str(&format!("{b:02X}"));
            }
        }
        out
    }

    /// Reverses [`escape`]. `None` on malformed percent sequences.
    pub fn unescape(segment: &str) -> Option<String> {
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

    pub fn noun(noun_type: &NounType, id: &NounId) -> String {
        format!("nouns/{}/{}", escape(noun_type.as_str()), escape(id.as_str()))
    }

    pub fn noun_type_prefix(noun_type: &NounType) -> String {
        format!("nouns/{}/", escape(noun_type.as_str()))
    }

    pub fn verb(id: &VerbId) -> String {
        format!("verbs/{}", escape(id.as_str()))
    }

    pub fn hnsw_partition(noun_type: &NounType, n: u32) -> String {
        format!("hnsw/{}/partition-{n}", escape(noun_type.as_str()))
    }

    pub fn meta_chunk(field: &str, n: u32) -> String {
        format!("meta/{}/chunk-{n}", escape(field))
    }

    pub fn meta_field_prefix(field: &str) -> String {
        format!("meta/{}/", escape(field))
    }

    pub fn graph_out(id: &NounId) -> String {
        format!("graph/out/{}", escape(id.as_str()))
    }

    pub fn graph_in(id: &NounId) -> String {
        format!("graph/in/{}", escape(id.as_str()))
    }

    pub fn commit(tx_id: &str) -> String {
        format!("commit/{}", escape(tx_id))
    }
}

/// Decorator adding exponential-backoff retries to a backend.
///
/// Only retriable errors (transport failures, transient conflicts) are
/// retried: base delay 100 ms, factor 2, jitter ±20%, at most 5 attempts.
/// Cancellation is never retried here because adapters do not observe
/// tokens; callers check their token at suspension points.
pub struct RetryAdapter<A> {
    inner: A,
    max_attempts: u32,
    base_delay: Duration,
}

impl<A: StorageAdapter> RetryAdapter<A> {
    /// Wraps an adapter with the default retry policy.
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }

    /// Returns the wrapped adapter.
    pub fn into_inner(self) -> A {
        self.inner
    }

    fn run<T>(&self, op: &str, f: impl Fn() -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt + 1 < self.max_attempts => {
                    let backoff = self.base_delay * 2u32.saturating_pow(attempt);
                    let jittered = jitter(backoff);
                    tracing::warn!(
                        op,
                        attempt = attempt + 1,
                        delay_ms = jittered.as_millis() as u64,
                        error = %err,
                        "storage operation failed, retrying"
                    );
                    std::thread::sleep(jittered);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(factor)
}

impl<A: StorageAdapter> StorageAdapter for RetryAdapter<A> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.run("get", || self.inner.get(key))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.run("put", || self.inner.put(key, bytes))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.run("delete", || self.inner.delete(key))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.run("exists", || self.inner.exists(key))
    }

    fn list_prefix(&self, prefix: &str, cursor: Option<&str>) -> Result<Listing> {
        self.run("list_prefix", || self.inner.list_prefix(prefix, cursor))
    }

    fn batch_put(&self, items: &[(String, Vec<u8>)]) -> Result<()> {
        self.run("batch_put", || self.inner.batch_put(items))
    }
}
