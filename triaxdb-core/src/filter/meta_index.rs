//! Bitmap-backed metadata index.
//!
//! Every indexed field keeps, per 65,536-id chunk, a sorted run of
//! `(value, bitmap)` pairs (range queries scan it; the chunk's min/max
//! bound gives skip-scan), a hash lookup into the run (equality), and a
//! `present` bitmap (exists). Chunks persist individually under
//! `meta/<field>/chunk-<n>`, load on demand, and pin in an LRU cache with a
//! configured byte budget.
//!
//! Readers capture an `Arc` snapshot of the top-level state and evaluate
//! without holding any lock; writers copy-on-write the path they touch and
//! swap the root pointer, so a query started before a commit keeps seeing
//! the pre-commit state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;

use crate::config::MetaIndexConfig;
use crate::error::{Error, Result};
use crate::filter::{field_keys, Filter, FilterCondition, ValueKey};
use crate::metadata::Metadata;
use crate::storage::{frame, keys, StorageAdapter};
use crate::types::DocId;

/// Metadata index over all nouns in a store.
pub struct MetadataIndex {
    chunk_size: u32,
    cache_budget: usize,
    state: RwLock<Arc<MetaState>>,
    // Serializes writers per field; readers never take these.
    field_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    // (field, chunk) pairs modified since the last flush.
    dirty: Mutex<HashSet<(String, u32)>>,
    loaded_fields: Mutex<HashSet<String>>,
    cache: Mutex<ChunkCache>,
}

#[derive(Debug, Default, Clone)]
struct MetaState {
    fields: HashMap<String, Arc<FieldState>>,
    /// Every live doc id, maintained by the store across inserts/deletes;
    /// `NOT` and `ne` complements are taken against this universe.
    all: Arc<RoaringBitmap>,
}

#[derive(Debug, Default, Clone)]
struct FieldState {
    chunks: BTreeMap<u32, Arc<FieldChunk>>,
}

#[derive(Debug, Default, Clone)]
struct FieldChunk {
    /// Sorted run of distinct values with their postings.
    entries: Vec<(ValueKey, RoaringBitmap)>,
    /// Equality lookup into `entries`.
    lookup: HashMap<ValueKey, usize>,
    /// Docs in this chunk's id range that carry the field at all.
    present: RoaringBitmap,
}

impl FieldChunk {
    fn min_max(&self) -> Option<(&ValueKey, &ValueKey)> {
        match (self.entries.first(), self.entries.last()) {
            (Some((min, _)), Some((max, _))) => Some((min, max)),
            _ => None,
        }
    }

    fn insert(&mut self, key: ValueKey, doc: DocId) {
        self.present.insert(doc);
        match self.lookup.get(&key) {
            Some(&pos) => {
                self.entries[pos].1.insert(doc);
            }
            None => {
                let pos = self
                    .entries
                    .binary_search_by(|(k, _)| k.cmp(&key))
                    .unwrap_err();
                let mut bitmap = RoaringBitmap::new();
                bitmap.insert(doc);
                self.entries.insert(pos, (key.clone(), bitmap));
                // Positions after the insertion point shifted by one.
                self.lookup.insert(key, pos);
                for (k, _) in &self.entries[pos + 1..] {
                    if let Some(slot) = self.lookup.get_mut(k) {
                        *slot += 1;
                    }
                }
            }
        }
    }

    fn remove(&mut self, key: &ValueKey, doc: DocId) {
        if let Some(&pos) = self.lookup.get(key) {
            self.entries[pos].1.remove(doc);
            if self.entries[pos].1.is_empty() {
                self.entries.remove(pos);
                self.lookup.remove(key);
                for (k, _) in &self.entries[pos..] {
                    if let Some(slot) = self.lookup.get_mut(k) {
                        *slot -= 1;
                    }
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.present.is_empty()
    }

    fn approx_bytes(&self) -> usize {
        let mut total = self.present.serialized_size();
        for (key, bitmap) in &self.entries {
            total += bitmap.serialized_size();
            total += match key {
                ValueKey::Str(s) => s.len() + 8,
                _ => 16,
            };
        }
        total
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.approx_bytes() + 16);
        write_bitmap(&mut out, &self.present)?;
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (key, bitmap) in &self.entries {
            write_key(&mut out, key);
            write_bitmap(&mut out, bitmap)?;
        }
        Ok(out)
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let present = read_bitmap(&mut cursor)?;
        let count = read_u32(&mut cursor)? as usize;
        let mut entries = Vec::with_capacity(count);
        let mut lookup = HashMap::with_capacity(count);
        for pos in 0..count {
            let key = read_key(&mut cursor)?;
            let bitmap = read_bitmap(&mut cursor)?;
            lookup.insert(key.clone(), pos);
            entries.push((key, bitmap));
        }
        // The run is persisted in order; verify so a corrupt block cannot
        // break binary search invariants silently.
        if entries.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(Error::corrupt("metadata chunk run out of order"));
        }
        Ok(Self {
            entries,
            lookup,
            present,
        })
    }
}

fn write_bitmap(out: &mut Vec<u8>, bitmap: &RoaringBitmap) -> Result<()> {
    let mut bytes = Vec::with_capacity(bitmap.serialized_size());
    bitmap
        .serialize_into(&mut bytes)
        .map_err(|e| Error::corrupt(format!("bitmap serialize failed: {e}")))?;
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&bytes);
    Ok(())
}

fn read_bitmap(cursor: &mut Cursor<&[u8]>) -> Result<RoaringBitmap> {
    let len = read_u32(cursor)? as usize;
    let start = cursor.position() as usize;
    let data = *cursor.get_ref();
    let end = start
        .checked_add(len)
        .filter(|e| *e <= data.len())
        .ok_or_else(|| Error::corrupt("metadata chunk truncated"))?;
    let bitmap = RoaringBitmap::deserialize_from(&data[start..end])
        .map_err(|e| Error::corrupt(format!("bitmap deserialize failed: {e}")))?;
    cursor.set_position(end as u64);
    Ok(bitmap)
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let start = cursor.position() as usize;
    let data = *cursor.get_ref();
    if start + 4 > data.len() {
        return Err(Error::corrupt("metadata chunk truncated"));
    }
    cursor.set_position((start + 4) as u64);
    Ok(u32::from_le_bytes(data[start..start + 4].try_into().unwrap()))
}

const KEY_TAG_BOOL: u8 = 0;
const KEY_TAG_NUM: u8 = 1;
const KEY_TAG_STR: u8 = 2;

fn write_key(out: &mut Vec<u8>, key: &ValueKey) {
    match key {
        ValueKey::Bool(b) => {
            out.push(KEY_TAG_BOOL);
            out.push(u8::from(*b));
        }
        ValueKey::Num(f) => {
            out.push(KEY_TAG_NUM);
            out.extend_from_slice(&f.to_le_bytes());
        }
        ValueKey::Str(s) => {
            out.push(KEY_TAG_STR);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
    }
}

fn read_key(cursor: &mut Cursor<&[u8]>) -> Result<ValueKey> {
    let start = cursor.position() as usize;
    let data = *cursor.get_ref();
    let tag = *data
        .get(start)
        .ok_or_else(|| Error::corrupt("metadata chunk truncated"))?;
    cursor.set_position((start + 1) as u64);
    match tag {
        KEY_TAG_BOOL => {
            let pos = cursor.position() as usize;
            let byte = *data
                .get(pos)
                .ok_or_else(|| Error::corrupt("metadata chunk truncated"))?;
            cursor.set_position((pos + 1) as u64);
            Ok(ValueKey::Bool(byte != 0))
        }
        KEY_TAG_NUM => {
            let pos = cursor.position() as usize;
            if pos + 8 > data.len() {
                return Err(Error::corrupt("metadata chunk truncated"));
            }
            cursor.set_position((pos + 8) as u64);
            Ok(ValueKey::Num(f64::from_le_bytes(
                data[pos..pos + 8].try_into().unwrap(),
            )))
        }
        KEY_TAG_STR => {
            let len = read_u32(cursor)? as usize;
            let pos = cursor.position() as usize;
            let end = pos
                .checked_add(len)
                .filter(|e| *e <= data.len())
                .ok_or_else(|| Error::corrupt("metadata chunk truncated"))?;
            let s = std::str::from_utf8(&data[pos..end])
                .map_err(|_| Error::corrupt("metadata chunk key not utf-8"))?;
            cursor.set_position(end as u64);
            Ok(ValueKey::Str(s.to_string()))
        }
        other => Err(Error::corrupt(format!(
            "unknown metadata key tag: {other}"
        ))),
    }
}

#[derive(Debug, Default)]
struct ChunkCache {
    entries: HashMap<(String, u32), CacheSlot>,
    total_bytes: usize,
    tick: u64,
}

#[derive(Debug)]
struct CacheSlot {
    bytes: usize,
    last_access: u64,
}

impl ChunkCache {
    fn touch(&mut self, field: &str, chunk: u32, bytes: usize) {
        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(&(field.to_string(), chunk)) {
            Some(slot) => {
                self.total_bytes = self.total_bytes - slot.bytes + bytes;
                slot.bytes = bytes;
                slot.last_access = tick;
            }
            None => {
                self.entries.insert(
                    (field.to_string(), chunk),
                    CacheSlot {
                        bytes,
                        last_access: tick,
                    },
                );
                self.total_bytes += bytes;
            }
        }
    }

    fn forget(&mut self, field: &str, chunk: u32) {
        if let Some(slot) = self.entries.remove(&(field.to_string(), chunk)) {
            self.total_bytes -= slot.bytes;
        }
    }

    /// Picks the least-recently-used entries to evict down to `budget`,
    /// skipping dirty chunks.
    fn eviction_victims(
        &self,
        budget: usize,
        dirty: &HashSet<(String, u32)>,
    ) -> Vec<(String, u32)> {
        if self.total_bytes <= budget {
            return Vec::new();
        }
        let mut candidates: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, _)| !dirty.contains(*key))
            .map(|(key, slot)| (slot.last_access, key.clone(), slot.bytes))
            .collect();
        candidates.sort_by_key(|(access, _, _)| *access);

        let mut excess = self.total_bytes.saturating_sub(budget);
        let mut victims = Vec::new();
        for (_, key, bytes) in candidates {
            if excess == 0 {
                break;
            }
            excess = excess.saturating_sub(bytes);
            victims.push(key);
        }
        victims
    }
}

impl MetadataIndex {
    /// Creates an empty index.
    pub fn new(config: &MetaIndexConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            cache_budget: config.cache_budget_bytes,
            state: RwLock::new(Arc::new(MetaState::default())),
            field_locks: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            loaded_fields: Mutex::new(HashSet::new()),
            cache: Mutex::new(ChunkCache::default()),
        }
    }

    fn chunk_of(&self, doc: DocId) -> u32 {
        doc / self.chunk_size
    }

    fn field_lock(&self, field: &str) -> Arc<Mutex<()>> {
        self.field_locks
            .lock()
            .entry(field.to_string())
            .or_default()
            .clone()
    }

    fn snapshot(&self) -> Arc<MetaState> {
        Arc::clone(&self.state.read())
    }

    /// Replaces the live-doc universe. Called by the store on open, after
    /// it has reconciled the id table with the noun records.
    pub fn set_universe(&self, docs: RoaringBitmap) {
        let mut root = self.state.write();
        let state = Arc::make_mut(&mut root);
        state.all = Arc::new(docs);
    }

    /// Number of live docs in the universe.
    pub fn universe_len(&self) -> u64 {
        self.snapshot().all.len()
    }

    /// Indexes a noun's metadata under its doc id.
    ///
    /// The store guarantees the touched fields are loaded (see
    /// [`ensure_loaded`](Self::ensure_loaded)) before calling this.
    pub fn insert(&self, doc: DocId, metadata: &Metadata) {
        let chunk_no = self.chunk_of(doc);
        let field_names: Vec<&String> = metadata.iter().map(|(k, _)| k).collect();
        // Per-field writer mutexes are taken in key order (BTreeMap
        // iteration), so concurrent writers cannot deadlock.
        let guards: Vec<_> = field_names.iter().map(|f| self.field_lock(f)).collect();
        let _held: Vec<_> = guards.iter().map(|g| g.lock()).collect();

        let mut root = self.state.write();
        let state = Arc::make_mut(&mut root);
        Arc::make_mut(&mut state.all).insert(doc);

        let mut dirty = self.dirty.lock();
        for (field, _) in metadata.iter() {
            let field_state = state
                .fields
                .entry(field.clone())
                .or_insert_with(|| Arc::new(FieldState::default()));
            let field_state = Arc::make_mut(field_state);
            let chunk = field_state
                .chunks
                .entry(chunk_no)
                .or_insert_with(|| Arc::new(FieldChunk::default()));
            let chunk = Arc::make_mut(chunk);
            // Presence holds even when the value yields no indexable keys
            // (an empty sequence still makes the field exist).
            chunk.present.insert(doc);
            for key in field_keys(metadata, field) {
                chunk.insert(key, doc);
            }
            dirty.insert((field.clone(), chunk_no));
        }
    }

    /// Removes a noun's metadata postings and clears it from the universe.
    pub fn remove(&self, doc: DocId, metadata: &Metadata) {
        let chunk_no = self.chunk_of(doc);
        let field_names: Vec<&String> = metadata.iter().map(|(k, _)| k).collect();
        let guards: Vec<_> = field_names.iter().map(|f| self.field_lock(f)).collect();
        let _held: Vec<_> = guards.iter().map(|g| g.lock()).collect();

        let mut root = self.state.write();
        let state = Arc::make_mut(&mut root);
        Arc::make_mut(&mut state.all).remove(doc);

        let mut dirty = self.dirty.lock();
        for (field, _) in metadata.iter() {
            let Some(field_state) = state.fields.get_mut(field) else {
                continue;
            };
            let field_state = Arc::make_mut(field_state);
            let Some(chunk) = field_state.chunks.get_mut(&chunk_no) else {
                continue;
            };
            let chunk = Arc::make_mut(chunk);
            for key in field_keys(metadata, field) {
                chunk.remove(&key, doc);
            }
            chunk.present.remove(doc);
            dirty.insert((field.clone(), chunk_no));
            if chunk.is_empty() {
                field_state.chunks.remove(&chunk_no);
            }
        }
    }

    /// Evaluates a filter, returning the matching doc ids.
    pub fn query(&self, filter: &Filter) -> RoaringBitmap {
        let snap = self.snapshot();
        eval(&snap, &filter.condition)
    }

    /// Exact-enough cardinality estimate used for plan selection and AND
    /// ordering; leaf estimates come straight from roaring lengths.
    pub fn estimate(&self, filter: &Filter) -> u64 {
        let snap = self.snapshot();
        estimate(&snap, &filter.condition)
    }

    /// Loads the persisted chunks of the given fields if they are not yet
    /// resident, charging them to the LRU cache and evicting clean chunks
    /// over budget.
    pub fn ensure_loaded(&self, fields: &[String], adapter: &dyn StorageAdapter) -> Result<()> {
        for field in fields {
            {
                let loaded = self.loaded_fields.lock();
                if loaded.contains(field) {
                    continue;
                }
            }
            let lock = self.field_lock(field);
            let _guard = lock.lock();
            // Re-check under the field lock.
            if self.loaded_fields.lock().contains(field) {
                continue;
            }
            self.load_field(field, adapter)?;
            self.loaded_fields.lock().insert(field.clone());
        }
        self.evict_over_budget();
        Ok(())
    }

    fn load_field(&self, field: &str, adapter: &dyn StorageAdapter) -> Result<()> {
        let prefix = keys::meta_field_prefix(field);
        let mut cursor: Option<String> = None;
        loop {
            let listing = adapter.list_prefix(&prefix, cursor.as_deref())?;
            for key in &listing.keys {
                let Some(chunk_no) = key
                    .rsplit("chunk-")
                    .next()
                    .and_then(|n| n.parse::<u32>().ok())
                else {
                    continue;
                };
                // A chunk already resident holds writes newer than the
                // persisted copy; never overwrite it.
                if self.chunk_resident(field, chunk_no) {
                    continue;
                }
                let Some(bytes) = adapter.get(key)? else {
                    continue;
                };
                let payload = frame::decode(&bytes, frame::META_CHUNK_V1)
                    .map_err(|e| Error::corrupt(format!("chunk {key}: {e}")))?;
                let chunk = FieldChunk::deserialize(payload)
                    .map_err(|e| Error::corrupt(format!("chunk {key}: {e}")))?;
                let bytes_used = chunk.approx_bytes();

                let mut root = self.state.write();
                let state = Arc::make_mut(&mut root);
                let field_state = state
                    .fields
                    .entry(field.to_string())
                    .or_insert_with(|| Arc::new(FieldState::default()));
                Arc::make_mut(field_state)
                    .chunks
                    .insert(chunk_no, Arc::new(chunk));
                drop(root);

                self.cache.lock().touch(field, chunk_no, bytes_used);
            }
            match listing.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(())
    }

    fn chunk_resident(&self, field: &str, chunk_no: u32) -> bool {
        self.snapshot()
            .fields
            .get(field)
            .is_some_and(|fs| fs.chunks.contains_key(&chunk_no))
    }

    fn evict_over_budget(&self) {
        let victims = {
            let cache = self.cache.lock();
            let dirty = self.dirty.lock();
            cache.eviction_victims(self.cache_budget, &dirty)
        };
        if victims.is_empty() {
            return;
        }
        let mut root = self.state.write();
        let state = Arc::make_mut(&mut root);
        let mut cache = self.cache.lock();
        let mut unloaded = self.loaded_fields.lock();
        for (field, chunk_no) in victims {
            if let Some(field_state) = state.fields.get_mut(&field) {
                Arc::make_mut(field_state).chunks.remove(&chunk_no);
            }
            cache.forget(&field, chunk_no);
            // The field is now partially resident; force a reload on next
            // touch.
            unloaded.remove(&field);
            tracing::debug!(field, chunk = chunk_no, "evicted metadata chunk");
        }
    }

    /// Persists every dirty chunk and drops empty ones.
    pub fn flush(&self, adapter: &dyn StorageAdapter) -> Result<()> {
        let dirty: Vec<(String, u32)> = {
            let mut guard = self.dirty.lock();
            guard.drain().collect()
        };
        if dirty.is_empty() {
            return Ok(());
        }

        let snap = self.snapshot();
        let mut puts = Vec::new();
        for (field, chunk_no) in &dirty {
            let key = keys::meta_chunk(field, *chunk_no);
            match snap.fields.get(field).and_then(|fs| fs.chunks.get(chunk_no)) {
                Some(chunk) => {
                    let payload = chunk.serialize()?;
                    puts.push((key, frame::encode(frame::META_CHUNK_V1, &payload)));
                    self.cache.lock().touch(field, *chunk_no, chunk.approx_bytes());
                }
                // Chunk emptied out; reclaim the key.
                None => {
                    adapter.delete(&key)?;
                    self.cache.lock().forget(field, *chunk_no);
                }
            }
        }
        adapter.batch_put(&puts)?;
        Ok(())
    }
}

/// Collects every field name referenced by a filter.
pub(crate) fn filter_fields(filter: &Filter) -> Vec<String> {
    let mut fields = Vec::new();
    collect_fields(&filter.condition, &mut fields);
    fields.sort();
    fields.dedup();
    fields
}

fn collect_fields(condition: &FilterCondition, out: &mut Vec<String>) {
    match condition {
        FilterCondition::Eq(f, _)
        | FilterCondition::Ne(f, _)
        | FilterCondition::Lt(f, _)
        | FilterCondition::Le(f, _)
        | FilterCondition::Gt(f, _)
        | FilterCondition::Ge(f, _)
        | FilterCondition::In(f, _)
        | FilterCondition::Exists(f)
        | FilterCondition::Prefix(f, _)
        | FilterCondition::Range { field: f, .. } => out.push(f.clone()),
        FilterCondition::And(a, b) | FilterCondition::Or(a, b) => {
            collect_fields(a, out);
            collect_fields(b, out);
        }
        FilterCondition::Not(inner) => collect_fields(inner, out),
    }
}

fn eval(state: &MetaState, condition: &FilterCondition) -> RoaringBitmap {
    match condition {
        FilterCondition::Eq(field, value) => match ValueKey::from_value(value) {
            Some(key) => eval_eq(state, field, &key),
            None => RoaringBitmap::new(),
        },
        FilterCondition::Ne(field, value) => {
            let eq = match ValueKey::from_value(value) {
                Some(key) => eval_eq(state, field, &key),
                None => RoaringBitmap::new(),
            };
            state.all.as_ref() - eq
        }
        FilterCondition::Lt(field, value) => eval_cmp(state, field, value, true, false),
        FilterCondition::Le(field, value) => eval_cmp(state, field, value, true, true),
        FilterCondition::Gt(field, value) => eval_cmp(state, field, value, false, false),
        FilterCondition::Ge(field, value) => eval_cmp(state, field, value, false, true),
        FilterCondition::In(field, values) => {
            let mut result = RoaringBitmap::new();
            for value in values {
                if let Some(key) = ValueKey::from_value(value) {
                    result |= eval_eq(state, field, &key);
                }
            }
            result
        }
        FilterCondition::Exists(field) => match state.fields.get(field) {
            Some(fs) => fs
                .chunks
                .values()
                .fold(RoaringBitmap::new(), |acc, c| acc | &c.present),
            None => RoaringBitmap::new(),
        },
        FilterCondition::Prefix(field, prefix) => {
            let lo = ValueKey::Str(prefix.clone());
            eval_scan(state, field, move |key| match key {
                ValueKey::Str(s) => {
                    if s.starts_with(prefix.as_str()) {
                        ScanVerdict::Take
                    } else if *key < lo {
                        ScanVerdict::Skip
                    } else {
                        ScanVerdict::Stop
                    }
                }
                _ => ScanVerdict::Skip,
            })
        }
        FilterCondition::Range { field, low, high } => {
            let (Some(lo), Some(hi)) = (ValueKey::from_value(low), ValueKey::from_value(high))
            else {
                return RoaringBitmap::new();
            };
            eval_scan(state, field, move |key| {
                if !key.same_kind(&lo) || *key < lo {
                    ScanVerdict::Skip
                } else if *key > hi {
                    ScanVerdict::Stop
                } else {
                    ScanVerdict::Take
                }
            })
        }
        FilterCondition::And(a, b) => {
            // Evaluate the smaller-cardinality side first so the
            // intersection prunes aggressively; an empty side
            // short-circuits the other entirely.
            let (first, second) = if estimate(state, a) <= estimate(state, b) {
                (a, b)
            } else {
                (b, a)
            };
            let lhs = eval(state, first);
            if lhs.is_empty() {
                return lhs;
            }
            lhs & eval(state, second)
        }
        FilterCondition::Or(a, b) => eval(state, a) | eval(state, b),
        FilterCondition::Not(inner) => state.all.as_ref() - eval(state, inner),
    }
}

fn eval_eq(state: &MetaState, field: &str, key: &ValueKey) -> RoaringBitmap {
    let Some(fs) = state.fields.get(field) else {
        return RoaringBitmap::new();
    };
    let mut result = RoaringBitmap::new();
    for chunk in fs.chunks.values() {
        if let Some(&pos) = chunk.lookup.get(key) {
            result |= &chunk.entries[pos].1;
        }
    }
    result
}

enum ScanVerdict {
    Skip,
    Take,
    Stop,
}

fn eval_scan(
    state: &MetaState,
    field: &str,
    verdict: impl Fn(&ValueKey) -> ScanVerdict,
) -> RoaringBitmap {
    let Some(fs) = state.fields.get(field) else {
        return RoaringBitmap::new();
    };
    let mut result = RoaringBitmap::new();
    for chunk in fs.chunks.values() {
        for (key, bitmap) in &chunk.entries {
            match verdict(key) {
                ScanVerdict::Skip => continue,
                ScanVerdict::Take => result |= bitmap,
                ScanVerdict::Stop => break,
            }
        }
    }
    result
}

fn eval_cmp(
    state: &MetaState,
    field: &str,
    value: &serde_json::Value,
    less: bool,
    inclusive: bool,
) -> RoaringBitmap {
    let Some(probe) = ValueKey::from_value(value) else {
        return RoaringBitmap::new();
    };
    let Some(fs) = state.fields.get(field) else {
        return RoaringBitmap::new();
    };
    let mut result = RoaringBitmap::new();
    for chunk in fs.chunks.values() {
        // Block-level min/max skip-scan: the run is sorted, so when the
        // whole chunk lies on the wrong side of the probe it cannot
        // contribute.
        if let Some((min, max)) = chunk.min_max() {
            if less && min.same_kind(&probe) && *min > probe {
                continue;
            }
            if !less && max.same_kind(&probe) && *max < probe {
                continue;
            }
        }
        for (key, bitmap) in &chunk.entries {
            if !key.same_kind(&probe) {
                continue;
            }
            let ord = key.cmp(&probe);
            let take = match (less, inclusive) {
                (true, false) => ord.is_lt(),
                (true, true) => ord.is_le(),
                (false, false) => ord.is_gt(),
                (false, true) => ord.is_ge(),
            };
            if take {
                result |= bitmap;
            }
        }
    }
    result
}

fn estimate(state: &MetaState, condition: &FilterCondition) -> u64 {
    let universe = state.all.len();
    match condition {
        FilterCondition::Eq(field, value) => match ValueKey::from_value(value) {
            Some(key) => state
                .fields
                .get(field)
                .map(|fs| {
                    fs.chunks
                        .values()
                        .filter_map(|c| c.lookup.get(&key).map(|&p| c.entries[p].1.len()))
                        .sum()
                })
                .unwrap_or(0),
            None => 0,
        },
        FilterCondition::Ne(..) | FilterCondition::Not(_) => universe,
        FilterCondition::In(field, values) => values
            .iter()
            .map(|v| estimate(state, &FilterCondition::Eq(field.clone(), v.clone())))
            .sum::<u64>()
            .min(universe),
        FilterCondition::Exists(field) => state
            .fields
            .get(field)
            .map(|fs| fs.chunks.values().map(|c| c.present.len()).sum())
            .unwrap_or(0),
        FilterCondition::Lt(field, _)
        | FilterCondition::Le(field, _)
        | FilterCondition::Gt(field, _)
        | FilterCondition::Ge(field, _)
        | FilterCondition::Prefix(field, _)
        | FilterCondition::Range { field, .. } => {
            // Half the field's population is a workable prior for ordered
            // scans; exactness only matters for relative ordering.
            state
                .fields
                .get(field)
                .map(|fs| fs.chunks.values().map(|c| c.present.len()).sum::<u64>() / 2)
                .unwrap_or(0)
        }
        FilterCondition::And(a, b) => estimate(state, a).min(estimate(state, b)),
        FilterCondition::Or(a, b) => (estimate(state, a) + estimate(state, b)).min(universe),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAdapter;

    fn index() -> MetadataIndex {
        MetadataIndex::new(&MetaIndexConfig::default())
    }

    #[test]
    fn test_eq_query() {
        let idx = index();
        idx.insert(1, &Metadata::new().with_field("category", "electronics"));
        idx.insert(2, &Metadata::new().with_field("category", "books"));
        idx.insert(3, &Metadata::new().with_field("category", "electronics"));

        let matches = idx.query(&Filter::field("category").eq("electronics"));
        assert_eq!(matches.len(), 2);
        assert!(matches.contains(1));
        assert!(matches.contains(3));
    }

    #[test]
    fn test_ne_includes_docs_missing_field() {
        let idx = index();
        idx.insert(1, &Metadata::new().with_field("status", "active"));
        idx.insert(2, &Metadata::new().with_field("status", "archived"));
        idx.insert(3, &Metadata::new());

        let matches = idx.query(&Filter::field("status").ne("active"));
        assert_eq!(matches.len(), 2);
        assert!(matches.contains(2));
        assert!(matches.contains(3));
    }

    #[test]
    fn test_range_queries() {
        let idx = index();
        idx.insert(1, &Metadata::new().with_field("price", 10));
        idx.insert(2, &Metadata::new().with_field("price", 25));
        idx.insert(3, &Metadata::new().with_field("price", 50));

        let matches = idx.query(&Filter::field("price").gt(20));
        assert_eq!(matches.len(), 2);
        assert!(matches.contains(2) && matches.contains(3));

        let matches = idx.query(&Filter::field("price").between(10, 25));
        assert_eq!(matches.len(), 2);
        assert!(matches.contains(1) && matches.contains(2));

        let matches = idx.query(&Filter::field("price").lte(10));
        assert_eq!(matches.len(), 1);
        assert!(matches.contains(1));
    }

    #[test]
    fn test_prefix_query() {
        let idx = index();
        idx.insert(1, &Metadata::new().with_field("path", "src/lib.rs"));
        idx.insert(2, &Metadata::new().with_field("path", "src/main.rs"));
        idx.insert(3, &Metadata::new().with_field("path", "tests/basic.rs"));

        let matches = idx.query(&Filter::field("path").prefix("src/"));
        assert_eq!(matches.len(), 2);
        assert!(matches.contains(1) && matches.contains(2));
    }

    #[test]
    fn test_sequence_elements_posted_individually() {
        let idx = index();
        idx.insert(1, &Metadata::new().with_field("tags", vec!["rust", "db"]));
        idx.insert(2, &Metadata::new().with_field("tags", vec!["go"]));

        let matches = idx.query(&Filter::field("tags").eq("rust"));
        assert_eq!(matches.len(), 1);
        assert!(matches.contains(1));
    }

    #[test]
    fn test_and_or_not() {
        let idx = index();
        idx.insert(
            1,
            &Metadata::new()
                .with_field("category", "electronics")
                .with_field("brand", "sony"),
        );
        idx.insert(
            2,
            &Metadata::new()
                .with_field("category", "electronics")
                .with_field("brand", "lg"),
        );
        idx.insert(
            3,
            &Metadata::new()
                .with_field("category", "books")
                .with_field("brand", "sony"),
        );

        let matches = idx.query(
            &Filter::field("category")
                .eq("electronics")
                .and(Filter::field("brand").eq("sony")),
        );
        assert_eq!(matches.len(), 1);
        assert!(matches.contains(1));

        let matches = idx.query(
            &Filter::field("category")
                .eq("books")
                .or(Filter::field("brand").eq("lg")),
        );
        assert_eq!(matches.len(), 2);

        let matches = idx.query(&Filter::field("brand").eq("sony").negate());
        assert_eq!(matches.len(), 1);
        assert!(matches.contains(2));
    }

    #[test]
    fn test_remove_clears_postings() {
        let idx = index();
        let meta = Metadata::new().with_field("status", "active");
        idx.insert(1, &meta);
        idx.insert(2, &meta);

        idx.remove(1, &meta);
        let matches = idx.query(&Filter::field("status").eq("active"));
        assert_eq!(matches.len(), 1);
        assert!(matches.contains(2));
        assert_eq!(idx.universe_len(), 1);
    }

    #[test]
    fn test_docs_span_chunks() {
        let idx = index();
        let meta = Metadata::new().with_field("status", "active");
        let far_doc = 3 * 65_536 + 17;
        idx.insert(1, &meta);
        idx.insert(far_doc, &meta);

        let matches = idx.query(&Filter::field("status").eq("active"));
        assert_eq!(matches.len(), 2);
        assert!(matches.contains(far_doc));
    }

    #[test]
    fn test_estimate_matches_leaf_cardinality() {
        let idx = index();
        for doc in 0..10 {
            let status = if doc < 4 { "active" } else { "archived" };
            idx.insert(doc, &Metadata::new().with_field("status", status));
        }
        assert_eq!(idx.estimate(&Filter::field("status").eq("active")), 4);
        assert_eq!(idx.estimate(&Filter::field("status").eq("archived")), 6);
        assert_eq!(idx.estimate(&Filter::field("status").exists()), 10);
    }

    #[test]
    fn test_flush_and_reload() {
        let adapter = MemoryAdapter::new();
        let idx = index();
        idx.insert(1, &Metadata::new().with_field("status", "active"));
        idx.insert(2, &Metadata::new().with_field("status", "archived"));
        idx.flush(&adapter).unwrap();

        let reloaded = index();
        let mut universe = RoaringBitmap::new();
        universe.insert(1);
        universe.insert(2);
        reloaded.set_universe(universe);
        reloaded
            .ensure_loaded(&["status".to_string()], &adapter)
            .unwrap();

        let matches = reloaded.query(&Filter::field("status").eq("active"));
        assert_eq!(matches.len(), 1);
        assert!(matches.contains(1));
    }

    #[test]
    fn test_chunk_round_trip_byte_identical() {
        let mut chunk = FieldChunk::default();
        chunk.insert(ValueKey::Str("alpha".into()), 1);
        chunk.insert(ValueKey::Num(42.0), 2);
        chunk.insert(ValueKey::Bool(true), 3);
        chunk.insert(ValueKey::Str("alpha".into()), 9);

        let bytes = chunk.serialize().unwrap();
        let restored = FieldChunk::deserialize(&bytes).unwrap();
        assert_eq!(restored.serialize().unwrap(), bytes);
        assert_eq!(restored.entries.len(), 3);
        assert!(restored.present.contains(9));
    }

    #[test]
    fn test_empty_chunk_reclaimed_on_flush() {
        let adapter = MemoryAdapter::new();
        let idx = index();
        let meta = Metadata::new().with_field("status", "active");
        idx.insert(1, &meta);
        idx.flush(&adapter).unwrap();
        assert!(adapter.exists("meta/status/chunk-0").unwrap());

        idx.remove(1, &meta);
        idx.flush(&adapter).unwrap();
        assert!(!adapter.exists("meta/status/chunk-0").unwrap());
    }

    #[test]
    fn test_filter_fields_collects_all() {
        let filter = Filter::field("a")
            .eq(1)
            .and(Filter::field("b").exists().or(Filter::field("a").lt(5)).negate());
        assert_eq!(filter_fields(&filter), vec!["a".to_string(), "b".to_string()]);
    }
}
