//! The store facade: one handle that owns the three indexes, the id
//! table, and the storage adapter, and exposes the public operations.
//!
//! Every public mutation runs as a transaction (single-operation for the
//! convenience methods), so atomicity, rollback, and statistics cover the
//! whole write surface. Reads that start after a commit returns see its
//! effects; reads inside a transaction see the transaction's own writes
//! through its overlay.
//!
//! On open, the store reconciles the persisted manifest with the raw noun
//! records so that a crash between record writes and a manifest flush
//! converges back to a consistent state. Index structures load lazily: a
//! vector partition on the first query touching its type, metadata chunks
//! on the first filter naming their field, the graph adjacency on the
//! first graph query (rebuilt from raw verb records only).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::filter::MetadataIndex;
use crate::graph::{Direction, GraphAdjacencyIndex, Neighbor, Path, PathOptions};
use crate::index::HnswIndex;
use crate::metadata::Metadata;
use crate::planner::{self, QueryContext, SearchResults, TripleQuery};
use crate::storage::records::{self, CommitRecord};
use crate::storage::{keys, StorageAdapter};
use crate::txn::{Compensation, TransactionManager, TxnHandle, TxnStats};
use crate::types::{DocId, IdTable, Noun, NounId, NounPatch, NounType, Timestamp, Verb, VerbId, VerbType};

/// Store manifest persisted at `store/meta`.
#[derive(Debug, Serialize, Deserialize)]
struct StoreManifest {
    dimension: usize,
    metric: String,
    nouns: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    doc: DocId,
    id: NounId,
    noun_type: NounType,
}

/// Pending raw-record puts while the store is in high-volume mode.
struct Batcher {
    pending: HashMap<String, Vec<u8>>,
    last_flush: Instant,
    buffering: bool,
}

impl Default for Batcher {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            last_flush: Instant::now(),
            buffering: false,
        }
    }
}

/// One-second sliding window over write counts; crossing the configured
/// rate flips the store into high-volume (buffered) mode.
struct RateWindow {
    window_start: Instant,
    ops: u64,
}

impl Default for RateWindow {
    fn default() -> Self {
        Self {
            window_start: Instant::now(),
            ops: 0,
        }
    }
}

/// A triple-intelligence knowledge store.
///
/// # Example
///
/// ```
/// use triaxdb_core::prelude::*;
///
/// let store = Store::open(MemoryAdapter::new(), StoreConfig::new(3)).unwrap();
/// let noun = Noun::new(NounType::CONCEPT, vec![1.0, 0.0, 0.0]).with_id("n1");
/// store.add(noun).unwrap();
///
/// let results = store
///     .search(&TripleQuery::new().with_vector(vec![1.0, 0.0, 0.0], 1))
///     .unwrap();
/// assert_eq!(results.hits[0].noun_id.as_str(), "n1");
/// ```
pub struct Store {
    config: StoreConfig,
    adapter: Arc<dyn StorageAdapter>,
    ids: RwLock<IdTable>,
    hnsw: HnswIndex,
    meta: MetadataIndex,
    graph: GraphAdjacencyIndex,
    txns: TransactionManager,
    /// Monotonic timestamp high-water mark (ms since epoch).
    clock: AtomicU64,
    batcher: Mutex<Batcher>,
    rate: Mutex<RateWindow>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Store {
    /// Opens a store over the given adapter, creating it if empty.
    ///
    /// An existing store's dimension and metric must match the config.
    pub fn open<A: StorageAdapter + 'static>(adapter: A, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let adapter: Arc<dyn StorageAdapter> = Arc::new(adapter);

        let manifest = match adapter.get(keys::STORE_META)? {
            Some(bytes) => {
                let payload = crate::storage::frame::decode(&bytes, crate::storage::frame::STORE_META_V1)?;
                let manifest: StoreManifest = serde_json::from_slice(payload)
                    .map_err(|e| Error::corrupt(format!("manifest decode failed: {e}")))?;
                Some(manifest)
            }
            None => None,
        };
        let is_new = manifest.is_none();

        if let Some(manifest) = &manifest {
            if manifest.dimension != config.dimension {
                return Err(Error::invalid(format!(
                    "dimension mismatch: store has {}, config has {}",
                    manifest.dimension, config.dimension
                )));
            }
            if manifest.metric != config.metric.to_string() {
                return Err(Error::invalid(format!(
                    "metric mismatch: store has {}, config has {}",
                    manifest.metric, config.metric
                )));
            }
        }

        let mut ids = IdTable::new();
        if let Some(manifest) = &manifest {
            for entry in &manifest.nouns {
                ids.restore(entry.doc, entry.id.clone(), entry.noun_type.clone());
            }
            ids.rebuild_free_list();
        }

        let store = Self {
            hnsw: HnswIndex::new(config.metric, config.dimension, config.hnsw.clone()),
            meta: MetadataIndex::new(&config.meta),
            graph: if is_new {
                GraphAdjacencyIndex::new()
            } else {
                GraphAdjacencyIndex::unbuilt()
            },
            txns: TransactionManager::new(config.txn.clone()),
            clock: AtomicU64::new(Timestamp::now().0),
            batcher: Mutex::new(Batcher::default()),
            rate: Mutex::new(RateWindow::default()),
            ids: RwLock::new(ids),
            adapter,
            config,
        };

        store.recover()?;
        if is_new {
            store.save_manifest()?;
        }
        Ok(store)
    }

    /// Reconciles the id table against the raw noun records.
    ///
    /// Records missing from the manifest (commit landed, manifest flush
    /// did not) are indexed; manifest entries without a record (delete
    /// landed, manifest flush did not) are released. Stale metadata
    /// posting bits for released docs are harmless: results always resolve
    /// through the id table, which filters them.
    fn recover(&self) -> Result<()> {
        let mut seen: HashSet<NounId> = HashSet::new();
        let mut cursor: Option<String> = None;
        loop {
            let listing = self.adapter.list_prefix(keys::NOUNS_PREFIX, cursor.as_deref())?;
            for key in &listing.keys {
                let mut segments = key.split('/');
                let (Some("nouns"), Some(_), Some(id_part), None) = (
                    segments.next(),
                    segments.next(),
                    segments.next(),
                    segments.next(),
                ) else {
                    continue;
                };
                let Some(id) = keys::unescape(id_part) else {
                    continue;
                };
                let noun_id = NounId::from(id);
                seen.insert(noun_id.clone());

                if self.ids.read().doc_of(&noun_id).is_some() {
                    continue;
                }
                // A record the manifest never saw; index it now.
                let Some(bytes) = self.adapter.get(key)? else {
                    continue;
                };
                let noun = records::decode_noun(&bytes)?;
                let doc = self
                    .ids
                    .write()
                    .assign(noun.id.clone(), noun.noun_type.clone());
                self.hnsw.ensure_loaded(&noun.noun_type, self.adapter.as_ref())?;
                self.hnsw
                    .insert(&noun.noun_type, doc, noun.vector.as_slice())?;
                let fields: Vec<String> =
                    noun.metadata.iter().map(|(k, _)| k.clone()).collect();
                self.meta.ensure_loaded(&fields, self.adapter.as_ref())?;
                self.meta.insert(doc, &noun.metadata);
                tracing::debug!(id = %noun.id, "recovered unmanifested noun record");
            }
            match listing.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        // Manifest entries whose record disappeared.
        let stale: Vec<NounId> = self
            .ids
            .read()
            .iter()
            .filter(|(_, e)| !seen.contains(&e.noun_id))
            .map(|(_, e)| e.noun_id.clone())
            .collect();
        for noun_id in stale {
            self.ids.write().release(&noun_id);
            self.graph.mark_deleted(&noun_id);
            tracing::debug!(id = %noun_id, "dropped manifest entry without a record");
        }

        let mut universe = RoaringBitmap::new();
        for (doc, _) in self.ids.read().iter() {
            universe.insert(doc);
        }
        self.meta.set_universe(universe);
        Ok(())
    }

    /// Number of live nouns.
    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    /// True if the store holds no nouns.
    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }

    /// The store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Immutable transaction statistics snapshot.
    pub fn stats(&self) -> TxnStats {
        self.txns.stats()
    }

    /// Monotonic wall-clock timestamp.
    fn now(&self) -> Timestamp {
        let wall = Timestamp::now().0;
        let mut prev = self.clock.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .clock
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Timestamp(next),
                Err(actual) => prev = actual,
            }
        }
    }

    // ---------------------------------------------------------------
    // Raw record access through the high-volume buffer overlay
    // ---------------------------------------------------------------

    /// Counts a write against the rate window; true while the configured
    /// high-volume threshold is exceeded.
    fn note_write(&self) -> bool {
        let mut rate = self.rate.lock();
        if rate.window_start.elapsed().as_secs() >= 1 {
            rate.window_start = Instant::now();
            rate.ops = 0;
        }
        rate.ops += 1;
        rate.ops > self.config.batch.high_volume_ops_per_sec
    }

    fn put_record(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let high_volume = self.note_write();
        let mut batcher = self.batcher.lock();
        if high_volume {
            batcher.buffering = true;
        }
        if batcher.buffering {
            batcher.pending.insert(key.to_string(), bytes);
            let full = batcher.pending.len() >= self.config.batch.flush_ops;
            let due = batcher.last_flush.elapsed() >= self.config.batch.flush_interval;
            if full || due {
                let items: Vec<(String, Vec<u8>)> = batcher.pending.drain().collect();
                batcher.last_flush = Instant::now();
                batcher.buffering = high_volume;
                drop(batcher);
                self.adapter.batch_put(&items)?;
            }
            Ok(())
        } else {
            drop(batcher);
            self.adapter.put(key, &bytes)
        }
    }

    fn get_record(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.batcher.lock().pending.get(key) {
            return Ok(Some(bytes.clone()));
        }
        self.adapter.get(key)
    }

    fn delete_record(&self, key: &str) -> Result<()> {
        self.batcher.lock().pending.remove(key);
        self.adapter.delete(key)
    }

    /// Forces out any buffered high-volume writes.
    fn flush_batch(&self) -> Result<()> {
        let items: Vec<(String, Vec<u8>)> = {
            let mut batcher = self.batcher.lock();
            batcher.buffering = false;
            batcher.last_flush = Instant::now();
            batcher.pending.drain().collect()
        };
        if items.is_empty() {
            return Ok(());
        }
        self.adapter.batch_put(&items)
    }

    // ---------------------------------------------------------------
    // Public operations
    // ---------------------------------------------------------------

    /// Adds a noun. Fails with `AlreadyExists` if the id is taken.
    pub fn add(&self, noun: Noun) -> Result<NounId> {
        self.transaction(move |tx| tx.add(noun))
    }

    /// Applies a partial update to a noun.
    pub fn update(&self, id: &NounId, patch: NounPatch) -> Result<()> {
        let id = id.clone();
        self.transaction(move |tx| tx.update(&id, patch))
    }

    /// Deletes a noun, cascading to its outgoing verbs. Returns false if
    /// the noun did not exist.
    pub fn delete(&self, id: &NounId) -> Result<bool> {
        let id = id.clone();
        self.transaction(move |tx| tx.delete(&id))
    }

    /// Creates a verb between two existing nouns. Idempotent on
    /// `(source, target, type, metadata)`; returns the surviving verb id.
    pub fn relate(&self, source: &NounId, target: &NounId, verb_type: VerbType) -> Result<VerbId> {
        let (source, target) = (source.clone(), target.clone());
        self.transaction(move |tx| tx.relate(source, target, verb_type))
    }

    /// [`relate`](Self::relate) with explicit weight and metadata.
    pub fn relate_with(
        &self,
        source: &NounId,
        target: &NounId,
        verb_type: VerbType,
        weight: f32,
        metadata: Metadata,
    ) -> Result<VerbId> {
        let (source, target) = (source.clone(), target.clone());
        self.transaction(move |tx| tx.relate_with(source, target, verb_type, weight, metadata))
    }

    /// Removes a verb. Returns false if it did not exist.
    pub fn unrelate(&self, verb_id: &VerbId) -> Result<bool> {
        let verb_id = verb_id.clone();
        self.transaction(move |tx| tx.unrelate(&verb_id))
    }

    /// Fetches a noun. A missing id is a normal `None`, not an error.
    pub fn get(&self, id: &NounId) -> Result<Option<Noun>> {
        let entry = {
            let ids = self.ids.read();
            ids.doc_of(id)
                .and_then(|doc| ids.resolve(doc).cloned())
        };
        let Some(entry) = entry else {
            return Ok(None);
        };
        let key = keys::noun(&entry.noun_type, id);
        match self.get_record(&key)? {
            Some(bytes) => Ok(Some(records::decode_noun(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetches a verb record.
    pub fn get_verb(&self, verb_id: &VerbId) -> Result<Option<Verb>> {
        match self.get_record(&keys::verb(verb_id))? {
            Some(bytes) => Ok(Some(records::decode_verb(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Runs a fused query.
    pub fn search(&self, query: &TripleQuery) -> Result<SearchResults> {
        self.search_with_cancel(query, &CancelToken::new())
    }

    /// [`search`](Self::search) with an explicit cancellation token.
    pub fn search_with_cancel(
        &self,
        query: &TripleQuery,
        cancel: &CancelToken,
    ) -> Result<SearchResults> {
        if query.graph.is_some() {
            self.ensure_graph()?;
        }
        let types = match &query.types {
            Some(types) => types.clone(),
            None => self.all_types(),
        };
        for noun_type in &types {
            self.hnsw.ensure_loaded(noun_type, self.adapter.as_ref())?;
        }
        self.meta
            .ensure_loaded(&query.filter_field_names(), self.adapter.as_ref())?;

        let ids = self.ids.read();
        let ctx = QueryContext {
            hnsw: &self.hnsw,
            meta: &self.meta,
            graph: &self.graph,
            ids: &ids,
            config: &self.config,
        };
        planner::execute(&ctx, query, cancel)
    }

    /// Enumerates relations around a noun.
    pub fn get_relations(&self, query: &RelationQuery) -> Result<Vec<Neighbor>> {
        self.ensure_graph()?;
        let (start, direction) = match (&query.from, &query.to) {
            (Some(from), None) => (from, Direction::Out),
            (None, Some(to)) => (to, Direction::In),
            (Some(from), Some(_)) => (from, Direction::Out),
            (None, None) => {
                return Err(Error::invalid("relation query needs a from or to noun"))
            }
        };
        let depth = query.depth.max(1);
        let cancel = CancelToken::new();
        let mut edges = self.graph.edges_within(
            start,
            depth,
            direction,
            query.verb_types.as_deref(),
            &cancel,
        )?;
        // With both endpoints given, keep only the direct edges between
        // them.
        if let (Some(_), Some(to)) = (&query.from, &query.to) {
            edges.retain(|e| e.noun_id == *to);
        }
        Ok(edges)
    }

    /// Cheapest path between two nouns.
    pub fn shortest_path(
        &self,
        src: &NounId,
        dst: &NounId,
        opts: &PathOptions,
    ) -> Result<Option<Path>> {
        self.ensure_graph()?;
        self.graph
            .shortest_path(src, dst, opts, &CancelToken::new())
    }

    /// Runs several operations as one atomic unit.
    ///
    /// On any error the already-executed operations are compensated in
    /// LIFO order and the failure surfaces as
    /// [`Error::Transaction`](crate::error::Error).
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Txn<'_, '_>) -> Result<T>) -> Result<T> {
        self.transaction_with_cancel(CancelToken::new(), f)
    }

    /// [`transaction`](Self::transaction) with an explicit token.
    pub fn transaction_with_cancel<T>(
        &self,
        cancel: CancelToken,
        f: impl FnOnce(&mut Txn<'_, '_>) -> Result<T>,
    ) -> Result<T> {
        self.txns.run(cancel, |handle| {
            let mut txn = Txn {
                store: self,
                handle,
                overlay: Overlay::default(),
            };
            let value = f(&mut txn)?;

            // Commit log entry; failing to write it aborts the commit.
            if txn.handle.operations() > 0 {
                let record = CommitRecord {
                    tx_id: txn.handle.id().to_string(),
                    operations: txn.handle.operations(),
                    committed_at: self.now(),
                };
                self.put_record(
                    &keys::commit(&record.tx_id),
                    records::encode_commit(&record)?,
                )?;
            }
            Ok(value)
        })
    }

    /// Persists all buffered and dirty state: raw records, metadata
    /// chunks, vector partitions, adjacency blocks, then the manifest.
    pub fn flush(&self) -> Result<()> {
        self.flush_batch()?;
        self.meta.flush(self.adapter.as_ref())?;
        self.hnsw.flush(self.adapter.as_ref())?;
        self.graph.flush(self.adapter.as_ref())?;
        self.save_manifest()
    }

    fn save_manifest(&self) -> Result<()> {
        let nouns: Vec<ManifestEntry> = self
            .ids
            .read()
            .iter()
            .map(|(doc, entry)| ManifestEntry {
                doc,
                id: entry.noun_id.clone(),
                noun_type: entry.noun_type.clone(),
            })
            .collect();
        let manifest = StoreManifest {
            dimension: self.config.dimension,
            metric: self.config.metric.to_string(),
            nouns,
        };
        let payload = serde_json::to_vec(&manifest)
            .map_err(|e| Error::invalid(format!("manifest serialize failed: {e}")))?;
        self.adapter.put(
            keys::STORE_META,
            &crate::storage::frame::encode(crate::storage::frame::STORE_META_V1, &payload),
        )
    }

    fn all_types(&self) -> Vec<NounType> {
        let ids = self.ids.read();
        let mut types: Vec<NounType> = Vec::new();
        for (_, entry) in ids.iter() {
            if !types.contains(&entry.noun_type) {
                types.push(entry.noun_type.clone());
            }
        }
        types.sort();
        types
    }

    /// Builds the graph adjacency if the reopened store has not yet.
    ///
    /// Buffered verb records are flushed first so the rebuild, which reads
    /// raw storage only, observes them.
    fn ensure_graph(&self) -> Result<()> {
        if self.graph.is_built() {
            return Ok(());
        }
        self.flush_batch()?;
        self.graph.rebuild_from(self.adapter.as_ref())?;
        let ids = self.ids.read();
        for endpoint in self.graph.endpoints() {
            if ids.doc_of(&endpoint).is_none() {
                self.graph.mark_deleted(&endpoint);
            }
        }
        Ok(())
    }
}

/// Selector for [`Store::get_relations`].
#[derive(Debug, Clone, Default)]
pub struct RelationQuery {
    /// Follow outgoing edges from this noun.
    pub from: Option<NounId>,
    /// Follow incoming edges of this noun.
    pub to: Option<NounId>,
    /// Restrict to these verb types.
    pub verb_types: Option<Vec<VerbType>>,
    /// Expansion depth in hops; 0 and 1 both mean direct edges only.
    pub depth: usize,
}

impl RelationQuery {
    /// Outgoing relations of a noun.
    pub fn from(id: impl Into<NounId>) -> Self {
        Self {
            from: Some(id.into()),
            depth: 1,
            ..Default::default()
        }
    }

    /// Incoming relations of a noun.
    pub fn to(id: impl Into<NounId>) -> Self {
        Self {
            to: Some(id.into()),
            depth: 1,
            ..Default::default()
        }
    }

    /// Restricts verb types. Chainable.
    pub fn with_verb_types(mut self, types: Vec<VerbType>) -> Self {
        self.verb_types = Some(types);
        self
    }

    /// Sets the expansion depth. Chainable.
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }
}

/// Per-transaction view of writes not yet visible outside it.
#[derive(Default)]
struct Overlay {
    nouns: HashMap<NounId, Option<Noun>>,
    verbs: HashMap<VerbId, Option<Verb>>,
}

/// Transaction handle passed to [`Store::transaction`] bodies.
///
/// Reads through the handle observe the transaction's own writes
/// (read-your-writes); operations execute in submission order and record
/// compensations for rollback.
pub struct Txn<'s, 'h> {
    store: &'s Store,
    handle: &'h mut TxnHandle<'s>,
    overlay: Overlay,
}

impl<'s> Txn<'s, '_> {
    /// Reads a noun, observing in-transaction writes first.
    pub fn get(&self, id: &NounId) -> Result<Option<Noun>> {
        match self.overlay.nouns.get(id) {
            Some(Some(noun)) => Ok(Some(noun.clone())),
            Some(None) => Ok(None),
            None => self.store.get(id),
        }
    }

    /// Reads a verb, observing in-transaction writes first.
    pub fn get_verb(&self, verb_id: &VerbId) -> Result<Option<Verb>> {
        match self.overlay.verbs.get(verb_id) {
            Some(Some(verb)) => Ok(Some(verb.clone())),
            Some(None) => Ok(None),
            None => self.store.get_verb(verb_id),
        }
    }

    /// Adds a noun.
    pub fn add(&mut self, mut noun: Noun) -> Result<NounId> {
        if !noun.noun_type.is_valid() {
            return Err(Error::invalid(format!(
                "invalid noun type '{}'",
                noun.noun_type
            )));
        }
        if noun.vector.dimension() != self.store.config.dimension {
            return Err(Error::invalid(format!(
                "dimension mismatch: expected {}, got {}",
                self.store.config.dimension,
                noun.vector.dimension()
            )));
        }
        noun.vector.validate()?;
        noun.metadata.validate()?;
        if self.get(&noun.id)?.is_some() {
            return Err(Error::AlreadyExists(format!("noun {}", noun.id)));
        }

        let stamp = self.store.now();
        noun.created_at = stamp;
        noun.updated_at = stamp;

        let store = self.store;
        let saved = noun.clone();
        self.handle.execute("add-noun", move |_| {
            let key = keys::noun(&saved.noun_type, &saved.id);
            store
                .hnsw
                .ensure_loaded(&saved.noun_type, store.adapter.as_ref())?;
            let fields: Vec<String> = saved.metadata.iter().map(|(k, _)| k.clone()).collect();
            store.meta.ensure_loaded(&fields, store.adapter.as_ref())?;

            store.put_record(&key, records::encode_noun(&saved)?)?;
            let doc = store
                .ids
                .write()
                .assign(saved.id.clone(), saved.noun_type.clone());
            if let Err(err) = store.hnsw.insert(&saved.noun_type, doc, saved.vector.as_slice()) {
                // Forward action failed halfway; undo its own partial
                // writes before surfacing.
                store.ids.write().release(&saved.id);
                let _ = store.delete_record(&key);
                return Err(err);
            }
            store.meta.insert(doc, &saved.metadata);
            store.graph.mark_live(&saved.id);

            let compensation: Compensation<'s> = Box::new(move || {
                store.meta.remove(doc, &saved.metadata);
                store.hnsw.remove(&saved.noun_type, doc);
                store.ids.write().release(&saved.id);
                store.delete_record(&key)
            });
            Ok(((), Some(compensation)))
        })?;

        let id = noun.id.clone();
        self.overlay.nouns.insert(id.clone(), Some(noun));
        Ok(id)
    }

    /// Applies a partial update. A new vector is executed as
    /// delete-then-insert in the vector index.
    pub fn update(&mut self, id: &NounId, patch: NounPatch) -> Result<()> {
        let Some(old) = self.get(id)? else {
            return Err(Error::not_found(format!("noun {id}")));
        };
        if patch.is_empty() {
            return Ok(());
        }
        if let Some(vector) = &patch.vector {
            if vector.dimension() != self.store.config.dimension {
                return Err(Error::invalid(format!(
                    "dimension mismatch: expected {}, got {}",
                    self.store.config.dimension,
                    vector.dimension()
                )));
            }
            vector.validate()?;
        }
        if let Some(metadata) = &patch.metadata {
            metadata.validate()?;
        }

        let mut updated = old.clone();
        if let Some(vector) = patch.vector {
            updated.vector = vector;
        }
        if let Some(metadata) = patch.metadata {
            updated.metadata = metadata;
        }
        updated.updated_at = self.store.now();

        let store = self.store;
        let saved_old = old.clone();
        let saved_new = updated.clone();
        self.handle.execute("update-noun", move |_| {
            let key = keys::noun(&saved_new.noun_type, &saved_new.id);
            let doc = store
                .ids
                .read()
                .doc_of(&saved_new.id)
                .ok_or_else(|| Error::not_found(format!("noun {}", saved_new.id)))?;
            store
                .hnsw
                .ensure_loaded(&saved_new.noun_type, store.adapter.as_ref())?;
            let fields: Vec<String> = saved_old
                .metadata
                .iter()
                .chain(saved_new.metadata.iter())
                .map(|(k, _)| k.clone())
                .collect();
            store.meta.ensure_loaded(&fields, store.adapter.as_ref())?;

            store.put_record(&key, records::encode_noun(&saved_new)?)?;
            let vector_changed = saved_old.vector != saved_new.vector;
            if vector_changed {
                store.hnsw.remove(&saved_new.noun_type, doc);
                store
                    .hnsw
                    .insert(&saved_new.noun_type, doc, saved_new.vector.as_slice())?;
            }
            let metadata_changed = saved_old.metadata != saved_new.metadata;
            if metadata_changed {
                store.meta.remove(doc, &saved_old.metadata);
                store.meta.insert(doc, &saved_new.metadata);
            }

            let compensation: Compensation<'s> = Box::new(move || {
                if metadata_changed {
                    store.meta.remove(doc, &saved_new.metadata);
                    store.meta.insert(doc, &saved_old.metadata);
                }
                if vector_changed {
                    store.hnsw.remove(&saved_new.noun_type, doc);
                    store
                        .hnsw
                        .insert(&saved_old.noun_type, doc, saved_old.vector.as_slice())?;
                }
                store.put_record(&key, records::encode_noun(&saved_old)?)
            });
            Ok(((), Some(compensation)))
        })?;

        self.overlay.nouns.insert(id.clone(), Some(updated));
        Ok(())
    }

    /// Deletes a noun and its outgoing verbs. Verbs still targeting it
    /// surface `deleted: true` until their own sources go.
    pub fn delete(&mut self, id: &NounId) -> Result<bool> {
        let Some(noun) = self.get(id)? else {
            return Ok(false);
        };

        let store = self.store;
        let saved = noun.clone();
        let removed_verbs = self.handle.execute("delete-noun", move |_| {
            store.ensure_graph()?;
            let key = keys::noun(&saved.noun_type, &saved.id);
            let doc = store
                .ids
                .read()
                .doc_of(&saved.id)
                .ok_or_else(|| Error::not_found(format!("noun {}", saved.id)))?;
            store
                .hnsw
                .ensure_loaded(&saved.noun_type, store.adapter.as_ref())?;
            let fields: Vec<String> = saved.metadata.iter().map(|(k, _)| k.clone()).collect();
            store.meta.ensure_loaded(&fields, store.adapter.as_ref())?;

            // Capture outgoing verb records before the cascade removes
            // them, so rollback can restore them.
            let out_ids = store.graph.remove_noun(&saved.id);
            let mut removed: Vec<Verb> = Vec::with_capacity(out_ids.len());
            for verb_id in &out_ids {
                let verb_key = keys::verb(verb_id);
                if let Some(bytes) = store.get_record(&verb_key)? {
                    removed.push(records::decode_verb(&bytes)?);
                }
                store.delete_record(&verb_key)?;
            }

            store.hnsw.remove(&saved.noun_type, doc);
            store.meta.remove(doc, &saved.metadata);
            store.ids.write().release(&saved.id);
            store.delete_record(&key)?;

            let undo_verbs = removed.clone();
            let compensation: Compensation<'s> = Box::new(move || {
                store.put_record(&key, records::encode_noun(&saved)?)?;
                store
                    .ids
                    .write()
                    .restore(doc, saved.id.clone(), saved.noun_type.clone());
                store.meta.insert(doc, &saved.metadata);
                store
                    .hnsw
                    .insert(&saved.noun_type, doc, saved.vector.as_slice())?;
                store.graph.mark_live(&saved.id);
                for verb in &undo_verbs {
                    store.put_record(&keys::verb(&verb.id), records::encode_verb(verb)?)?;
                    store.graph.add_edge(verb);
                }
                Ok(())
            });
            Ok((removed, Some(compensation)))
        })?;

        self.overlay.nouns.insert(id.clone(), None);
        for verb in removed_verbs {
            self.overlay.verbs.insert(verb.id, None);
        }
        Ok(true)
    }

    /// Creates a verb with default weight and empty metadata.
    pub fn relate(
        &mut self,
        source: NounId,
        target: NounId,
        verb_type: VerbType,
    ) -> Result<VerbId> {
        self.relate_with(source, target, verb_type, 1.0, Metadata::new())
    }

    /// Creates a verb. Both endpoints must exist at commit time; invoked
    /// twice with identical arguments it yields exactly one edge and
    /// returns the surviving verb's id.
    pub fn relate_with(
        &mut self,
        source: NounId,
        target: NounId,
        verb_type: VerbType,
        weight: f32,
        metadata: Metadata,
    ) -> Result<VerbId> {
        if !verb_type.is_valid() {
            return Err(Error::invalid(format!("invalid verb type '{verb_type}'")));
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(Error::invalid("verb weight must be finite and >= 0"));
        }
        metadata.validate()?;
        if self.get(&source)?.is_none() {
            return Err(Error::not_found(format!("source noun {source}")));
        }
        if self.get(&target)?.is_none() {
            return Err(Error::not_found(format!("target noun {target}")));
        }

        let stamp = self.store.now();
        let mut verb = Verb::new(source, target, verb_type)
            .with_weight(weight)
            .with_metadata(metadata);
        verb.created_at = stamp;
        verb.updated_at = stamp;

        let store = self.store;
        let saved = verb.clone();
        let (verb_id, created) = self.handle.execute("relate", move |_| {
            store.ensure_graph()?;
            if !store.graph.add_edge(&saved) {
                // Duplicate collapses onto the existing edge.
                let existing = store
                    .graph
                    .find_edge(
                        &saved.source,
                        &saved.verb_type,
                        &saved.target,
                        saved.metadata.content_hash(),
                    )
                    .ok_or_else(|| Error::Conflict("edge vanished during relate".into()))?;
                return Ok(((existing, false), None));
            }

            let key = keys::verb(&saved.id);
            if let Err(err) = store.put_record(&key, records::encode_verb(&saved)?) {
                store.graph.remove_edge(&saved.id);
                return Err(err);
            }

            let verb_id = saved.id.clone();
            let compensation: Compensation<'s> = Box::new(move || {
                store.graph.remove_edge(&verb_id);
                store.delete_record(&key)
            });
            Ok(((saved.id.clone(), true), Some(compensation)))
        })?;

        if created {
            self.overlay.verbs.insert(verb_id.clone(), Some(verb));
        }
        Ok(verb_id)
    }

    /// Removes a verb. Returns false if it did not exist.
    pub fn unrelate(&mut self, verb_id: &VerbId) -> Result<bool> {
        let store = self.store;
        let verb_id_saved = verb_id.clone();
        let removed = self.handle.execute("unrelate", move |_| {
            store.ensure_graph()?;
            let key = keys::verb(&verb_id_saved);
            let Some(bytes) = store.get_record(&key)? else {
                return Ok((false, None));
            };
            let verb = records::decode_verb(&bytes)?;

            store.graph.remove_edge(&verb_id_saved);
            store.delete_record(&key)?;

            let compensation: Compensation<'s> = Box::new(move || {
                store.put_record(&key, records::encode_verb(&verb)?)?;
                store.graph.add_edge(&verb);
                Ok(())
            });
            Ok((true, Some(compensation)))
        })?;

        if removed {
            self.overlay.verbs.insert(verb_id.clone(), None);
        }
        Ok(removed)
    }

    /// The enclosing transaction's cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        self.handle.cancel_token()
    }
}

// Async API when the tokio feature is enabled
#[cfg(feature = "async")]
mod async_api {
    use super::*;

    /// Async wrapper over [`Store`].
    ///
    /// Mirrors the sync methods through `spawn_blocking` for tokio
    /// compatibility. Transactions need borrowed closures and stay on the
    /// sync API; reach them through [`inner`](AsyncStore::inner).
    #[derive(Clone)]
    pub struct AsyncStore {
        inner: Arc<Store>,
    }

    impl AsyncStore {
        /// Opens a store asynchronously.
        pub async fn open<A: StorageAdapter + 'static>(
            adapter: A,
            config: StoreConfig,
        ) -> Result<Self> {
            let store = tokio::task::spawn_blocking(move || Store::open(adapter, config))
                .await
                .map_err(|e| Error::storage(format!("spawn_blocking failed: {e}")))??;
            Ok(Self {
                inner: Arc::new(store),
            })
        }

        /// Wraps an existing store.
        pub fn from_sync(store: Store) -> Self {
            Self {
                inner: Arc::new(store),
            }
        }

        /// Adds a noun asynchronously.
        pub async fn add(&self, noun: Noun) -> Result<NounId> {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.add(noun))
                .await
                .map_err(|e| Error::storage(format!("spawn_blocking failed: {e}")))?
        }

        /// Updates a noun asynchronously.
        pub async fn update(&self, id: NounId, patch: NounPatch) -> Result<()> {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.update(&id, patch))
                .await
                .map_err(|e| Error::storage(format!("spawn_blocking failed: {e}")))?
        }

        /// Deletes a noun asynchronously.
        pub async fn delete(&self, id: NounId) -> Result<bool> {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.delete(&id))
                .await
                .map_err(|e| Error::storage(format!("spawn_blocking failed: {e}")))?
        }

        /// Creates a verb asynchronously.
        pub async fn relate(
            &self,
            source: NounId,
            target: NounId,
            verb_type: VerbType,
        ) -> Result<VerbId> {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.relate(&source, &target, verb_type))
                .await
                .map_err(|e| Error::storage(format!("spawn_blocking failed: {e}")))?
        }

        /// Removes a verb asynchronously.
        pub async fn unrelate(&self, verb_id: VerbId) -> Result<bool> {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.unrelate(&verb_id))
                .await
                .map_err(|e| Error::storage(format!("spawn_blocking failed: {e}")))?
        }

        /// Fetches a noun asynchronously.
        pub async fn get(&self, id: NounId) -> Result<Option<Noun>> {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.get(&id))
                .await
                .map_err(|e| Error::storage(format!("spawn_blocking failed: {e}")))?
        }

        /// Runs a fused query asynchronously.
        pub async fn search(&self, query: TripleQuery) -> Result<SearchResults> {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.search(&query))
                .await
                .map_err(|e| Error::storage(format!("spawn_blocking failed: {e}")))?
        }

        /// Flushes asynchronously.
        pub async fn flush(&self) -> Result<()> {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.flush())
                .await
                .map_err(|e| Error::storage(format!("spawn_blocking failed: {e}")))?
        }

        /// Transaction statistics snapshot.
        pub fn stats(&self) -> TxnStats {
            self.inner.stats()
        }

        /// Reference to the sync store.
        pub fn inner(&self) -> &Store {
            &self.inner
        }
    }
}

#[cfg(feature = "async")]
pub use async_api::AsyncStore;
