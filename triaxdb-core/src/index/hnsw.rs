//! HNSW (Hierarchical Navigable Small World) vector index, partitioned by
//! noun type.
//!
//! HNSW builds a multi-layer proximity graph where layer 0 holds all
//! vectors with dense connections and higher layers hold progressively
//! fewer with sparser connections, like a skip list. Search starts at the
//! top layer and greedily descends to layer 0.
//!
//! Each noun type gets its own partition, so intra-type queries never touch
//! unrelated vectors. Deletes are tombstones filtered at read time; a
//! partition whose tombstone ratio crosses the configured threshold is
//! rebuilt in place. Partitions persist as framed binary blocks and load
//! lazily on the first query that touches their type; a corrupt block
//! quarantines its partition while the rest keep serving.
//!
//! # References
//!
//! - Malkov & Yashunin (2018): "Efficient and robust approximate nearest
//!   neighbor search using HNSW graphs"

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use roaring::RoaringBitmap;

use crate::cancel::CancelToken;
use crate::config::HnswConfig;
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::storage::{frame, keys, StorageAdapter};
use crate::types::{DocId, NounType};

/// A node in one partition's graph.
#[derive(Debug, Clone, PartialEq)]
struct Node {
    vector: Vec<f32>,
    /// Maximum layer this node appears in.
    level: usize,
    /// Neighbors at each layer. `neighbors[layer]` = connected doc ids.
    neighbors: Vec<Vec<DocId>>,
}

impl Node {
    fn new(vector: Vec<f32>, level: usize) -> Self {
        Self {
            vector,
            level,
            neighbors: vec![Vec::new(); level + 1],
        }
    }
}

/// One per-type slice of the index.
#[derive(Debug, Default, Clone, PartialEq)]
struct Partition {
    entry_point: Option<DocId>,
    max_level: usize,
    nodes: HashMap<DocId, Node>,
    tombstones: RoaringBitmap,
}

impl Partition {
    fn live_len(&self) -> usize {
        self.nodes.len() - self.tombstones.len() as usize
    }

    fn tombstone_ratio(&self) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        self.tombstones.len() as f64 / self.nodes.len() as f64
    }
}

/// A candidate during search, ordered closest-first (min-heap).
#[derive(Debug, Clone)]
struct Candidate {
    id: DocId,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap (lower distance = higher priority)
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
    }
}

/// A candidate ordered furthest-first (max-heap), bounding the result set.
#[derive(Debug, Clone)]
struct FurthestCandidate {
    id: DocId,
    distance: f32,
}

impl PartialEq for FurthestCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for FurthestCandidate {}

impl PartialOrd for FurthestCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FurthestCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

/// One vector search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub doc: DocId,
    pub distance: f32,
}

/// Result of a vector search: hits plus any per-partition warnings.
#[derive(Debug, Clone, Default)]
pub struct VectorSearch {
    /// Hits ascending by distance, ties broken by doc id.
    pub hits: Vec<VectorHit>,
    /// One entry per partition that could not serve (quarantined or
    /// structurally damaged).
    pub warnings: Vec<String>,
}

/// Type-partitioned HNSW index.
pub struct HnswIndex {
    dimension: usize,
    metric: DistanceMetric,
    config: HnswConfig,
    /// Level generation multiplier, `1 / ln(m)`.
    ml: f64,
    partitions: RwLock<HashMap<NounType, Arc<RwLock<Partition>>>>,
    /// Types whose partition is resident (fresh or loaded from storage).
    loaded: Mutex<HashSet<NounType>>,
    /// Types whose persisted block failed to decode.
    quarantined: Mutex<HashSet<NounType>>,
    /// Types mutated since the last flush.
    dirty: Mutex<HashSet<NounType>>,
}

impl HnswIndex {
    /// Creates an empty index.
    pub fn new(metric: DistanceMetric, dimension: usize, config: HnswConfig) -> Self {
        let ml = 1.0 / (config.m as f64).ln();
        Self {
            dimension,
            metric,
            config,
            ml,
            partitions: RwLock::new(HashMap::new()),
            loaded: Mutex::new(HashSet::new()),
            quarantined: Mutex::new(HashSet::new()),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the vector dimension.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Returns the distance metric.
    #[inline]
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Total live vectors across resident partitions.
    pub fn len(&self) -> usize {
        self.partitions
            .read()
            .values()
            .map(|p| p.read().live_len())
            .sum()
    }

    /// True if no resident partition holds a live vector.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn partition(&self, noun_type: &NounType) -> Arc<RwLock<Partition>> {
        if let Some(part) = self.partitions.read().get(noun_type) {
            return Arc::clone(part);
        }
        let mut parts = self.partitions.write();
        Arc::clone(
            parts
                .entry(noun_type.clone())
                .or_insert_with(|| Arc::new(RwLock::new(Partition::default()))),
        )
    }

    fn random_level(&self) -> usize {
        let r: f64 = rand::thread_rng().gen_range(f64::MIN_POSITIVE..1.0);
        (-r.ln() * self.ml).floor() as usize
    }

    fn is_quarantined(&self, noun_type: &NounType) -> bool {
        self.quarantined.lock().contains(noun_type)
    }

    /// Inserts a vector into its type partition.
    pub fn insert(&self, noun_type: &NounType, doc: DocId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::invalid(format!(
                "dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        if self.is_quarantined(noun_type) {
            return Err(Error::corrupt(format!(
                "partition '{noun_type}' is quarantined"
            )));
        }

        let part = self.partition(noun_type);
        let mut part = part.write();

        if part.tombstones.contains(doc) {
            // Slot is being reused after a delete; drop the stale node so
            // the insert below starts clean.
            self.unlink(&mut part, doc);
        } else if part.nodes.contains_key(&doc) {
            return Err(Error::AlreadyExists(format!("doc {doc}")));
        }

        self.insert_into(&mut part, doc, vector.to_vec());
        self.dirty.lock().insert(noun_type.clone());
        Ok(())
    }

    fn insert_into(&self, part: &mut Partition, doc: DocId, vector: Vec<f32>) {
        let new_level = self.random_level();
        let query = vector.clone();

        // First node becomes the entry point.
        let Some(entry_point) = part.entry_point else {
            part.nodes.insert(doc, Node::new(vector, new_level));
            part.entry_point = Some(doc);
            part.max_level = new_level;
            return;
        };

        // Phase 1: greedy descent from the top to new_level + 1.
        let mut current_ep = entry_point;
        for layer in (new_level + 1..=part.max_level).rev() {
            current_ep = self.greedy_search_single(part, &query, current_ep, layer);
        }

        // Phase 2: expand and connect on each layer from new_level down.
        part.nodes.insert(doc, Node::new(vector, new_level));
        let mut ep_set = vec![current_ep];
        for layer in (0..=new_level.min(part.max_level)).rev() {
            let candidates = self.search_layer(
                part,
                &query,
                &ep_set,
                self.config.ef_construction,
                layer,
                &CancelToken::new(),
            );
            let m = if layer == 0 { self.config.m0 } else { self.config.m };
            let neighbors = self.select_neighbors(part, &candidates, m);

            if let Some(node) = part.nodes.get_mut(&doc) {
                node.neighbors[layer] = neighbors.clone();
            }

            // Bidirectional links; re-prune any neighbor over its cap.
            for &neighbor_id in &neighbors {
                let Some(neighbor) = part.nodes.get_mut(&neighbor_id) else {
                    continue;
                };
                if layer >= neighbor.neighbors.len() {
                    continue;
                }
                neighbor.neighbors[layer].push(doc);
                if part.nodes[&neighbor_id].neighbors[layer].len() > m {
                    self.prune_neighbors(part, neighbor_id, layer, m);
                }
            }

            ep_set = candidates.iter().map(|c| c.id).collect();
        }

        if new_level > part.max_level {
            part.entry_point = Some(doc);
            part.max_level = new_level;
        }
    }

    fn prune_neighbors(&self, part: &mut Partition, id: DocId, layer: usize, m: usize) {
        let base_vec = part.nodes[&id].vector.clone();
        let current: Vec<Candidate> = part.nodes[&id].neighbors[layer]
            .iter()
            .filter_map(|&nid| {
                part.nodes.get(&nid).map(|n| Candidate {
                    id: nid,
                    distance: self.metric.compute(&base_vec, &n.vector),
                })
            })
            .collect();
        let pruned = self.select_neighbors(part, &current, m);
        if let Some(node) = part.nodes.get_mut(&id) {
            node.neighbors[layer] = pruned;
        }
    }

    /// Greedy search for the single nearest neighbor at one layer.
    fn greedy_search_single(
        &self,
        part: &Partition,
        query: &[f32],
        entry: DocId,
        layer: usize,
    ) -> DocId {
        let mut current = entry;
        let mut current_dist = match part.nodes.get(&current) {
            Some(node) => self.metric.compute(query, &node.vector),
            None => return current,
        };

        loop {
            let mut changed = false;
            let Some(node) = part.nodes.get(&current) else {
                break;
            };
            if layer < node.neighbors.len() {
                for &neighbor_id in &node.neighbors[layer] {
                    let Some(neighbor) = part.nodes.get(&neighbor_id) else {
                        continue;
                    };
                    let dist = self.metric.compute(query, &neighbor.vector);
                    if dist < current_dist {
                        current = neighbor_id;
                        current_dist = dist;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        current
    }

    /// Candidate expansion over one layer: a min-heap of frontier
    /// candidates against a bounded max-heap of the `ef` best results.
    fn search_layer(
        &self,
        part: &Partition,
        query: &[f32],
        entry_points: &[DocId],
        ef: usize,
        layer: usize,
        cancel: &CancelToken,
    ) -> Vec<Candidate> {
        let mut visited: HashSet<DocId> = HashSet::new();
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::new();
        let mut results: BinaryHeap<FurthestCandidate> = BinaryHeap::new();

        for &ep in entry_points {
            if visited.insert(ep) {
                let Some(node) = part.nodes.get(&ep) else {
                    continue;
                };
                let dist = self.metric.compute(query, &node.vector);
                candidates.push(Candidate { id: ep, distance: dist });
                results.push(FurthestCandidate { id: ep, distance: dist });
            }
        }

        while let Some(closest) = candidates.pop() {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(furthest) = results.peek() {
                if closest.distance > furthest.distance && results.len() >= ef {
                    break;
                }
            }

            if let Some(node) = part.nodes.get(&closest.id) {
                if layer < node.neighbors.len() {
                    for &neighbor_id in &node.neighbors[layer] {
                        if visited.insert(neighbor_id) {
                            let Some(neighbor) = part.nodes.get(&neighbor_id) else {
                                continue;
                            };
                            let dist = self.metric.compute(query, &neighbor.vector);

                            let should_add = results.len() < ef
                                || dist < results.peek().map(|f| f.distance).unwrap_or(f32::MAX);

                            if should_add {
                                candidates.push(Candidate {
                                    id: neighbor_id,
                                    distance: dist,
                                });
                                results.push(FurthestCandidate {
                                    id: neighbor_id,
                                    distance: dist,
                                });
                                while results.len() > ef {
                                    results.pop();
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut result_vec: Vec<_> = results
            .into_iter()
            .map(|f| Candidate {
                id: f.id,
                distance: f.distance,
            })
            .collect();
        result_vec.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        result_vec
    }

    /// Diversity-heuristic neighbor selection.
    ///
    /// A candidate is kept only when it is not closer to an already-kept
    /// neighbor than to the base point, which spreads links across
    /// directions instead of clustering them. Rejected candidates backfill
    /// remaining slots in distance order so low-degree nodes stay
    /// connected.
    fn select_neighbors(&self, part: &Partition, candidates: &[Candidate], m: usize) -> Vec<DocId> {
        let mut sorted: Vec<_> = candidates.to_vec();
        sorted.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });

        let mut seen: HashSet<DocId> = HashSet::with_capacity(sorted.len());
        let mut kept: Vec<Candidate> = Vec::with_capacity(m);
        let mut rejected: Vec<Candidate> = Vec::new();
        for cand in sorted {
            if kept.len() >= m {
                break;
            }
            if !seen.insert(cand.id) {
                continue;
            }
            let Some(cand_node) = part.nodes.get(&cand.id) else {
                continue;
            };
            let diverse = kept.iter().all(|k| {
                let Some(kept_node) = part.nodes.get(&k.id) else {
                    return true;
                };
                self.metric.compute(&cand_node.vector, &kept_node.vector) >= cand.distance
            });
            if diverse {
                kept.push(cand);
            } else {
                rejected.push(cand);
            }
        }
        for cand in rejected {
            if kept.len() >= m {
                break;
            }
            kept.push(cand);
        }

        kept.into_iter().map(|c| c.id).collect()
    }

    /// Searches the given type partitions for the `k` nearest neighbors.
    ///
    /// `ef` defaults to the configured search width and is clamped to at
    /// least `k`. Tombstoned docs are filtered after expansion.
    /// Quarantined partitions contribute a warning instead of hits.
    pub fn search(
        &self,
        types: &[NounType],
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        cancel: &CancelToken,
    ) -> Result<VectorSearch> {
        if query.len() != self.dimension {
            return Err(Error::invalid(format!(
                "dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }
        let ef = ef.unwrap_or(self.config.ef_search).max(k);

        let mut out = VectorSearch::default();
        for noun_type in types {
            cancel.check()?;
            if self.is_quarantined(noun_type) {
                out.warnings
                    .push(format!("partition '{noun_type}' is quarantined"));
                continue;
            }
            let Some(part) = self.partitions.read().get(noun_type).map(Arc::clone) else {
                continue;
            };
            let part = part.read();
            let Some(entry_point) = part.entry_point else {
                continue;
            };

            let mut current_ep = entry_point;
            for layer in (1..=part.max_level).rev() {
                current_ep = self.greedy_search_single(&part, query, current_ep, layer);
            }
            let candidates = self.search_layer(&part, query, &[current_ep], ef, 0, cancel);
            cancel.check()?;

            out.hits.extend(
                candidates
                    .into_iter()
                    .filter(|c| !part.tombstones.contains(c.id))
                    .take(k)
                    .map(|c| VectorHit {
                        doc: c.id,
                        distance: c.distance,
                    }),
            );
        }

        out.hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then(a.doc.cmp(&b.doc))
        });
        out.hits.truncate(k);
        Ok(out)
    }

    /// Returns the stored vector of a live doc.
    pub fn vector_of(&self, noun_type: &NounType, doc: DocId) -> Option<Vec<f32>> {
        let parts = self.partitions.read();
        let part = parts.get(noun_type)?.read();
        if part.tombstones.contains(doc) {
            return None;
        }
        part.nodes.get(&doc).map(|n| n.vector.clone())
    }

    /// Tombstones a doc. Neighbor lists keep the dead id until compaction;
    /// searches filter it. Returns true if the doc was live.
    pub fn remove(&self, noun_type: &NounType, doc: DocId) -> bool {
        let Some(part) = self.partitions.read().get(noun_type).map(Arc::clone) else {
            return false;
        };
        let mut part = part.write();
        if !part.nodes.contains_key(&doc) || part.tombstones.contains(doc) {
            return false;
        }
        part.tombstones.insert(doc);
        self.dirty.lock().insert(noun_type.clone());

        if part.tombstone_ratio() > self.config.tombstone_compact_ratio {
            self.compact(&mut part);
            tracing::debug!(%noun_type, "compacted partition after tombstone threshold");
        }
        true
    }

    /// Fully unlinks a node, repairing neighbor lists. Used when a doc id
    /// is reused before compaction ran.
    fn unlink(&self, part: &mut Partition, doc: DocId) {
        if let Some(node) = part.nodes.remove(&doc) {
            for (layer, neighbors) in node.neighbors.iter().enumerate() {
                for &neighbor_id in neighbors {
                    if let Some(neighbor) = part.nodes.get_mut(&neighbor_id) {
                        if layer < neighbor.neighbors.len() {
                            neighbor.neighbors[layer].retain(|&nid| nid != doc);
                        }
                    }
                }
            }
            part.tombstones.remove(doc);
            if part.entry_point == Some(doc) {
                part.entry_point = part.nodes.keys().min().copied();
                part.max_level = part.nodes.values().map(|n| n.level).max().unwrap_or(0);
            }
        }
    }

    /// Rebuilds a partition from its live nodes, dropping tombstones.
    fn compact(&self, part: &mut Partition) {
        let mut live: Vec<(DocId, Vec<f32>)> = part
            .nodes
            .iter()
            .filter(|(doc, _)| !part.tombstones.contains(**doc))
            .map(|(doc, node)| (*doc, node.vector.clone()))
            .collect();
        live.sort_by_key(|(doc, _)| *doc);

        let mut fresh = Partition::default();
        for (doc, vector) in live {
            self.insert_into(&mut fresh, doc, vector);
        }
        *part = fresh;
    }

    /// Loads the partition for a type from storage if it is not resident.
    ///
    /// A corrupt block quarantines the partition and reports through
    /// search warnings; other partitions are unaffected.
    pub fn ensure_loaded(&self, noun_type: &NounType, adapter: &dyn StorageAdapter) -> Result<()> {
        if self.loaded.lock().contains(noun_type) || self.is_quarantined(noun_type) {
            return Ok(());
        }

        let key = keys::hnsw_partition(noun_type, 0);
        match adapter.get(&key)? {
            None => {
                self.loaded.lock().insert(noun_type.clone());
            }
            Some(bytes) => {
                match frame::decode(&bytes, frame::HNSW_PARTITION_V1)
                    .and_then(|payload| self.deserialize_partition(payload))
                {
                    Ok(part) => {
                        self.partitions
                            .write()
                            .insert(noun_type.clone(), Arc::new(RwLock::new(part)));
                        self.loaded.lock().insert(noun_type.clone());
                    }
                    Err(err) => {
                        tracing::warn!(%noun_type, error = %err, "quarantining corrupt partition");
                        self.quarantined.lock().insert(noun_type.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Marks a type resident without touching storage. Used for stores
    /// built fresh in memory.
    pub fn mark_loaded(&self, noun_type: &NounType) {
        self.loaded.lock().insert(noun_type.clone());
    }

    /// Persists every dirty partition.
    pub fn flush(&self, adapter: &dyn StorageAdapter) -> Result<()> {
        let dirty: Vec<NounType> = {
            let mut guard = self.dirty.lock();
            guard.drain().collect()
        };
        for noun_type in dirty {
            let Some(part) = self.partitions.read().get(&noun_type).map(Arc::clone) else {
                continue;
            };
            let payload = self.serialize_partition(&part.read())?;
            adapter.put(
                &keys::hnsw_partition(&noun_type, 0),
                &frame::encode(frame::HNSW_PARTITION_V1, &payload),
            )?;
        }
        Ok(())
    }

    fn serialize_partition(&self, part: &Partition) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        out.extend_from_slice(&(self.config.m as u16).to_le_bytes());
        out.extend_from_slice(&(self.config.m0 as u16).to_le_bytes());
        out.extend_from_slice(&(part.max_level as u16).to_le_bytes());
        match part.entry_point {
            Some(ep) => {
                out.push(1);
                out.extend_from_slice(&ep.to_le_bytes());
            }
            None => {
                out.push(0);
                out.extend_from_slice(&0u32.to_le_bytes());
            }
        }
        out.extend_from_slice(&(part.nodes.len() as u32).to_le_bytes());

        let mut tombstone_bytes = Vec::with_capacity(part.tombstones.serialized_size());
        part.tombstones
            .serialize_into(&mut tombstone_bytes)
            .map_err(|e| Error::corrupt(format!("tombstone serialize failed: {e}")))?;
        out.extend_from_slice(&(tombstone_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&tombstone_bytes);

        // Adjacency blocks, ascending doc order so re-serialization is
        // byte-identical.
        let mut docs: Vec<DocId> = part.nodes.keys().copied().collect();
        docs.sort_unstable();
        for &doc in &docs {
            let node = &part.nodes[&doc];
            out.extend_from_slice(&doc.to_le_bytes());
            out.extend_from_slice(&(node.level as u16).to_le_bytes());
            for layer in &node.neighbors {
                out.extend_from_slice(&(layer.len() as u16).to_le_bytes());
                for &neighbor in layer {
                    out.extend_from_slice(&neighbor.to_le_bytes());
                }
            }
        }

        // Dense vector block in the same doc order.
        for &doc in &docs {
            for value in &part.nodes[&doc].vector {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        Ok(out)
    }

    fn deserialize_partition(&self, payload: &[u8]) -> Result<Partition> {
        let mut cursor = Cursor::new(payload);
        let dimension = read_u32(&mut cursor)? as usize;
        if dimension != self.dimension {
            return Err(Error::corrupt(format!(
                "partition dimension {dimension} does not match store dimension {}",
                self.dimension
            )));
        }
        let _m = read_u16(&mut cursor)?;
        let _m0 = read_u16(&mut cursor)?;
        let max_level = read_u16(&mut cursor)? as usize;
        let has_entry = read_u8(&mut cursor)? != 0;
        let entry_raw = read_u32(&mut cursor)?;
        let node_count = read_u32(&mut cursor)? as usize;

        let tombstone_len = read_u32(&mut cursor)? as usize;
        let start = cursor.position() as usize;
        let data = *cursor.get_ref();
        let end = start
            .checked_add(tombstone_len)
            .filter(|e| *e <= data.len())
            .ok_or_else(|| Error::corrupt("partition truncated in tombstones"))?;
        let tombstones = RoaringBitmap::deserialize_from(&data[start..end])
            .map_err(|e| Error::corrupt(format!("tombstone deserialize failed: {e}")))?;
        cursor.set_position(end as u64);

        let mut docs = Vec::with_capacity(node_count);
        let mut nodes = HashMap::with_capacity(node_count);
        for _ in 0..node_count {
            let doc = read_u32(&mut cursor)?;
            let level = read_u16(&mut cursor)? as usize;
            let mut neighbors = Vec::with_capacity(level + 1);
            for _ in 0..=level {
                let count = read_u16(&mut cursor)? as usize;
                let mut layer = Vec::with_capacity(count);
                for _ in 0..count {
                    layer.push(read_u32(&mut cursor)?);
                }
                neighbors.push(layer);
            }
            docs.push(doc);
            nodes.insert(
                doc,
                Node {
                    vector: Vec::new(),
                    level,
                    neighbors,
                },
            );
        }

        for &doc in &docs {
            let mut vector = Vec::with_capacity(dimension);
            for _ in 0..dimension {
                vector.push(read_f32(&mut cursor)?);
            }
            if let Some(node) = nodes.get_mut(&doc) {
                node.vector = vector;
            }
        }

        let entry_point = if has_entry {
            if !nodes.contains_key(&entry_raw) {
                return Err(Error::corrupt("partition entry point missing vector"));
            }
            Some(entry_raw)
        } else {
            None
        };

        Ok(Partition {
            entry_point,
            max_level,
            nodes,
            tombstones,
        })
    }
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let pos = cursor.position() as usize;
    let data = *cursor.get_ref();
    let byte = *data
        .get(pos)
        .ok_or_else(|| Error::corrupt("partition truncated"))?;
    cursor.set_position((pos + 1) as u64);
    Ok(byte)
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    let pos = cursor.position() as usize;
    let data = *cursor.get_ref();
    if pos + 2 > data.len() {
        return Err(Error::corrupt("partition truncated"));
    }
    cursor.set_position((pos + 2) as u64);
    Ok(u16::from_le_bytes(data[pos..pos + 2].try_into().unwrap()))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let pos = cursor.position() as usize;
    let data = *cursor.get_ref();
    if pos + 4 > data.len() {
        return Err(Error::corrupt("partition truncated"));
    }
    cursor.set_position((pos + 4) as u64);
    Ok(u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()))
}

fn read_f32(cursor: &mut Cursor<&[u8]>) -> Result<f32> {
    Ok(f32::from_bits(read_u32(cursor)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAdapter;

    fn index() -> HnswIndex {
        HnswIndex::new(DistanceMetric::Euclidean, 3, HnswConfig::with_m(4))
    }

    fn seeded(index: &HnswIndex) {
        let t = NounType::CONCEPT;
        index.insert(&t, 1, &[1.0, 0.0, 0.0]).unwrap();
        index.insert(&t, 2, &[0.0, 1.0, 0.0]).unwrap();
        index.insert(&t, 3, &[0.0, 0.0, 1.0]).unwrap();
        index.insert(&t, 4, &[1.0, 1.0, 0.0]).unwrap();
        index.insert(&t, 5, &[1.0, 0.0, 1.0]).unwrap();
    }

    #[test]
    fn test_insert_and_search() {
        let idx = index();
        seeded(&idx);

        let result = idx
            .search(&[NounType::CONCEPT], &[1.0, 0.0, 0.0], 1, None, &CancelToken::new())
            .unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].doc, 1);
        assert!(result.hits[0].distance < 1e-6);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_results_sorted_by_distance() {
        let idx = index();
        seeded(&idx);

        let result = idx
            .search(&[NounType::CONCEPT], &[1.0, 0.0, 0.0], 3, None, &CancelToken::new())
            .unwrap();
        assert_eq!(result.hits.len(), 3);
        for pair in result.hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn test_duplicate_doc_rejected() {
        let idx = index();
        seeded(&idx);
        let err = idx.insert(&NounType::CONCEPT, 1, &[0.5, 0.5, 0.5]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let idx = index();
        assert!(idx.insert(&NounType::CONCEPT, 1, &[1.0, 2.0]).is_err());
        assert!(idx
            .search(&[NounType::CONCEPT], &[1.0], 1, None, &CancelToken::new())
            .is_err());
    }

    #[test]
    fn test_partitions_are_isolated() {
        let idx = index();
        idx.insert(&NounType::CONCEPT, 1, &[1.0, 0.0, 0.0]).unwrap();
        idx.insert(&NounType::DOCUMENT, 2, &[1.0, 0.0, 0.0]).unwrap();

        let result = idx
            .search(&[NounType::CONCEPT], &[1.0, 0.0, 0.0], 10, None, &CancelToken::new())
            .unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].doc, 1);

        let both = idx
            .search(
                &[NounType::CONCEPT, NounType::DOCUMENT],
                &[1.0, 0.0, 0.0],
                10,
                None,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(both.hits.len(), 2);
    }

    #[test]
    fn test_remove_tombstones_doc() {
        let idx = index();
        seeded(&idx);

        assert!(idx.remove(&NounType::CONCEPT, 1));
        assert!(!idx.remove(&NounType::CONCEPT, 1));
        assert_eq!(idx.len(), 4);
        assert!(idx.vector_of(&NounType::CONCEPT, 1).is_none());

        let result = idx
            .search(&[NounType::CONCEPT], &[1.0, 0.0, 0.0], 10, None, &CancelToken::new())
            .unwrap();
        assert!(result.hits.iter().all(|h| h.doc != 1));
    }

    #[test]
    fn test_compaction_after_heavy_deletes() {
        let idx = HnswIndex::new(DistanceMetric::Euclidean, 3, HnswConfig::with_m(4));
        let t = NounType::CONCEPT;
        for doc in 0..20u32 {
            let f = doc as f32;
            idx.insert(&t, doc, &[f.sin(), f.cos(), 1.0]).unwrap();
        }
        for doc in 0..10u32 {
            idx.remove(&t, doc);
        }

        // The tombstone ratio crossed 30% along the way, so the partition
        // was rebuilt at least once: dead nodes are physically gone and
        // the remaining ratio is back under the threshold.
        let parts = idx.partitions.read();
        let part = parts.get(&t).unwrap().read();
        assert!(part.nodes.len() < 20);
        assert_eq!(part.live_len(), 10);
        assert!(part.tombstone_ratio() <= 0.3);
        drop(part);
        drop(parts);

        let result = idx
            .search(&[t], &[0.0, 1.0, 1.0], 10, None, &CancelToken::new())
            .unwrap();
        assert_eq!(result.hits.len(), 10);
        assert!(result.hits.iter().all(|h| h.doc >= 10));
    }

    #[test]
    fn test_cancel_stops_search() {
        let idx = index();
        seeded(&idx);
        let token = CancelToken::new();
        token.cancel();
        let err = idx
            .search(&[NounType::CONCEPT], &[1.0, 0.0, 0.0], 1, None, &token)
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_persistence_round_trip() {
        let adapter = MemoryAdapter::new();
        let idx = index();
        seeded(&idx);
        idx.remove(&NounType::CONCEPT, 3);
        idx.flush(&adapter).unwrap();

        let reloaded = index();
        reloaded
            .ensure_loaded(&NounType::CONCEPT, &adapter)
            .unwrap();
        let result = reloaded
            .search(&[NounType::CONCEPT], &[1.0, 0.0, 0.0], 10, None, &CancelToken::new())
            .unwrap();
        assert_eq!(result.hits.len(), 4);
        assert_eq!(result.hits[0].doc, 1);
        assert!(result.hits.iter().all(|h| h.doc != 3));
    }

    #[test]
    fn test_reserialization_is_byte_identical() {
        let adapter = MemoryAdapter::new();
        let idx = index();
        seeded(&idx);
        idx.flush(&adapter).unwrap();
        let first = adapter.get("hnsw/Concept/partition-0").unwrap().unwrap();

        let reloaded = index();
        reloaded
            .ensure_loaded(&NounType::CONCEPT, &adapter)
            .unwrap();
        let parts = reloaded.partitions.read();
        let part = parts.get(&NounType::CONCEPT).unwrap().read();
        let payload = reloaded.serialize_partition(&part).unwrap();
        assert_eq!(frame::encode(frame::HNSW_PARTITION_V1, &payload), first);
    }

    #[test]
    fn test_corrupt_partition_quarantined() {
        let adapter = MemoryAdapter::new();
        let idx = index();
        seeded(&idx);
        idx.insert(&NounType::DOCUMENT, 100, &[0.0, 1.0, 0.0]).unwrap();
        idx.flush(&adapter).unwrap();

        // Damage the Concept block only.
        let mut bytes = adapter.get("hnsw/Concept/partition-0").unwrap().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        adapter.put("hnsw/Concept/partition-0", &bytes).unwrap();

        let reloaded = index();
        reloaded
            .ensure_loaded(&NounType::CONCEPT, &adapter)
            .unwrap();
        reloaded
            .ensure_loaded(&NounType::DOCUMENT, &adapter)
            .unwrap();

        let result = reloaded
            .search(
                &[NounType::CONCEPT, NounType::DOCUMENT],
                &[0.0, 1.0, 0.0],
                10,
                None,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("Concept"));
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].doc, 100);

        // Direct writes to the quarantined partition fail loudly.
        let err = reloaded
            .insert(&NounType::CONCEPT, 7, &[0.1, 0.2, 0.3])
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IndexCorrupt);
    }

    #[test]
    fn test_search_deterministic_on_frozen_index() {
        let idx = HnswIndex::new(DistanceMetric::Euclidean, 4, HnswConfig::default());
        let t = NounType::CONCEPT;
        for doc in 0..100u32 {
            let f = doc as f32;
            idx.insert(&t, doc, &[f.sin(), f.cos(), (f * 0.3).sin(), 1.0])
                .unwrap();
        }

        let query = [0.4, 0.2, 0.9, 1.0];
        let first = idx
            .search(&[t.clone()], &query, 10, Some(64), &CancelToken::new())
            .unwrap();
        for _ in 0..5 {
            let again = idx
                .search(&[t.clone()], &query, 10, Some(64), &CancelToken::new())
                .unwrap();
            assert_eq!(again.hits, first.hits);
        }
    }

    #[test]
    fn test_recall_vs_exhaustive_scan() {
        let config = HnswConfig {
            m: 16,
            m0: 32,
            ef_construction: 200,
            ef_search: 100,
            ..Default::default()
        };
        let idx = HnswIndex::new(DistanceMetric::Euclidean, 8, config);
        let t = NounType::CONCEPT;

        let mut vectors = Vec::new();
        for i in 0..200u32 {
            let v: Vec<f32> = (0..8).map(|j| ((i * 8 + j) as f32).sin()).collect();
            vectors.push((i, v.clone()));
            idx.insert(&t, i, &v).unwrap();
        }

        let mut total_recall = 0.0;
        let num_queries = 10;
        let k = 10;
        for q in 0..num_queries {
            let query: Vec<f32> = (0..8).map(|j| ((q * 7 + j) as f32).cos()).collect();

            let approx: HashSet<_> = idx
                .search(&[t.clone()], &query, k, Some(200), &CancelToken::new())
                .unwrap()
                .hits
                .iter()
                .map(|h| h.doc)
                .collect();

            let mut exact: Vec<_> = vectors
                .iter()
                .map(|(doc, v)| (*doc, crate::distance::euclidean_distance(&query, v)))
                .collect();
            exact.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            let exact: HashSet<_> = exact.iter().take(k).map(|(doc, _)| *doc).collect();

            total_recall += approx.intersection(&exact).count() as f64 / k as f64;
        }

        let avg_recall = total_recall / num_queries as f64;
        assert!(
            avg_recall >= 0.7,
            "average recall {avg_recall:.2} is below threshold 0.7"
        );
    }
}
