//! Graph adjacency index over verbs.
//!
//! Two mirrored mappings give O(1) neighbor enumeration by `(noun,
//! verb type)` in either direction; edges are stored as compact records.
//! Traversals (shortest path, bounded neighborhood) use explicit visited
//! sets, never in-memory object pointers, so noun/verb cycles cannot loop.
//!
//! The in-memory index is rebuilt lazily on the first graph query after
//! open. The rebuild reads only the raw `verbs/` prefix through the
//! storage adapter, taking `&dyn StorageAdapter` by signature: it cannot
//! call back into any index accessor, which is what makes the lazy path
//! re-entry-free. The built state is handed off under a brief write lock.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::storage::{keys, records, frame, StorageAdapter};
use crate::types::{NounId, Verb, VerbId, VerbType};

/// Compact edge record kept on both sides of the adjacency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub verb_id: VerbId,
    /// The endpoint on the far side (target for `out`, source for `in`).
    pub other: NounId,
    pub weight: f32,
    /// Content hash of the verb metadata; parallel edges collapse on it.
    pub meta_hash: u32,
}

/// Traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Out,
    In,
    Both,
}

/// One enumerated neighbor.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub verb_id: VerbId,
    pub noun_id: NounId,
    pub verb_type: VerbType,
    pub weight: f32,
    /// True when the endpoint noun has been deleted; callers may filter.
    pub deleted: bool,
}

/// Cost model for weighted traversal.
#[derive(Clone, Default)]
pub enum EdgeCost {
    /// `1 / weight` — heavier edges are shorter. The default.
    #[default]
    InverseWeight,
    /// Every edge costs 1 (pure hop count).
    Unit,
    /// Caller-supplied cost of an edge weight.
    Custom(Arc<dyn Fn(f32) -> f64 + Send + Sync>),
}

impl std::fmt::Debug for EdgeCost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InverseWeight => f.write_str("InverseWeight"),
            Self::Unit => f.write_str("Unit"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl EdgeCost {
    fn cost(&self, weight: f32) -> f64 {
        match self {
            Self::InverseWeight => {
                if weight > 0.0 {
                    1.0 / f64::from(weight)
                } else {
                    f64::INFINITY
                }
            }
            Self::Unit => 1.0,
            Self::Custom(f) => f(weight),
        }
    }
}

/// Options for [`GraphAdjacencyIndex::shortest_path`].
#[derive(Debug, Clone)]
pub struct PathOptions {
    /// Maximum number of hops to expand.
    pub max_depth: usize,
    /// Verb types to traverse; `None` means all.
    pub allowed_verb_types: Option<Vec<VerbType>>,
    pub direction: Direction,
    pub weight_fn: EdgeCost,
}

impl Default for PathOptions {
    fn default() -> Self {
        Self {
            max_depth: 6,
            allowed_verb_types: None,
            direction: Direction::Out,
            weight_fn: EdgeCost::default(),
        }
    }
}

/// A found path, cheapest-first endpoints inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub nodes: Vec<NounId>,
    pub verbs: Vec<VerbId>,
    pub cost: f64,
}

impl Path {
    /// Number of edges on the path.
    pub fn hops(&self) -> usize {
        self.verbs.len()
    }
}

type AdjacencyMap = HashMap<NounId, BTreeMap<VerbType, Vec<EdgeRecord>>>;

#[derive(Debug, Default)]
struct GraphState {
    out: AdjacencyMap,
    inc: AdjacencyMap,
    /// Verb id -> (source, target, type) for O(1) removal.
    verbs: HashMap<VerbId, (NounId, NounId, VerbType)>,
    /// Nouns logically deleted; their in-edges surface `deleted: true`.
    deleted: HashSet<NounId>,
    /// True once any edge with weight != 1 exists; picks Dijkstra over BFS.
    varying_weights: bool,
    built: bool,
}

impl GraphState {
    fn add_edge(&mut self, verb: &Verb) -> bool {
        let meta_hash = verb.metadata.content_hash();
        let existing = self
            .out
            .get(&verb.source)
            .and_then(|types| types.get(&verb.verb_type))
            .is_some_and(|edges| {
                edges
                    .iter()
                    .any(|e| e.other == verb.target && e.meta_hash == meta_hash)
            });
        if existing {
            return false;
        }

        self.out
            .entry(verb.source.clone())
            .or_default()
            .entry(verb.verb_type.clone())
            .or_default()
            .push(EdgeRecord {
                verb_id: verb.id.clone(),
                other: verb.target.clone(),
                weight: verb.weight,
                meta_hash,
            });
        self.inc
            .entry(verb.target.clone())
            .or_default()
            .entry(verb.verb_type.clone())
            .or_default()
            .push(EdgeRecord {
                verb_id: verb.id.clone(),
                other: verb.source.clone(),
                weight: verb.weight,
                meta_hash,
            });
        self.verbs.insert(
            verb.id.clone(),
            (verb.source.clone(), verb.target.clone(), verb.verb_type.clone()),
        );
        if verb.weight != 1.0 {
            self.varying_weights = true;
        }
        true
    }

    fn remove_edge(&mut self, verb_id: &VerbId) -> Option<(NounId, NounId)> {
        let (source, target, verb_type) = self.verbs.remove(verb_id)?;
        if let Some(types) = self.out.get_mut(&source) {
            if let Some(edges) = types.get_mut(&verb_type) {
                edges.retain(|e| e.verb_id != *verb_id);
                if edges.is_empty() {
                    types.remove(&verb_type);
                }
            }
            if types.is_empty() {
                self.out.remove(&source);
            }
        }
        if let Some(types) = self.inc.get_mut(&target) {
            if let Some(edges) = types.get_mut(&verb_type) {
                edges.retain(|e| e.verb_id != *verb_id);
                if edges.is_empty() {
                    types.remove(&verb_type);
                }
            }
            if types.is_empty() {
                self.inc.remove(&target);
            }
        }
        Some((source, target))
    }

    fn edges_of<'a>(
        &'a self,
        id: &NounId,
        direction: Direction,
        allowed: Option<&'a [VerbType]>,
    ) -> impl Iterator<Item = (&'a VerbType, &'a EdgeRecord)> + 'a {
        let pick = move |map: &'a AdjacencyMap| {
            map.get(id).into_iter().flat_map(move |types| {
                types
                    .iter()
                    .filter(move |(vt, _)| allowed.is_none_or(|a| a.contains(*vt)))
                    .flat_map(|(vt, edges)| edges.iter().map(move |e| (vt, e)))
            })
        };
        let out_iter = matches!(direction, Direction::Out | Direction::Both)
            .then(|| pick(&self.out))
            .into_iter()
            .flatten();
        let in_iter = matches!(direction, Direction::In | Direction::Both)
            .then(|| pick(&self.inc))
            .into_iter()
            .flatten();
        out_iter.chain(in_iter)
    }
}

/// Dijkstra frontier entry ordered cheapest-first, ties by id for
/// determinism.
struct Frontier {
    cost: f64,
    depth: usize,
    id: NounId,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.id == other.id
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap.
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Typed directed adjacency over all verbs in a store.
#[derive(Debug, Default)]
pub struct GraphAdjacencyIndex {
    state: RwLock<GraphState>,
    /// Nouns whose adjacency blocks changed since the last flush.
    dirty: Mutex<HashSet<NounId>>,
}

impl GraphAdjacencyIndex {
    /// Creates an empty, already-built index (fresh stores).
    pub fn new() -> Self {
        let index = Self::default();
        index.state.write().built = true;
        index
    }

    /// Creates an unbuilt index that will rebuild from storage on first
    /// graph query (reopened stores).
    pub fn unbuilt() -> Self {
        Self::default()
    }

    /// True once the in-memory adjacency is usable.
    pub fn is_built(&self) -> bool {
        self.state.read().built
    }

    /// Total number of edges.
    pub fn edge_count(&self) -> usize {
        self.state.read().verbs.len()
    }

    /// Adds an edge to both sides. Idempotent on
    /// `(source, target, type, metadata hash)`; returns false on a
    /// duplicate.
    pub fn add_edge(&self, verb: &Verb) -> bool {
        let mut state = self.state.write();
        let added = state.add_edge(verb);
        if added {
            let mut dirty = self.dirty.lock();
            dirty.insert(verb.source.clone());
            dirty.insert(verb.target.clone());
            // A re-created noun is live again.
            state.deleted.remove(&verb.source);
            state.deleted.remove(&verb.target);
        }
        added
    }

    /// Removes an edge from both sides. Returns the endpoints if it
    /// existed.
    pub fn remove_edge(&self, verb_id: &VerbId) -> Option<(NounId, NounId)> {
        let mut state = self.state.write();
        let removed = state.remove_edge(verb_id);
        if let Some((source, target)) = &removed {
            let mut dirty = self.dirty.lock();
            dirty.insert(source.clone());
            dirty.insert(target.clone());
        }
        removed
    }

    /// Resolves a verb id to `(source, target, type)` if indexed.
    pub fn resolve_verb(&self, verb_id: &VerbId) -> Option<(NounId, NounId, VerbType)> {
        self.state.read().verbs.get(verb_id).cloned()
    }

    /// Removes a deleted noun: its outgoing edges disappear, and verbs
    /// still targeting it will surface `deleted: true` until their sources
    /// go too. Returns the verb ids of the removed outgoing edges.
    pub fn remove_noun(&self, id: &NounId) -> Vec<VerbId> {
        let mut state = self.state.write();
        let out_ids: Vec<VerbId> = state
            .out
            .get(id)
            .map(|types| {
                types
                    .values()
                    .flat_map(|edges| edges.iter().map(|e| e.verb_id.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for verb_id in &out_ids {
            state.remove_edge(verb_id);
        }
        state.deleted.insert(id.clone());
        self.dirty.lock().insert(id.clone());
        out_ids
    }

    /// Marks a noun as deleted without touching edges. Used during open
    /// reconciliation for endpoints whose records are gone.
    pub fn mark_deleted(&self, id: &NounId) {
        self.state.write().deleted.insert(id.clone());
    }

    /// Clears a noun's deleted flag; a re-created noun is live again.
    pub fn mark_live(&self, id: &NounId) {
        self.state.write().deleted.remove(id);
    }

    /// Finds the edge matching `(source, type, target, metadata hash)`, if
    /// one exists. This is the idempotency probe behind `relate`.
    pub fn find_edge(
        &self,
        source: &NounId,
        verb_type: &VerbType,
        target: &NounId,
        meta_hash: u32,
    ) -> Option<VerbId> {
        let state = self.state.read();
        state
            .out
            .get(source)?
            .get(verb_type)?
            .iter()
            .find(|e| e.other == *target && e.meta_hash == meta_hash)
            .map(|e| e.verb_id.clone())
    }

    /// Collects every edge reachable within `depth` hops of `start`,
    /// deduplicated by verb id, in BFS discovery order.
    pub fn edges_within(
        &self,
        start: &NounId,
        depth: usize,
        direction: Direction,
        types: Option<&[VerbType]>,
        cancel: &CancelToken,
    ) -> Result<Vec<Neighbor>> {
        let state = self.state.read();
        let mut seen_verbs: HashSet<VerbId> = HashSet::new();
        let mut visited: HashSet<NounId> = HashSet::from([start.clone()]);
        let mut queue: VecDeque<(NounId, usize)> = VecDeque::from([(start.clone(), 0)]);
        let mut edges = Vec::new();

        while let Some((current, hops)) = queue.pop_front() {
            cancel.check()?;
            if hops == depth {
                continue;
            }
            for (verb_type, edge) in state.edges_of(&current, direction, types) {
                if seen_verbs.insert(edge.verb_id.clone()) {
                    edges.push(Neighbor {
                        verb_id: edge.verb_id.clone(),
                        noun_id: edge.other.clone(),
                        verb_type: verb_type.clone(),
                        weight: edge.weight,
                        deleted: state.deleted.contains(&edge.other),
                    });
                }
                if !state.deleted.contains(&edge.other) && visited.insert(edge.other.clone()) {
                    queue.push_back((edge.other.clone(), hops + 1));
                }
            }
        }
        Ok(edges)
    }

    /// Every endpoint currently referenced by an edge.
    pub fn endpoints(&self) -> Vec<NounId> {
        let state = self.state.read();
        let mut ids: HashSet<NounId> = HashSet::new();
        for (source, target, _) in state.verbs.values() {
            ids.insert(source.clone());
            ids.insert(target.clone());
        }
        ids.into_iter().collect()
    }

    /// O(1) adjacency lookup plus O(degree) enumeration.
    pub fn neighbors(
        &self,
        id: &NounId,
        direction: Direction,
        types: Option<&[VerbType]>,
    ) -> Vec<Neighbor> {
        let state = self.state.read();
        state
            .edges_of(id, direction, types)
            .map(|(verb_type, edge)| Neighbor {
                verb_id: edge.verb_id.clone(),
                noun_id: edge.other.clone(),
                verb_type: verb_type.clone(),
                weight: edge.weight,
                deleted: state.deleted.contains(&edge.other),
            })
            .collect()
    }

    /// Bounded BFS returning every noun within `radius` hops, including
    /// the start at hop 0. Radius 0 returns the start set only.
    pub fn neighborhood(
        &self,
        id: &NounId,
        radius: usize,
        direction: Direction,
        types: Option<&[VerbType]>,
        cancel: &CancelToken,
    ) -> Result<Vec<(NounId, usize)>> {
        let mut found: Vec<(NounId, usize)> = self
            .hops_from(std::slice::from_ref(id), radius, direction, types, cancel)?
            .into_iter()
            .collect();
        found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(found)
    }

    /// BFS hop distance from a start set, bounded by `max_depth`.
    pub fn hops_from(
        &self,
        starts: &[NounId],
        max_depth: usize,
        direction: Direction,
        types: Option<&[VerbType]>,
        cancel: &CancelToken,
    ) -> Result<HashMap<NounId, usize>> {
        let state = self.state.read();
        let mut hops: HashMap<NounId, usize> = HashMap::new();
        let mut queue: VecDeque<(NounId, usize)> = VecDeque::new();
        for start in starts {
            if hops.insert(start.clone(), 0).is_none() {
                queue.push_back((start.clone(), 0));
            }
        }

        while let Some((current, depth)) = queue.pop_front() {
            cancel.check()?;
            if depth == max_depth {
                continue;
            }
            for (_, edge) in state.edges_of(&current, direction, types) {
                if state.deleted.contains(&edge.other) {
                    continue;
                }
                if !hops.contains_key(&edge.other) {
                    hops.insert(edge.other.clone(), depth + 1);
                    queue.push_back((edge.other.clone(), depth + 1));
                }
            }
        }
        Ok(hops)
    }

    /// Cheapest path from `src` to `dst`.
    ///
    /// Uses plain BFS while every indexed edge still has the default
    /// weight and the cost model is the default; switches to Dijkstra as
    /// soon as weights vary. Returns `None` when no path exists within
    /// `max_depth` hops.
    pub fn shortest_path(
        &self,
        src: &NounId,
        dst: &NounId,
        opts: &PathOptions,
        cancel: &CancelToken,
    ) -> Result<Option<Path>> {
        let state = self.state.read();
        if state.deleted.contains(src) || state.deleted.contains(dst) {
            return Ok(None);
        }
        if src == dst {
            return Ok(Some(Path {
                nodes: vec![src.clone()],
                verbs: Vec::new(),
                cost: 0.0,
            }));
        }

        let uniform = !state.varying_weights && matches!(opts.weight_fn, EdgeCost::InverseWeight)
            || matches!(opts.weight_fn, EdgeCost::Unit);
        let allowed = opts.allowed_verb_types.as_deref();

        // predecessor map: node -> (previous node, verb, edge cost)
        let mut prev: HashMap<NounId, (NounId, VerbId, f64)> = HashMap::new();

        let found = if uniform {
            self.bfs_path(&state, src, dst, opts, allowed, &mut prev, cancel)?
        } else {
            self.dijkstra_path(&state, src, dst, opts, allowed, &mut prev, cancel)?
        };
        if !found {
            return Ok(None);
        }

        // Walk predecessors back to the start.
        let mut nodes = vec![dst.clone()];
        let mut verbs = Vec::new();
        let mut cost = 0.0;
        let mut current = dst.clone();
        while let Some((previous, verb, edge_cost)) = prev.get(&current) {
            verbs.push(verb.clone());
            cost += edge_cost;
            nodes.push(previous.clone());
            current = previous.clone();
        }
        nodes.reverse();
        verbs.reverse();
        Ok(Some(Path { nodes, verbs, cost }))
    }

    fn bfs_path(
        &self,
        state: &GraphState,
        src: &NounId,
        dst: &NounId,
        opts: &PathOptions,
        allowed: Option<&[VerbType]>,
        prev: &mut HashMap<NounId, (NounId, VerbId, f64)>,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let mut visited: HashSet<NounId> = HashSet::from([src.clone()]);
        let mut queue: VecDeque<(NounId, usize)> = VecDeque::from([(src.clone(), 0)]);

        while let Some((current, depth)) = queue.pop_front() {
            cancel.check()?;
            if depth == opts.max_depth {
                continue;
            }
            for (_, edge) in state.edges_of(&current, opts.direction, allowed) {
                if state.deleted.contains(&edge.other) || !visited.insert(edge.other.clone()) {
                    continue;
                }
                prev.insert(
                    edge.other.clone(),
                    (current.clone(), edge.verb_id.clone(), opts.weight_fn.cost(edge.weight)),
                );
                if edge.other == *dst {
                    return Ok(true);
                }
                queue.push_back((edge.other.clone(), depth + 1));
            }
        }
        Ok(false)
    }

    fn dijkstra_path(
        &self,
        state: &GraphState,
        src: &NounId,
        dst: &NounId,
        opts: &PathOptions,
        allowed: Option<&[VerbType]>,
        prev: &mut HashMap<NounId, (NounId, VerbId, f64)>,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let mut best: HashMap<NounId, f64> = HashMap::from([(src.clone(), 0.0)]);
        let mut settled: HashSet<NounId> = HashSet::new();
        let mut heap: BinaryHeap<Frontier> = BinaryHeap::new();
        heap.push(Frontier {
            cost: 0.0,
            depth: 0,
            id: src.clone(),
        });

        while let Some(Frontier { cost, depth, id }) = heap.pop() {
            cancel.check()?;
            if !settled.insert(id.clone()) {
                continue;
            }
            if id == *dst {
                return Ok(true);
            }
            if depth == opts.max_depth {
                continue;
            }
            for (_, edge) in state.edges_of(&id, opts.direction, allowed) {
                if state.deleted.contains(&edge.other) || settled.contains(&edge.other) {
                    continue;
                }
                let edge_cost = opts.weight_fn.cost(edge.weight);
                let next_cost = cost + edge_cost;
                let improved = best
                    .get(&edge.other)
                    .is_none_or(|&known| next_cost < known);
                if improved {
                    best.insert(edge.other.clone(), next_cost);
                    prev.insert(
                        edge.other.clone(),
                        (id.clone(), edge.verb_id.clone(), edge_cost),
                    );
                    heap.push(Frontier {
                        cost: next_cost,
                        depth: depth + 1,
                        id: edge.other.clone(),
                    });
                }
            }
        }
        Ok(false)
    }

    /// Rebuilds the adjacency from the raw verb records under `verbs/`.
    ///
    /// The signature takes the storage adapter, not the store: the rebuild
    /// cannot re-enter index accessors. Edges added to the in-memory state
    /// while the offline build ran are merged during the brief write-lock
    /// hand-off.
    pub fn rebuild_from(&self, adapter: &dyn StorageAdapter) -> Result<()> {
        if self.is_built() {
            return Ok(());
        }

        let mut fresh = GraphState::default();
        let mut cursor: Option<String> = None;
        loop {
            let listing = adapter.list_prefix(keys::VERBS_PREFIX, cursor.as_deref())?;
            for key in &listing.keys {
                let Some(bytes) = adapter.get(key)? else {
                    continue;
                };
                match records::decode_verb(&bytes) {
                    Ok(verb) => {
                        fresh.add_edge(&verb);
                    }
                    Err(err) => {
                        return Err(Error::corrupt(format!("verb record {key}: {err}")));
                    }
                }
            }
            match listing.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        fresh.built = true;

        let mut state = self.state.write();
        if state.built {
            return Ok(());
        }
        // Merge edges that arrived while the offline build was running.
        let pending: Vec<VerbId> = state.verbs.keys().cloned().collect();
        for verb_id in pending {
            if fresh.verbs.contains_key(&verb_id) {
                continue;
            }
            if let Some((source, target, verb_type)) = state.verbs.get(&verb_id).cloned() {
                if let Some(edge) = state
                    .out
                    .get(&source)
                    .and_then(|t| t.get(&verb_type))
                    .and_then(|edges| edges.iter().find(|e| e.verb_id == verb_id))
                {
                    let verb = Verb {
                        id: verb_id,
                        source,
                        target,
                        verb_type,
                        weight: edge.weight,
                        metadata: crate::metadata::Metadata::new(),
                        created_at: crate::types::Timestamp::default(),
                        updated_at: crate::types::Timestamp::default(),
                    };
                    let meta_hash = edge.meta_hash;
                    if fresh.add_edge(&verb) {
                        // Preserve the original metadata hash for
                        // idempotency checks.
                        if let Some(edges) = fresh
                            .out
                            .get_mut(&verb.source)
                            .and_then(|t| t.get_mut(&verb.verb_type))
                        {
                            if let Some(e) = edges.iter_mut().find(|e| e.verb_id == verb.id) {
                                e.meta_hash = meta_hash;
                            }
                        }
                        if let Some(edges) = fresh
                            .inc
                            .get_mut(&verb.target)
                            .and_then(|t| t.get_mut(&verb.verb_type))
                        {
                            if let Some(e) = edges.iter_mut().find(|e| e.verb_id == verb.id) {
                                e.meta_hash = meta_hash;
                            }
                        }
                    }
                }
            }
        }
        fresh.deleted = std::mem::take(&mut state.deleted);
        tracing::debug!(edges = fresh.verbs.len(), "graph adjacency rebuilt");
        *state = fresh;
        Ok(())
    }

    /// Persists adjacency blocks of every dirty noun.
    pub fn flush(&self, adapter: &dyn StorageAdapter) -> Result<()> {
        let dirty: Vec<NounId> = {
            let mut guard = self.dirty.lock();
            guard.drain().collect()
        };
        if dirty.is_empty() {
            return Ok(());
        }

        let state = self.state.read();
        for id in dirty {
            for (map, key) in [
                (&state.out, keys::graph_out(&id)),
                (&state.inc, keys::graph_in(&id)),
            ] {
                match map.get(&id) {
                    Some(types) if !types.is_empty() => {
                        let flat: Vec<(&VerbType, &Vec<EdgeRecord>)> = types.iter().collect();
                        let payload = serde_json::to_vec(&flat).map_err(|e| {
                            Error::invalid(format!("adjacency serialize failed: {e}"))
                        })?;
                        adapter.put(&key, &frame::encode(frame::GRAPH_BLOCK_V1, &payload))?;
                    }
                    _ => adapter.delete(&key)?,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::storage::MemoryAdapter;

    fn verb(id: &str, src: &str, dst: &str) -> Verb {
        Verb {
            id: id.into(),
            ..Verb::new(src.into(), dst.into(), VerbType::RELATED_TO)
        }
    }

    fn cancel() -> CancelToken {
        CancelToken::new()
    }

    #[test]
    fn test_add_edge_both_sides() {
        let graph = GraphAdjacencyIndex::new();
        assert!(graph.add_edge(&verb("v1", "a", "b")));

        let out = graph.neighbors(&"a".into(), Direction::Out, None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].noun_id.as_str(), "b");
        assert!(!out[0].deleted);

        let inc = graph.neighbors(&"b".into(), Direction::In, None);
        assert_eq!(inc.len(), 1);
        assert_eq!(inc[0].noun_id.as_str(), "a");
    }

    #[test]
    fn test_add_edge_idempotent_on_metadata_hash() {
        let graph = GraphAdjacencyIndex::new();
        assert!(graph.add_edge(&verb("v1", "a", "b")));
        // Same endpoints, type, and metadata: collapses.
        assert!(!graph.add_edge(&verb("v2", "a", "b")));

        // Different metadata: a parallel edge is allowed.
        let mut distinct = verb("v3", "a", "b");
        distinct.metadata = Metadata::new().with_field("channel", "email");
        assert!(graph.add_edge(&distinct));
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_remove_edge() {
        let graph = GraphAdjacencyIndex::new();
        graph.add_edge(&verb("v1", "a", "b"));
        assert_eq!(
            graph.remove_edge(&"v1".into()),
            Some(("a".into(), "b".into()))
        );
        assert!(graph.neighbors(&"a".into(), Direction::Out, None).is_empty());
        assert!(graph.neighbors(&"b".into(), Direction::In, None).is_empty());
        assert_eq!(graph.remove_edge(&"v1".into()), None);
    }

    #[test]
    fn test_neighbors_filtered_by_type() {
        let graph = GraphAdjacencyIndex::new();
        graph.add_edge(&verb("v1", "a", "b"));
        let mut contains = Verb::new("a".into(), "c".into(), VerbType::CONTAINS);
        contains.id = "v2".into();
        graph.add_edge(&contains);

        let only_contains = graph.neighbors(
            &"a".into(),
            Direction::Out,
            Some(&[VerbType::CONTAINS]),
        );
        assert_eq!(only_contains.len(), 1);
        assert_eq!(only_contains[0].noun_id.as_str(), "c");

        let all = graph.neighbors(&"a".into(), Direction::Out, None);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_shortest_path_bfs() {
        let graph = GraphAdjacencyIndex::new();
        graph.add_edge(&verb("v1", "a", "b"));
        graph.add_edge(&verb("v2", "b", "c"));
        graph.add_edge(&verb("v3", "a", "d"));

        let path = graph
            .shortest_path(&"a".into(), &"c".into(), &PathOptions::default(), &cancel())
            .unwrap()
            .expect("path exists");
        let ids: Vec<&str> = path.nodes.iter().map(|n| n.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(path.hops(), 2);
    }

    #[test]
    fn test_shortest_path_prefers_heavy_edges() {
        let graph = GraphAdjacencyIndex::new();
        // a -> b -> c with strong edges, a -> c direct but weak.
        let mut strong1 = verb("v1", "a", "b");
        strong1.weight = 10.0;
        let mut strong2 = verb("v2", "b", "c");
        strong2.weight = 10.0;
        let mut weak = verb("v3", "a", "c");
        weak.weight = 0.1;
        graph.add_edge(&strong1);
        graph.add_edge(&strong2);
        graph.add_edge(&weak);

        // Cost: via b = 1/10 + 1/10 = 0.2; direct = 1/0.1 = 10.
        let path = graph
            .shortest_path(&"a".into(), &"c".into(), &PathOptions::default(), &cancel())
            .unwrap()
            .unwrap();
        assert_eq!(path.nodes.len(), 3);
        assert!((path.cost - 0.2).abs() < 1e-9);

        // Pure hop count takes the direct edge instead.
        let opts = PathOptions {
            weight_fn: EdgeCost::Unit,
            ..Default::default()
        };
        let path = graph
            .shortest_path(&"a".into(), &"c".into(), &opts, &cancel())
            .unwrap()
            .unwrap();
        assert_eq!(path.nodes.len(), 2);
    }

    #[test]
    fn test_shortest_path_respects_max_depth() {
        let graph = GraphAdjacencyIndex::new();
        graph.add_edge(&verb("v1", "a", "b"));
        graph.add_edge(&verb("v2", "b", "c"));

        let opts = PathOptions {
            max_depth: 1,
            ..Default::default()
        };
        assert!(graph
            .shortest_path(&"a".into(), &"c".into(), &opts, &cancel())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_shortest_path_same_node() {
        let graph = GraphAdjacencyIndex::new();
        graph.add_edge(&verb("v1", "a", "b"));
        let path = graph
            .shortest_path(&"a".into(), &"a".into(), &PathOptions::default(), &cancel())
            .unwrap()
            .unwrap();
        assert_eq!(path.nodes.len(), 1);
        assert_eq!(path.hops(), 0);
    }

    #[test]
    fn test_cycle_terminates() {
        let graph = GraphAdjacencyIndex::new();
        graph.add_edge(&verb("v1", "a", "b"));
        graph.add_edge(&verb("v2", "b", "a"));
        assert!(graph
            .shortest_path(&"a".into(), &"z".into(), &PathOptions::default(), &cancel())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_neighborhood_radius() {
        let graph = GraphAdjacencyIndex::new();
        graph.add_edge(&verb("v1", "a", "b"));
        graph.add_edge(&verb("v2", "b", "c"));
        graph.add_edge(&verb("v3", "c", "d"));

        let near: HashMap<NounId, usize> = graph
            .neighborhood(&"a".into(), 2, Direction::Out, None, &cancel())
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(near.len(), 3);
        assert_eq!(near[&NounId::from("a")], 0);
        assert_eq!(near[&NounId::from("b")], 1);
        assert_eq!(near[&NounId::from("c")], 2);

        // Radius 0 returns only the start.
        let only_start = graph
            .neighborhood(&"a".into(), 0, Direction::Out, None, &cancel())
            .unwrap();
        assert_eq!(only_start, vec![("a".into(), 0)]);
    }

    #[test]
    fn test_remove_noun_cascades() {
        let graph = GraphAdjacencyIndex::new();
        graph.add_edge(&verb("v1", "a", "b"));
        graph.add_edge(&verb("v2", "b", "a"));

        let removed = graph.remove_noun(&"a".into());
        assert_eq!(removed, vec![VerbId::from("v1")]);

        // Outgoing edges of the deleted noun are gone.
        assert!(graph.neighbors(&"a".into(), Direction::Out, None).is_empty());
        // Verbs targeting the deleted noun surface the flag.
        let from_b = graph.neighbors(&"b".into(), Direction::Out, None);
        assert_eq!(from_b.len(), 1);
        assert!(from_b[0].deleted);
    }

    #[test]
    fn test_traversal_skips_deleted() {
        let graph = GraphAdjacencyIndex::new();
        graph.add_edge(&verb("v1", "a", "b"));
        graph.add_edge(&verb("v2", "b", "c"));
        graph.remove_noun(&"b".into());

        assert!(graph
            .shortest_path(&"a".into(), &"c".into(), &PathOptions::default(), &cancel())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_cancelled_traversal_stops() {
        let graph = GraphAdjacencyIndex::new();
        graph.add_edge(&verb("v1", "a", "b"));
        let token = CancelToken::new();
        token.cancel();
        assert!(graph
            .shortest_path(&"a".into(), &"b".into(), &PathOptions::default(), &token)
            .unwrap_err()
            .is_cancellation());
    }

    #[test]
    fn test_rebuild_from_storage_raw_records() {
        let adapter = MemoryAdapter::new();
        for v in [verb("v1", "a", "b"), verb("v2", "b", "c")] {
            adapter
                .put(&keys::verb(&v.id), &records::encode_verb(&v).unwrap())
                .unwrap();
        }

        let graph = GraphAdjacencyIndex::unbuilt();
        assert!(!graph.is_built());
        graph.rebuild_from(&adapter).unwrap();
        assert!(graph.is_built());
        assert_eq!(graph.edge_count(), 2);

        let path = graph
            .shortest_path(&"a".into(), &"c".into(), &PathOptions::default(), &cancel())
            .unwrap()
            .unwrap();
        assert_eq!(path.hops(), 2);
    }

    #[test]
    fn test_rebuild_merges_concurrent_edges() {
        let adapter = MemoryAdapter::new();
        let persisted = verb("v1", "a", "b");
        adapter
            .put(
                &keys::verb(&persisted.id),
                &records::encode_verb(&persisted).unwrap(),
            )
            .unwrap();

        let graph = GraphAdjacencyIndex::unbuilt();
        // An edge written before the rebuild ran.
        graph.add_edge(&verb("v2", "b", "c"));
        graph.rebuild_from(&adapter).unwrap();

        assert_eq!(graph.edge_count(), 2);
        assert!(graph
            .shortest_path(&"a".into(), &"c".into(), &PathOptions::default(), &cancel())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_flush_writes_adjacency_blocks() {
        let adapter = MemoryAdapter::new();
        let graph = GraphAdjacencyIndex::new();
        graph.add_edge(&verb("v1", "a", "b"));
        graph.flush(&adapter).unwrap();

        assert!(adapter.exists("graph/out/a").unwrap());
        assert!(adapter.exists("graph/in/b").unwrap());

        graph.remove_edge(&"v1".into());
        graph.flush(&adapter).unwrap();
        assert!(!adapter.exists("graph/out/a").unwrap());
        assert!(!adapter.exists("graph/in/b").unwrap());
    }
}
