//! Query planner fusing the three indexes.
//!
//! A query may carry any subset of the three axes: a vector (approximate
//! KNN), a graph constraint (start set + bounded expansion), and a
//! metadata filter. The planner estimates the result-set size of each
//! present axis, runs the cheapest one first, and applies the remaining
//! axes as post-filters:
//!
//! - *filter-first* when the metadata bitmap is already small enough that
//!   an exact vector scan over it beats graph navigation;
//! - *vector-first* otherwise, with the beam widened by an overshoot
//!   factor and refilled (beam doubling) until `k` candidates survive the
//!   post-filters or the partition is exhausted;
//! - *graph-first* when the bounded neighborhood is the smallest set.
//!
//! Final score: `alpha * vector + beta * graph + gamma * metadata`, ties
//! broken by noun id ascending so results are deterministic.

use std::collections::HashMap;

use roaring::RoaringBitmap;

use crate::cancel::CancelToken;
use crate::config::{ScoreWeights, StoreConfig};
use crate::error::{Error, Result};
use crate::filter::meta_index::filter_fields;
use crate::filter::{Filter, MetadataIndex};
use crate::graph::{Direction, GraphAdjacencyIndex};
use crate::index::HnswIndex;
use crate::types::{DocId, IdTable, NounId, NounType, VerbType};
use crate::vector::Vector;

/// Overshoot factor applied to the beam in vector-first mode.
const VECTOR_OVERSHOOT: usize = 2;
/// Filter-first is chosen when the bitmap holds at most `k * C` docs.
const FILTER_FIRST_FACTOR: u64 = 4;
/// Result limit when the query has no vector axis and no explicit limit.
const DEFAULT_LIMIT: usize = 10;

/// The vector axis of a query.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub vector: Vector,
    pub k: usize,
    /// Drop hits whose similarity is below this bound.
    pub min_similarity: Option<f32>,
}

/// The graph axis of a query: admit only nouns within `max_depth` hops of
/// the start set.
#[derive(Debug, Clone)]
pub struct GraphConstraint {
    pub start: Vec<NounId>,
    pub verb_types: Option<Vec<VerbType>>,
    pub max_depth: usize,
    pub direction: Direction,
}

impl GraphConstraint {
    /// Expansion from a start set with depth 2 over all verb types.
    pub fn from(start: Vec<NounId>) -> Self {
        Self {
            start,
            verb_types: None,
            max_depth: 2,
            direction: Direction::Out,
        }
    }

    /// Sets the expansion depth. Chainable.
    pub fn with_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Restricts traversed verb types. Chainable.
    pub fn with_verb_types(mut self, types: Vec<VerbType>) -> Self {
        self.verb_types = Some(types);
        self
    }

    /// Sets the traversal direction. Chainable.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}

/// A fused query over any subset of the three axes.
#[derive(Debug, Clone, Default)]
pub struct TripleQuery {
    pub vector: Option<VectorQuery>,
    pub graph: Option<GraphConstraint>,
    pub filter: Option<Filter>,
    /// Restrict to these noun types; `None` searches every type.
    pub types: Option<Vec<NounType>>,
    /// Per-query scoring weights; the store default applies otherwise.
    pub weights: Option<ScoreWeights>,
    /// Per-query beam width override.
    pub ef_search: Option<usize>,
    /// Result limit for queries without a vector axis.
    pub limit: Option<usize>,
}

impl TripleQuery {
    /// Empty query; combine with the chainable setters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a KNN axis. Chainable.
    pub fn with_vector(mut self, vector: impl Into<Vector>, k: usize) -> Self {
        self.vector = Some(VectorQuery {
            vector: vector.into(),
            k,
            min_similarity: None,
        });
        self
    }

    /// Sets the minimum similarity for vector hits. Chainable.
    pub fn with_min_similarity(mut self, min: f32) -> Self {
        if let Some(vq) = &mut self.vector {
            vq.min_similarity = Some(min);
        }
        self
    }

    /// Adds a graph constraint. Chainable.
    pub fn with_graph(mut self, constraint: GraphConstraint) -> Self {
        self.graph = Some(constraint);
        self
    }

    /// Adds a metadata filter. Chainable.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Restricts noun types. Chainable.
    pub fn with_types(mut self, types: Vec<NounType>) -> Self {
        self.types = Some(types);
        self
    }

    /// Overrides scoring weights. Chainable.
    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Overrides the beam width. Chainable.
    pub fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = Some(ef);
        self
    }

    /// Sets the result limit for non-vector queries. Chainable.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when no axis is present.
    pub fn is_empty(&self) -> bool {
        self.vector.is_none() && self.graph.is_none() && self.filter.is_none()
    }

    /// Field names the metadata axis touches.
    pub(crate) fn filter_field_names(&self) -> Vec<String> {
        self.filter.as_ref().map(filter_fields).unwrap_or_default()
    }
}

/// Which execution order the planner chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    FilterFirst,
    VectorFirst,
    GraphFirst,
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub noun_id: NounId,
    pub noun_type: NounType,
    /// Fused score in [0, 1] (given weights summing to 1).
    pub score: f32,
    /// Similarity component, present when the query had a vector axis.
    pub vector_score: Option<f32>,
    /// Hop distance from the start set, present under a graph constraint.
    pub graph_hops: Option<usize>,
}

/// A ranked result set plus per-partition warnings.
#[derive(Debug, Clone)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub warnings: Vec<String>,
    pub mode: PlanMode,
}

/// Borrowed view of the store internals the planner works against.
pub(crate) struct QueryContext<'a> {
    pub hnsw: &'a HnswIndex,
    pub meta: &'a MetadataIndex,
    pub graph: &'a GraphAdjacencyIndex,
    pub ids: &'a IdTable,
    pub config: &'a StoreConfig,
}

pub(crate) fn execute(
    ctx: &QueryContext<'_>,
    query: &TripleQuery,
    cancel: &CancelToken,
) -> Result<SearchResults> {
    validate(ctx, query)?;
    cancel.check()?;

    let types = resolve_types(ctx, query);
    let weights = query.weights.unwrap_or(ctx.config.weights);

    // Graph admission set and hop distances, when constrained.
    let hops: Option<HashMap<NounId, usize>> = match &query.graph {
        Some(constraint) => Some(ctx.graph.hops_from(
            &constraint.start,
            constraint.max_depth,
            constraint.direction,
            constraint.verb_types.as_deref(),
            cancel,
        )?),
        None => None,
    };

    // Metadata bitmap, when filtered.
    let bitmap: Option<RoaringBitmap> = query.filter.as_ref().map(|f| ctx.meta.query(f));

    let mode = choose_mode(ctx, query, bitmap.as_ref(), hops.as_ref());
    tracing::debug!(?mode, "query plan selected");

    let mut warnings = Vec::new();
    let raw = match mode {
        PlanMode::VectorFirst => {
            vector_first(ctx, query, &types, bitmap.as_ref(), hops.as_ref(), cancel, &mut warnings)?
        }
        PlanMode::FilterFirst | PlanMode::GraphFirst => {
            let candidates = candidate_docs(ctx, &types, bitmap.as_ref(), hops.as_ref());
            exact_scan(ctx, query, candidates, hops.as_ref(), cancel)?
        }
    };

    let mut hits = score_and_rank(raw, query, &weights);
    let limit = match &query.vector {
        Some(vq) => vq.k,
        None => query.limit.unwrap_or(DEFAULT_LIMIT),
    };
    hits.truncate(limit);

    Ok(SearchResults {
        hits,
        warnings,
        mode,
    })
}

fn validate(ctx: &QueryContext<'_>, query: &TripleQuery) -> Result<()> {
    if query.is_empty() {
        return Err(Error::invalid("query has no vector, graph, or filter axis"));
    }
    if let Some(vq) = &query.vector {
        if vq.k == 0 {
            return Err(Error::invalid("k must be greater than 0"));
        }
        if vq.vector.dimension() != ctx.config.dimension {
            return Err(Error::invalid(format!(
                "dimension mismatch: expected {}, got {}",
                ctx.config.dimension,
                vq.vector.dimension()
            )));
        }
        vq.vector.validate()?;
        if vq.vector.is_zero()
            && ctx.config.metric == crate::distance::DistanceMetric::Cosine
        {
            return Err(Error::invalid(
                "cosine similarity is undefined for a zero query vector",
            ));
        }
    }
    Ok(())
}

fn resolve_types(ctx: &QueryContext<'_>, query: &TripleQuery) -> Vec<NounType> {
    match &query.types {
        Some(types) => types.clone(),
        None => {
            let mut types: Vec<NounType> = Vec::new();
            for (_, entry) in ctx.ids.iter() {
                if !types.contains(&entry.noun_type) {
                    types.push(entry.noun_type.clone());
                }
            }
            types.sort();
            types
        }
    }
}

fn choose_mode(
    ctx: &QueryContext<'_>,
    query: &TripleQuery,
    bitmap: Option<&RoaringBitmap>,
    hops: Option<&HashMap<NounId, usize>>,
) -> PlanMode {
    let Some(vq) = &query.vector else {
        // Without a vector axis there is nothing approximate to run; the
        // smaller of the two set axes drives an exact scan.
        return match (bitmap, hops) {
            (Some(bitmap), Some(hops)) if (hops.len() as u64) < bitmap.len() => {
                PlanMode::GraphFirst
            }
            (None, Some(_)) => PlanMode::GraphFirst,
            _ => PlanMode::FilterFirst,
        };
    };

    let k = vq.k as u64;
    let vector_cost =
        k * query.ef_search.unwrap_or(ctx.config.hnsw.ef_search).max(vq.k) as u64;

    if let Some(bitmap) = bitmap {
        if bitmap.len() <= k * FILTER_FIRST_FACTOR {
            return PlanMode::FilterFirst;
        }
    }
    if let Some(hops) = hops {
        if (hops.len() as u64) < vector_cost {
            return PlanMode::GraphFirst;
        }
    }
    PlanMode::VectorFirst
}

/// Intersects type restriction, metadata bitmap, and graph admission into
/// a concrete doc set for exact scanning.
fn candidate_docs(
    ctx: &QueryContext<'_>,
    types: &[NounType],
    bitmap: Option<&RoaringBitmap>,
    hops: Option<&HashMap<NounId, usize>>,
) -> Vec<DocId> {
    match hops {
        // Graph-first: the admitted set is already small; map it to docs.
        Some(hops) => {
            let mut docs: Vec<DocId> = hops
                .keys()
                .filter_map(|id| ctx.ids.doc_of(id))
                .filter(|doc| {
                    bitmap.is_none_or(|b| b.contains(*doc))
                        && ctx
                            .ids
                            .resolve(*doc)
                            .is_some_and(|e| types.contains(&e.noun_type))
                })
                .collect();
            docs.sort_unstable();
            docs
        }
        None => match bitmap {
            Some(bitmap) => bitmap
                .iter()
                .filter(|doc| {
                    ctx.ids
                        .resolve(*doc)
                        .is_some_and(|e| types.contains(&e.noun_type))
                })
                .collect(),
            // No set axis: every live doc of the requested types.
            None => ctx
                .ids
                .iter()
                .filter(|(_, e)| types.contains(&e.noun_type))
                .map(|(doc, _)| doc)
                .collect(),
        },
    }
}

/// Candidate hit before scoring.
struct RawHit {
    noun_id: NounId,
    noun_type: NounType,
    vector_score: Option<f32>,
    graph_hops: Option<usize>,
}

/// Exact distance scan over an explicit candidate set (filter-first and
/// graph-first modes).
fn exact_scan(
    ctx: &QueryContext<'_>,
    query: &TripleQuery,
    candidates: Vec<DocId>,
    hops: Option<&HashMap<NounId, usize>>,
    cancel: &CancelToken,
) -> Result<Vec<RawHit>> {
    let mut hits = Vec::with_capacity(candidates.len());
    for doc in candidates {
        cancel.check()?;
        let Some(entry) = ctx.ids.resolve(doc) else {
            continue;
        };
        let vector_score = match &query.vector {
            Some(vq) => {
                let Some(stored) = ctx.hnsw.vector_of(&entry.noun_type, doc) else {
                    continue;
                };
                let distance = ctx.config.metric.compute(vq.vector.as_slice(), &stored);
                let similarity = ctx.config.metric.similarity(distance);
                if vq.min_similarity.is_some_and(|min| similarity < min) {
                    continue;
                }
                Some(similarity)
            }
            None => None,
        };
        hits.push(RawHit {
            noun_id: entry.noun_id.clone(),
            noun_type: entry.noun_type.clone(),
            vector_score,
            graph_hops: hops.and_then(|h| h.get(&entry.noun_id).copied()),
        });
    }
    Ok(hits)
}

/// HNSW stream with post-filters, refilling by beam doubling until `k`
/// accepted hits or the stream is exhausted.
#[allow(clippy::too_many_arguments)]
fn vector_first(
    ctx: &QueryContext<'_>,
    query: &TripleQuery,
    types: &[NounType],
    bitmap: Option<&RoaringBitmap>,
    hops: Option<&HashMap<NounId, usize>>,
    cancel: &CancelToken,
    warnings: &mut Vec<String>,
) -> Result<Vec<RawHit>> {
    let vq = query.vector.as_ref().expect("vector-first requires a vector");
    let base_ef = query.ef_search.unwrap_or(ctx.config.hnsw.ef_search);
    let mut ef = base_ef.max(vq.k * VECTOR_OVERSHOOT);
    // The beam cannot usefully exceed the candidate population.
    let ef_cap = ctx.ids.len().max(1);

    loop {
        cancel.check()?;
        let result = ctx
            .hnsw
            .search(types, vq.vector.as_slice(), ef, Some(ef), cancel)?;
        let exhausted = result.hits.len() < ef;

        let mut accepted = Vec::with_capacity(vq.k);
        for hit in &result.hits {
            if bitmap.is_some_and(|b| !b.contains(hit.doc)) {
                continue;
            }
            let Some(entry) = ctx.ids.resolve(hit.doc) else {
                continue;
            };
            let graph_hops = match hops {
                Some(hops) => match hops.get(&entry.noun_id) {
                    Some(h) => Some(*h),
                    None => continue,
                },
                None => None,
            };
            let similarity = ctx.config.metric.similarity(hit.distance);
            if vq.min_similarity.is_some_and(|min| similarity < min) {
                continue;
            }
            accepted.push(RawHit {
                noun_id: entry.noun_id.clone(),
                noun_type: entry.noun_type.clone(),
                vector_score: Some(similarity),
                graph_hops,
            });
        }

        if accepted.len() >= vq.k || exhausted || ef >= ef_cap {
            warnings.extend(result.warnings);
            return Ok(accepted);
        }
        ef = (ef * 2).min(ef_cap);
    }
}

fn score_and_rank(raw: Vec<RawHit>, query: &TripleQuery, weights: &ScoreWeights) -> Vec<SearchHit> {
    let has_filter = query.filter.is_some();
    let mut hits: Vec<SearchHit> = raw
        .into_iter()
        .map(|hit| {
            let vector_score = hit.vector_score.unwrap_or(0.0);
            let graph_score = hit
                .graph_hops
                .map(|h| 1.0 / (1.0 + h as f32))
                .unwrap_or(0.0);
            // Admission already proved the filter matched; the component
            // mostly affects admission, not ordering.
            let metadata_score = if has_filter { 1.0 } else { 0.0 };
            SearchHit {
                score: weights.alpha * vector_score
                    + weights.beta * graph_score
                    + weights.gamma * metadata_score,
                noun_id: hit.noun_id,
                noun_type: hit.noun_type,
                vector_score: hit.vector_score,
                graph_hops: hit.graph_hops,
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.noun_id.cmp(&b.noun_id))
    });
    hits
}
