//! # TriaxDB Core
//!
//! Core engine for TriaxDB — an embeddable triple-intelligence knowledge
//! store.
//!
//! Every record (a *noun*) is indexed along three axes at once:
//!
//! - a dense vector, for approximate nearest-neighbor search
//!   ([`HnswIndex`], partitioned by noun type);
//! - a typed directed edge set (*verbs*), for relational traversal
//!   ([`GraphAdjacencyIndex`]);
//! - a structured metadata document, for exact/range filtering
//!   ([`MetadataIndex`], roaring-bitmap backed).
//!
//! [`Store`] owns the three indexes over a pluggable [`StorageAdapter`]
//! (memory, local disk, or any key/blob backend), fuses them through a
//! query planner ([`TripleQuery`]), and makes multi-index writes atomic
//! with compensation-based transactions.
//!
//! ## Crate Features
//!
//! - `async` - Enables [`AsyncStore`] for tokio-compatible async operations
//!
//! ## Quick start
//!
//! ```
//! use triaxdb_core::prelude::*;
//!
//! let store = Store::open(MemoryAdapter::new(), StoreConfig::new(3)).unwrap();
//!
//! let article = Noun::new(NounType::DOCUMENT, vec![1.0, 0.0, 0.0])
//!     .with_id("article-1")
//!     .with_metadata(Metadata::new().with_field("status", "published"));
//! let author = Noun::new(NounType::PERSON, vec![0.0, 1.0, 0.0]).with_id("ada");
//! store.add(article).unwrap();
//! store.add(author).unwrap();
//! store
//!     .relate(&"article-1".into(), &"ada".into(), VerbType::CREATED_BY)
//!     .unwrap();
//!
//! let results = store
//!     .search(
//!         &TripleQuery::new()
//!             .with_vector(vec![1.0, 0.0, 0.0], 5)
//!             .with_filter(Filter::field("status").eq("published")),
//!     )
//!     .unwrap();
//! assert_eq!(results.hits[0].noun_id.as_str(), "article-1");
//! ```

pub mod cancel;
pub mod config;
pub mod distance;
pub mod embed;
pub mod error;
pub mod filter;
pub mod graph;
pub mod index;
pub mod metadata;
pub mod planner;
pub mod storage;
pub mod store;
pub mod txn;
pub mod types;
pub mod vector;

// Re-exports for convenient access
pub use cancel::CancelToken;
pub use config::{BatchConfig, HnswConfig, MetaIndexConfig, ScoreWeights, StoreConfig, TxnConfig};
pub use distance::DistanceMetric;
pub use embed::Embedder;
pub use error::{Error, ErrorKind, Result, TransactionError};
pub use filter::{Filter, FilterCondition, MetadataIndex};
pub use graph::{
    Direction, EdgeCost, GraphAdjacencyIndex, Neighbor, Path, PathOptions,
};
pub use index::{HnswIndex, VectorHit, VectorSearch};
pub use metadata::Metadata;
pub use planner::{
    GraphConstraint, PlanMode, SearchHit, SearchResults, TripleQuery, VectorQuery,
};
pub use storage::{FsAdapter, Listing, MemoryAdapter, RetryAdapter, StorageAdapter};
#[cfg(feature = "async")]
pub use store::AsyncStore;
pub use store::{RelationQuery, Store, Txn};
pub use txn::{TransactionManager, TxnStats};
pub use types::{
    DocId, Noun, NounId, NounPatch, NounType, Timestamp, Verb, VerbId, VerbType,
};
pub use vector::Vector;

/// Re-export of commonly used types.
///
/// # Example
///
/// ```
/// use triaxdb_core::prelude::*;
///
/// let store = Store::open(MemoryAdapter::new(), StoreConfig::new(8)).unwrap();
/// assert!(store.is_empty());
/// ```
pub mod prelude {
    pub use crate::{
        CancelToken, Direction, DistanceMetric, Error, Filter, GraphConstraint, HnswConfig,
        Metadata, MemoryAdapter, Noun, NounId, NounPatch, NounType, PathOptions, RelationQuery,
        Result, ScoreWeights, SearchResults, StorageAdapter, Store, StoreConfig, TripleQuery,
        Verb, VerbId, VerbType,
    };
}
