//! # TriaxDB
//!
//! **An embeddable triple-intelligence knowledge store in pure Rust.**
//!
//! TriaxDB indexes every record along three axes simultaneously and
//! answers queries that mix all three:
//!
//! | Axis | Structure | Answers |
//! |------|-----------|---------|
//! | **Vector** | Type-partitioned HNSW graph | "what is similar to this?" |
//! | **Graph** | Typed directed adjacency | "what is connected to this?" |
//! | **Metadata** | Roaring-bitmap posting lists | "what matches these fields?" |
//!
//! Records are *nouns* (vertices); relationships are *verbs* (typed,
//! directed, weighted edges). The same engine runs in long-lived server
//! processes over local disk and in short-lived clients fully in memory —
//! storage is a pluggable key/blob adapter.
//!
//! ## Quick Start
//!
//! ### In-Memory Store
//!
//! ```rust
//! use triaxdb::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let store = Store::open(MemoryAdapter::new(), StoreConfig::new(3))?;
//!
//!     // Index nouns with vectors and metadata
//!     let rust = Noun::new(NounType::TOPIC, vec![1.0, 0.0, 0.0])
//!         .with_id("rust")
//!         .with_metadata(Metadata::new().with_field("kind", "language"));
//!     let cargo = Noun::new(NounType::TOPIC, vec![0.9, 0.1, 0.0])
//!         .with_id("cargo")
//!         .with_metadata(Metadata::new().with_field("kind", "tool"));
//!     store.add(rust)?;
//!     store.add(cargo)?;
//!
//!     // Connect them
//!     store.relate(&"cargo".into(), &"rust".into(), VerbType::PART_OF)?;
//!
//!     // Query all three axes at once
//!     let results = store.search(
//!         &TripleQuery::new()
//!             .with_vector(vec![1.0, 0.0, 0.0], 10)
//!             .with_graph(GraphConstraint::from(vec!["rust".into()])
//!                 .with_direction(Direction::In))
//!             .with_filter(Filter::field("kind").eq("tool")),
//!     )?;
//!     assert_eq!(results.hits.len(), 1);
//!     assert_eq!(results.hits[0].noun_id.as_str(), "cargo");
//!     Ok(())
//! }
//! ```
//!
//! ### Persistent Store
//!
//! ```no_run
//! use triaxdb::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let adapter = triaxdb::FsAdapter::open("./knowledge")?;
//!     let store = Store::open(adapter, StoreConfig::new(384))?;
//!
//!     store.add(Noun::new(NounType::DOCUMENT, vec![0.1; 384]).with_id("doc-1"))?;
//!
//!     // Flush persists dirty index state and the manifest
//!     store.flush()?;
//!     Ok(())
//! }
//! ```
//!
//! ### Atomic Multi-Index Writes
//!
//! ```rust
//! use triaxdb::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let store = Store::open(MemoryAdapter::new(), StoreConfig::new(3))?;
//!     store.transaction(|tx| {
//!         let a = tx.add(Noun::new(NounType::CONCEPT, vec![1.0, 0.0, 0.0]))?;
//!         let b = tx.add(Noun::new(NounType::CONCEPT, vec![0.0, 1.0, 0.0]))?;
//!         tx.relate(a, b, VerbType::RELATED_TO)?;
//!         Ok(())
//!     })?;
//!     assert_eq!(store.len(), 2);
//!     Ok(())
//! }
//! ```
//!
//! If any step fails, every already-executed step is compensated: the
//! store is left as if the transaction never ran.
//!
//! ## Crate Features
//!
//! - `async` — [`AsyncStore`], a tokio-compatible wrapper over the sync
//!   store.

pub use triaxdb_core::*;

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[test]
    fn test_facade_reexports_compile() {
        let store = Store::open(MemoryAdapter::new(), StoreConfig::new(3)).unwrap();
        store
            .add(Noun::new(NounType::CONCEPT, vec![1.0, 0.0, 0.0]).with_id("n1"))
            .unwrap();
        let results = store
            .search(&TripleQuery::new().with_vector(vec![1.0, 0.0, 0.0], 1))
            .unwrap();
        assert_eq!(results.hits[0].noun_id.as_str(), "n1");
    }
}
