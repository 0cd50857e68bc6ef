//! Vector index structures.

pub mod hnsw;

pub use hnsw::{HnswIndex, VectorHit, VectorSearch};
