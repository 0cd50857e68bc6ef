//! Embedding capability interface.
//!
//! The engine never runs a model itself; callers hand in anything that
//! turns content into a fixed-dimension vector. The only contract is the
//! output dimension; determinism is up to the implementation (a
//! non-deterministic embedder simply makes re-adds non-reproducible).

use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::store::Store;
use crate::types::{NounId, Noun, NounType};

/// Produces a fixed-dimension vector from raw content.
pub trait Embedder: Send + Sync {
    /// The dimension of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// Embeds a chunk of content.
    fn embed(&self, content: &[u8]) -> Result<Vec<f32>>;
}

impl Store {
    /// Adds a noun whose vector is produced by the given embedder.
    pub fn add_embedded(
        &self,
        noun_type: NounType,
        content: &str,
        metadata: Metadata,
        embedder: &dyn Embedder,
    ) -> Result<NounId> {
        if embedder.dimension() != self.config().dimension {
            return Err(Error::invalid(format!(
                "embedder dimension {} does not match store dimension {}",
                embedder.dimension(),
                self.config().dimension
            )));
        }
        let vector = embedder.embed(content.as_bytes())?;
        self.add(Noun::new(noun_type, vector).with_metadata(metadata))
    }
}
