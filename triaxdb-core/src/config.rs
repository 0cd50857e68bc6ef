//! Configuration types for a TriaxDB store.
//!
//! All fields have working defaults; use struct update syntax or the
//! chainable setters to override:
//!
//! ```
//! use triaxdb_core::{StoreConfig, DistanceMetric};
//!
//! let config = StoreConfig::new(384)
//!     .with_metric(DistanceMetric::Cosine);
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};

/// Top-level configuration for a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Vector dimension, fixed per store at creation.
    pub dimension: usize,
    /// Distance metric for vector similarity.
    pub metric: DistanceMetric,
    /// Vector index parameters.
    pub hnsw: HnswConfig,
    /// Default scoring weights for fused queries.
    pub weights: ScoreWeights,
    /// Metadata index parameters.
    pub meta: MetaIndexConfig,
    /// Transaction parameters.
    pub txn: TxnConfig,
    /// High-volume write batching parameters.
    pub batch: BatchConfig,
}

impl StoreConfig {
    /// Creates a config for the given vector dimension with defaults
    /// everywhere else.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            metric: DistanceMetric::default(),
            hnsw: HnswConfig::default(),
            weights: ScoreWeights::default(),
            meta: MetaIndexConfig::default(),
            txn: TxnConfig::default(),
            batch: BatchConfig::default(),
        }
    }

    /// Sets the distance metric. Chainable.
    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Sets the vector index parameters. Chainable.
    pub fn with_hnsw(mut self, hnsw: HnswConfig) -> Self {
        self.hnsw = hnsw;
        self
    }

    /// Sets the default scoring weights. Chainable.
    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Validates the configuration. Called by `Store::open`.
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(Error::invalid("dimension must be greater than 0"));
        }
        if self.dimension > 65_536 {
            return Err(Error::invalid("dimension must not exceed 65536"));
        }
        self.hnsw.validate()?;
        self.weights.validate()?;
        self.meta.validate()?;
        self.batch.validate()?;
        Ok(())
    }
}

/// Parameters of the layered vector index.
///
/// | Use case    | m  | ef_construction | ef_search |
/// |-------------|----|-----------------|-----------|
/// | Low memory  |  8 |             100 |        30 |
/// | Balanced    | 16 |             200 |        50 |
/// | High recall | 32 |             400 |       100 |
#[derive(Debug, Clone)]
pub struct HnswConfig {
    /// Maximum connections per node per layer (except layer 0).
    pub m: usize,
    /// Maximum connections at layer 0, usually `2 * m`.
    pub m0: usize,
    /// Beam width during construction.
    pub ef_construction: usize,
    /// Default beam width during search; overridable per query.
    pub ef_search: usize,
    /// Tombstone ratio above which a partition is rebuilt.
    pub tombstone_compact_ratio: f64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            m0: 32,
            ef_construction: 200,
            ef_search: 50,
            tombstone_compact_ratio: 0.3,
        }
    }
}

impl HnswConfig {
    /// Creates config with the given M parameter (`m0 = 2 * m`).
    pub fn with_m(m: usize) -> Self {
        Self {
            m,
            m0: m * 2,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.m == 0 {
            return Err(Error::invalid("hnsw.m must be greater than 0"));
        }
        if self.m0 < self.m {
            return Err(Error::invalid("hnsw.m0 must be at least hnsw.m"));
        }
        if self.ef_construction == 0 {
            return Err(Error::invalid("hnsw.ef_construction must be greater than 0"));
        }
        if self.ef_search == 0 {
            return Err(Error::invalid("hnsw.ef_search must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.tombstone_compact_ratio) {
            return Err(Error::invalid(
                "hnsw.tombstone_compact_ratio must be in [0, 1]",
            ));
        }
        Ok(())
    }
}

/// Weights of the fused score: `alpha * vector + beta * graph +
/// gamma * metadata`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub alpha: f32,
    pub beta: f32,
    pub gamma: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            beta: 0.2,
            gamma: 0.1,
        }
    }
}

impl ScoreWeights {
    /// Creates explicit weights.
    pub fn new(alpha: f32, beta: f32, gamma: f32) -> Self {
        Self { alpha, beta, gamma }
    }

    fn validate(&self) -> Result<()> {
        let all = [self.alpha, self.beta, self.gamma];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::invalid("score weights must be finite and >= 0"));
        }
        if all.iter().all(|w| *w == 0.0) {
            return Err(Error::invalid("at least one score weight must be > 0"));
        }
        Ok(())
    }
}

/// Parameters of the metadata index.
#[derive(Debug, Clone)]
pub struct MetaIndexConfig {
    /// Ids per posting-list chunk. Must be a power of two.
    pub chunk_size: u32,
    /// Byte budget of the loaded-chunk cache.
    pub cache_budget_bytes: usize,
}

impl Default for MetaIndexConfig {
    fn default() -> Self {
        Self {
            chunk_size: 65_536,
            cache_budget_bytes: 64 * 1024 * 1024,
        }
    }
}

impl MetaIndexConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || !self.chunk_size.is_power_of_two() {
            return Err(Error::invalid("meta.chunk_size must be a power of two"));
        }
        if self.cache_budget_bytes == 0 {
            return Err(Error::invalid("meta.cache_budget_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Transaction parameters.
#[derive(Debug, Clone, Default)]
pub struct TxnConfig {
    /// Deadline applied to every transaction; `None` means no deadline.
    pub deadline: Option<Duration>,
}

/// High-volume write batching parameters.
///
/// Writers exceeding `high_volume_ops_per_sec` switch the store into
/// buffered mode: raw-record puts accumulate and flush on `flush_ops`
/// buffered items or `flush_interval`, whichever comes first.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub flush_ops: usize,
    pub flush_interval: Duration,
    pub high_volume_ops_per_sec: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_ops: 1_000,
            flush_interval: Duration::from_millis(100),
            high_volume_ops_per_sec: 500,
        }
    }
}

impl BatchConfig {
    fn validate(&self) -> Result<()> {
        if self.flush_ops == 0 {
            return Err(Error::invalid("batch.flush_ops must be > 0"));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::invalid("batch.flush_interval must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(StoreConfig::new(384).validate().is_ok());
    }

    #[test]
    fn test_default_values() {
        let config = StoreConfig::new(3);
        assert_eq!(config.metric, DistanceMetric::Cosine);
        assert_eq!(config.hnsw.m, 16);
        assert_eq!(config.hnsw.m0, 32);
        assert_eq!(config.hnsw.ef_construction, 200);
        assert_eq!(config.hnsw.ef_search, 50);
        assert_eq!(config.weights, ScoreWeights::new(0.7, 0.2, 0.1));
        assert_eq!(config.meta.chunk_size, 65_536);
        assert!(config.txn.deadline.is_none());
        assert_eq!(config.batch.flush_ops, 1_000);
        assert_eq!(config.batch.flush_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(StoreConfig::new(0).validate().is_err());
    }

    #[test]
    fn test_hnsw_with_m() {
        let hnsw = HnswConfig::with_m(8);
        assert_eq!(hnsw.m0, 16);
        assert!(hnsw.validate().is_ok());
    }

    #[test]
    fn test_invalid_hnsw_rejected() {
        let mut config = StoreConfig::new(3);
        config.hnsw.ef_search = 0;
        assert!(config.validate().is_err());

        let mut config = StoreConfig::new(3);
        config.hnsw.m0 = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_all_zero_weights_rejected() {
        let config = StoreConfig::new(3).with_weights(ScoreWeights::new(0.0, 0.0, 0.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_single_axis_weights_allowed() {
        let config = StoreConfig::new(3).with_weights(ScoreWeights::new(0.0, 1.0, 0.0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chunk_size_power_of_two() {
        let mut config = StoreConfig::new(3);
        config.meta.chunk_size = 60_000;
        assert!(config.validate().is_err());
    }
}
