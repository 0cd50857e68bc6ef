//! Distance metrics for vector similarity computations.

use serde::{Deserialize, Serialize};

/// Supported distance metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Cosine distance (1 - cosine similarity). Lower is more similar.
    Cosine,
    /// Euclidean distance (L2 norm). Lower is more similar.
    Euclidean,
}

impl Default for DistanceMetric {
    fn default() -> Self {
        Self::Cosine
    }
}

impl DistanceMetric {
    /// Computes the distance between two vectors using this metric.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if vectors have different dimensions; the
    /// store validates dimensions on every entry point.
    #[inline]
    pub fn compute(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");

        match self {
            DistanceMetric::Cosine => cosine_distance(a, b),
            DistanceMetric::Euclidean => euclidean_distance(a, b),
        }
    }

    /// Maps a distance to a similarity score in [0, 1].
    ///
    /// Cosine distance has range [0, 2], so the score is `1 - d/2`.
    /// Euclidean distance is unbounded and maps via `1 / (1 + d)`.
    #[inline]
    pub fn similarity(&self, distance: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => (1.0 - distance / 2.0).clamp(0.0, 1.0),
            DistanceMetric::Euclidean => 1.0 / (1.0 + distance.max(0.0)),
        }
    }

    /// Parses the metric name persisted in store metadata.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Cosine" => Some(Self::Cosine),
            "Euclidean" => Some(Self::Euclidean),
            _ => None,
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cosine => write!(f, "Cosine"),
            Self::Euclidean => write!(f, "Euclidean"),
        }
    }
}

/// Computes Euclidean (L2) distance between two vectors.
#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    euclidean_distance_squared(a, b).sqrt()
}

/// Computes squared Euclidean distance (avoids sqrt for comparisons).
#[inline]
pub fn euclidean_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

/// Computes cosine distance between two vectors.
///
/// Formula: 1 - (a · b) / (||a|| * ||b||)
/// Range: [0, 2] where 0 = identical direction, 2 = opposite direction.
/// A zero operand makes the ratio undefined; the engine rejects zero query
/// vectors upstream, and this function treats the degenerate case as
/// maximally dissimilar.
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot = dot_product(a, b);
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    let denominator = norm_a * norm_b;
    if denominator == 0.0 {
        return 1.0;
    }

    1.0 - (dot / denominator)
}

/// Computes dot product (inner product) between two vectors.
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];
        assert!((euclidean_distance(&a, &b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_same_vector() {
        let a = [1.0, 2.0, 3.0];
        assert!(euclidean_distance(&a, &a) < 1e-10);
    }

    #[test]
    fn test_cosine_distance_identical() {
        let a = [1.0, 0.0];
        let b = [2.0, 0.0]; // Same direction, different magnitude
        assert!(cosine_distance(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_orthogonal() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_opposite() {
        let a = [1.0, 0.0];
        let b = [-1.0, 0.0];
        assert!((cosine_distance(&a, &b) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_range() {
        assert!((DistanceMetric::Cosine.similarity(0.0) - 1.0).abs() < 1e-6);
        assert!(DistanceMetric::Cosine.similarity(2.0).abs() < 1e-6);
        assert!((DistanceMetric::Euclidean.similarity(0.0) - 1.0).abs() < 1e-6);
        assert!(DistanceMetric::Euclidean.similarity(99.0) < 0.02);
    }

    #[test]
    fn test_metric_parse_round_trip() {
        for metric in [DistanceMetric::Cosine, DistanceMetric::Euclidean] {
            assert_eq!(DistanceMetric::parse(&metric.to_string()), Some(metric));
        }
        assert_eq!(DistanceMetric::parse("Manhattan"), None);
    }
}
