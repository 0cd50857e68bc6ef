//! Vector type for TriaxDB.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A dense vector of floating-point values.
///
/// Vectors are immutable once attached to a noun; an update with a new
/// vector is modeled as delete-then-insert inside one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    data: Vec<f32>,
}

impl Vector {
    /// Creates a new vector from a slice of f32 values.
    #[inline]
    pub fn new(data: &[f32]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    /// Creates a vector from an owned `Vec<f32>`.
    #[inline]
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self { data }
    }

    /// Returns the dimension (length) of the vector.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.data.len()
    }

    /// Returns a slice view of the vector data.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Returns true if the vector has zero elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Computes the L2 (Euclidean) norm of the vector.
    #[inline]
    pub fn norm(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Returns true if every component is zero (within f32 exactness).
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|x| *x == 0.0)
    }

    /// Returns a normalized copy of the vector (unit length).
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the vector has zero norm.
    pub fn normalized(&self) -> Result<Self> {
        let norm = self.norm();
        if norm == 0.0 {
            return Err(Error::invalid("cannot normalize a zero vector"));
        }
        Ok(Self {
            data: self.data.iter().map(|x| x / norm).collect(),
        })
    }

    /// Ensures every component is finite.
    pub fn validate(&self) -> Result<()> {
        if self.data.iter().any(|x| !x.is_finite()) {
            return Err(Error::invalid("vector contains a non-finite component"));
        }
        Ok(())
    }

    /// Consumes the vector and returns the underlying data.
    #[inline]
    pub fn into_inner(self) -> Vec<f32> {
        self.data
    }
}

impl From<Vec<f32>> for Vector {
    fn from(data: Vec<f32>) -> Self {
        Self::from_vec(data)
    }
}

impl From<&[f32]> for Vector {
    fn from(data: &[f32]) -> Self {
        Self::new(data)
    }
}

impl AsRef<[f32]> for Vector {
    fn as_ref(&self) -> &[f32] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_creation() {
        let v = Vector::new(&[1.0, 2.0, 3.0]);
        assert_eq!(v.dimension(), 3);
        assert_eq!(v.as_slice(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_vector_norm() {
        let v = Vector::new(&[3.0, 4.0]);
        assert!((v.norm() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_vector_normalized() {
        let v = Vector::new(&[3.0, 4.0]);
        let normalized = v.normalized().unwrap();
        assert!((normalized.norm() - 1.0).abs() < 1e-6);
        assert!((normalized.as_slice()[0] - 0.6).abs() < 1e-6);
        assert!((normalized.as_slice()[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_normalize_fails() {
        let v = Vector::new(&[0.0, 0.0]);
        assert!(v.normalized().is_err());
        assert!(v.is_zero());
    }

    #[test]
    fn test_non_finite_rejected() {
        let v = Vector::new(&[1.0, f32::NAN]);
        assert!(v.validate().is_err());
    }

    #[test]
    fn test_vector_serialization() {
        let v = Vector::new(&[1.0, 2.0, 3.0]);
        let json = serde_json::to_string(&v).unwrap();
        let restored: Vector = serde_json::from_str(&json).unwrap();
        assert_eq!(v, restored);
    }
}
