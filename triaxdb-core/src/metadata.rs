//! Metadata documents attached to nouns and verbs.
//!
//! Metadata is a flat mapping of string keys to scalar values (booleans,
//! finite numbers, strings) or flat sequences thereof. Nested objects are
//! flattened by dotted path at ingest so that every indexed field has a
//! single-segment addressable name like `author.name`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Metadata document attached to a noun or verb.
///
/// Keys are ordered (BTreeMap) so serialization is canonical; the
/// [`content_hash`](Metadata::content_hash) derived from it is stable across
/// runs, which the graph index relies on for idempotent edge inserts.
///
/// # Example
///
/// ```
/// use triaxdb_core::Metadata;
///
/// let meta = Metadata::new()
///     .with_field("status", "active")
///     .with_field("year", 2024)
///     .with_field("tags", vec!["rust", "database"]);
///
/// assert_eq!(meta.get_str("status"), Some("active"));
/// assert_eq!(meta.get_i64("year"), Some(2024));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    data: BTreeMap<String, Value>,
}

impl Metadata {
    /// Creates a new empty document.
    #[inline]
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
        }
    }

    /// Builds a document from an arbitrary JSON object, flattening nested
    /// objects by dotted path and validating every leaf.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a leaf is a non-finite number, a nested array,
    /// or an object nested inside an array.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::invalid("metadata must be a JSON object"));
        };
        let mut data = BTreeMap::new();
        for (key, val) in map {
            flatten_into(&mut data, key, val)?;
        }
        Ok(Self { data })
    }

    /// Adds a field. Chainable. The value is validated lazily by
    /// [`validate`](Metadata::validate) on the write path.
    pub fn with_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Sets a field value.
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.data.insert(key.into(), value.into());
    }

    /// Gets a field value by key.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Gets a field as a string.
    #[inline]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Gets a field as an i64.
    #[inline]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| v.as_i64())
    }

    /// Gets a field as an f64.
    #[inline]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(|v| v.as_f64())
    }

    /// Gets a field as a bool.
    #[inline]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(|v| v.as_bool())
    }

    /// Removes a field and returns its value if present.
    #[inline]
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Returns true if the document contains the given key.
    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Returns the number of fields.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if there are no fields.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates over fields in key order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    /// Checks every value against the allowed shapes: booleans, finite
    /// numbers, strings, or flat sequences of those.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in &self.data {
            validate_leaf(key, value, true)?;
        }
        Ok(())
    }

    /// Stable content hash over the canonical serialization.
    ///
    /// Two documents with the same fields and values hash identically in
    /// every process; the graph index keys edge idempotency on this.
    pub fn content_hash(&self) -> u32 {
        // BTreeMap gives canonical key order, so the JSON text is stable.
        let bytes = serde_json::to_vec(&self.data).unwrap_or_default();
        crc32fast::hash(&bytes)
    }
}

fn flatten_into(out: &mut BTreeMap<String, Value>, key: String, value: Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (child_key, child) in map {
                flatten_into(out, format!("{key}.{child_key}"), child)?;
            }
        }
        other => {
            validate_leaf(&key, &other, true)?;
            out.insert(key, other);
        }
    }
    Ok(())
}

fn validate_leaf(key: &str, value: &Value, allow_seq: bool) -> Result<()> {
    match value {
        Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(n) => {
            if n.as_f64().map(f64::is_finite).unwrap_or(false) {
                Ok(())
            } else {
                Err(Error::invalid(format!(
                    "metadata field '{key}' is not a finite number"
                )))
            }
        }
        Value::Array(items) if allow_seq => {
            for item in items {
                validate_leaf(key, item, false)?;
            }
            Ok(())
        }
        Value::Array(_) => Err(Error::invalid(format!(
            "metadata field '{key}' nests a sequence inside a sequence"
        ))),
        Value::Null => Err(Error::invalid(format!(
            "metadata field '{key}' is null; omit the key instead"
        ))),
        Value::Object(_) => Err(Error::invalid(format!(
            "metadata field '{key}' holds a nested object; flatten with Metadata::from_value"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_builder() {
        let meta = Metadata::new()
            .with_field("name", "test")
            .with_field("count", 42);

        assert_eq!(meta.len(), 2);
        assert_eq!(meta.get_str("name"), Some("test"));
        assert_eq!(meta.get_i64("count"), Some(42));
    }

    #[test]
    fn test_nested_objects_flatten_by_dotted_path() {
        let meta = Metadata::from_value(json!({
            "author": { "name": "ada", "era": { "start": 1815 } },
            "title": "notes"
        }))
        .unwrap();

        assert_eq!(meta.get_str("author.name"), Some("ada"));
        assert_eq!(meta.get_i64("author.era.start"), Some(1815));
        assert_eq!(meta.get_str("title"), Some("notes"));
        assert!(meta.get("author").is_none());
    }

    #[test]
    fn test_flat_sequences_allowed() {
        let meta = Metadata::new().with_field("tags", vec!["a", "b"]);
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn test_nested_sequence_rejected() {
        let meta = Metadata::from_value(json!({ "bad": [[1, 2]] }));
        assert!(meta.is_err());
    }

    #[test]
    fn test_null_rejected() {
        let mut meta = Metadata::new();
        meta.set("x", Value::Null);
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_content_hash_is_order_independent() {
        let a = Metadata::new().with_field("x", 1).with_field("y", 2);
        let b = Metadata::new().with_field("y", 2).with_field("x", 1);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_content_hash_differs_on_value_change() {
        let a = Metadata::new().with_field("x", 1);
        let b = Metadata::new().with_field("x", 2);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_serialization_round_trip() {
        let meta = Metadata::new()
            .with_field("name", "test")
            .with_field("count", 42);

        let json = serde_json::to_string(&meta).unwrap();
        let restored: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, restored);
    }
}
