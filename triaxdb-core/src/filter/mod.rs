//! Filter expressions for metadata-based filtering.
//!
//! Filters combine leaf predicates over metadata fields with `AND`/`OR`/
//! `NOT`, enabling queries like "similar vectors where status = 'active'
//! AND year >= 2024". The same expression evaluates two ways: directly
//! against a [`Metadata`] document via [`Filter::matches`], and against the
//! bitmap index via [`MetadataIndex::query`](crate::MetadataIndex::query).
//! The two are kept semantically identical; property tests pin them to each
//! other.

pub mod meta_index;

pub use meta_index::MetadataIndex;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metadata::Metadata;

/// A filter expression that can be evaluated against metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub(crate) condition: FilterCondition,
}

impl Filter {
    /// Creates a filter for a specific field.
    ///
    /// # Example
    ///
    /// ```
    /// use triaxdb_core::Filter;
    ///
    /// let filter = Filter::field("status").eq("active");
    /// ```
    pub fn field(name: &str) -> FieldFilter {
        FieldFilter {
            field_name: name.to_string(),
        }
    }

    /// Creates a filter from a condition.
    pub fn from_condition(condition: FilterCondition) -> Self {
        Self { condition }
    }

    /// Combines this filter with another using AND.
    pub fn and(self, other: Filter) -> Self {
        Self {
            condition: FilterCondition::And(Box::new(self.condition), Box::new(other.condition)),
        }
    }

    /// Combines this filter with another using OR.
    pub fn or(self, other: Filter) -> Self {
        Self {
            condition: FilterCondition::Or(Box::new(self.condition), Box::new(other.condition)),
        }
    }

    /// Negates this filter.
    #[allow(clippy::should_implement_trait)]
    pub fn negate(self) -> Self {
        Self {
            condition: FilterCondition::Not(Box::new(self.condition)),
        }
    }

    /// Evaluates the filter against a metadata document.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.condition.matches(metadata)
    }
}

/// Builder for field-specific filter conditions.
#[derive(Debug)]
pub struct FieldFilter {
    field_name: String,
}

impl FieldFilter {
    /// Field equals value.
    pub fn eq<V: Into<Value>>(self, value: V) -> Filter {
        Filter::from_condition(FilterCondition::Eq(self.field_name, value.into()))
    }

    /// Field not equals value. Matches when the field is absent.
    pub fn ne<V: Into<Value>>(self, value: V) -> Filter {
        Filter::from_condition(FilterCondition::Ne(self.field_name, value.into()))
    }

    /// Field greater than value.
    pub fn gt<V: Into<Value>>(self, value: V) -> Filter {
        Filter::from_condition(FilterCondition::Gt(self.field_name, value.into()))
    }

    /// Field greater than or equal to value.
    pub fn gte<V: Into<Value>>(self, value: V) -> Filter {
        Filter::from_condition(FilterCondition::Ge(self.field_name, value.into()))
    }

    /// Field less than value.
    pub fn lt<V: Into<Value>>(self, value: V) -> Filter {
        Filter::from_condition(FilterCondition::Lt(self.field_name, value.into()))
    }

    /// Field less than or equal to value.
    pub fn lte<V: Into<Value>>(self, value: V) -> Filter {
        Filter::from_condition(FilterCondition::Le(self.field_name, value.into()))
    }

    /// Field value is in the given list.
    pub fn contained_in<V: Into<Value>>(self, values: Vec<V>) -> Filter {
        let values: Vec<Value> = values.into_iter().map(|v| v.into()).collect();
        Filter::from_condition(FilterCondition::In(self.field_name, values))
    }

    /// String field starts with the given prefix.
    pub fn prefix(self, prefix: &str) -> Filter {
        Filter::from_condition(FilterCondition::Prefix(
            self.field_name,
            prefix.to_string(),
        ))
    }

    /// Field value lies in `[low, high]` (both ends inclusive).
    pub fn between<V: Into<Value>>(self, low: V, high: V) -> Filter {
        Filter::from_condition(FilterCondition::Range {
            field: self.field_name,
            low: low.into(),
            high: high.into(),
        })
    }

    /// Field exists (is not missing).
    pub fn exists(self) -> Filter {
        Filter::from_condition(FilterCondition::Exists(self.field_name))
    }
}

/// The filter condition variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterCondition {
    /// Field equals value
    Eq(String, Value),
    /// Field not equals value
    Ne(String, Value),
    /// Field less than value
    Lt(String, Value),
    /// Field less than or equal to value
    Le(String, Value),
    /// Field greater than value
    Gt(String, Value),
    /// Field greater than or equal to value
    Ge(String, Value),
    /// Field value is in list
    In(String, Vec<Value>),
    /// Field exists
    Exists(String),
    /// String field starts with prefix
    Prefix(String, String),
    /// Field value in `[low, high]`, inclusive
    Range {
        field: String,
        low: Value,
        high: Value,
    },
    /// Logical AND
    And(Box<FilterCondition>, Box<FilterCondition>),
    /// Logical OR
    Or(Box<FilterCondition>, Box<FilterCondition>),
    /// Logical NOT
    Not(Box<FilterCondition>),
}

impl FilterCondition {
    /// Evaluates this condition against a metadata document.
    ///
    /// A sequence-valued field matches a leaf predicate when any of its
    /// elements does — the same semantics the bitmap index gets by posting
    /// every element individually.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            FilterCondition::Eq(field, value) => {
                Self::any_key(metadata, field, |k| Some(k) == ValueKey::from_value(value).as_ref())
            }
            FilterCondition::Ne(field, value) => {
                !Self::any_key(metadata, field, |k| Some(k) == ValueKey::from_value(value).as_ref())
            }
            FilterCondition::Lt(field, value) => Self::any_cmp(metadata, field, value, Ordering::is_lt),
            FilterCondition::Le(field, value) => Self::any_cmp(metadata, field, value, Ordering::is_le),
            FilterCondition::Gt(field, value) => Self::any_cmp(metadata, field, value, Ordering::is_gt),
            FilterCondition::Ge(field, value) => Self::any_cmp(metadata, field, value, Ordering::is_ge),
            FilterCondition::In(field, values) => {
                let probes: Vec<ValueKey> =
                    values.iter().filter_map(ValueKey::from_value).collect();
                Self::any_key(metadata, field, |k| probes.contains(k))
            }
            FilterCondition::Exists(field) => metadata.contains_key(field),
            FilterCondition::Prefix(field, prefix) => Self::any_key(metadata, field, |k| {
                matches!(k, ValueKey::Str(s) if s.starts_with(prefix))
            }),
            FilterCondition::Range { field, low, high } => {
                let (Some(lo), Some(hi)) =
                    (ValueKey::from_value(low), ValueKey::from_value(high))
                else {
                    return false;
                };
                Self::any_key(metadata, field, |k| {
                    k.same_kind(&lo) && *k >= lo && *k <= hi
                })
            }
            FilterCondition::And(a, b) => a.matches(metadata) && b.matches(metadata),
            FilterCondition::Or(a, b) => a.matches(metadata) || b.matches(metadata),
            FilterCondition::Not(c) => !c.matches(metadata),
        }
    }

    fn any_key(metadata: &Metadata, field: &str, pred: impl Fn(&ValueKey) -> bool) -> bool {
        field_keys(metadata, field).any(|k| pred(&k))
    }

    fn any_cmp(
        metadata: &Metadata,
        field: &str,
        probe: &Value,
        accept: impl Fn(Ordering) -> bool,
    ) -> bool {
        let Some(probe) = ValueKey::from_value(probe) else {
            return false;
        };
        field_keys(metadata, field)
            .any(|k| k.same_kind(&probe) && accept(k.cmp(&probe)))
    }
}

/// Yields the indexable keys of a field: the scalar itself, or each element
/// of a flat sequence.
pub(crate) fn field_keys<'a>(
    metadata: &'a Metadata,
    field: &str,
) -> Box<dyn Iterator<Item = ValueKey> + 'a> {
    match metadata.get(field) {
        Some(Value::Array(items)) => Box::new(items.iter().filter_map(ValueKey::from_value)),
        Some(value) => match ValueKey::from_value(value) {
            Some(key) => Box::new(std::iter::once(key)),
            None => Box::new(std::iter::empty()),
        },
        None => Box::new(std::iter::empty()),
    }
}

/// A totally ordered, hashable scalar key for index entries.
///
/// Kinds order `Bool < Num < Str`; numbers compare via IEEE total order so
/// the sorted runs in the metadata index have a single consistent layout.
/// Comparison predicates only accept keys of the probe's kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueKey {
    Bool(bool),
    Num(f64),
    Str(String),
}

impl ValueKey {
    /// Converts a scalar JSON value. Arrays, objects, and null yield `None`
    /// (arrays are expanded by the caller, the rest are not indexable).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            // Normalize -0.0 so hashing and equality agree with comparison.
            Value::Number(n) => n.as_f64().map(|f| Self::Num(if f == 0.0 { 0.0 } else { f })),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    /// True if both keys have the same kind (bool/num/str).
    pub fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Num(_) => 1,
            Self::Str(_) => 2,
        }
    }
}

impl Eq for ValueKey {}

impl PartialOrd for ValueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ValueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Num(a), Self::Num(b)) => a.total_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl std::hash::Hash for ValueKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Bool(b) => b.hash(state),
            Self::Num(f) => f.to_bits().hash(state),
            Self::Str(s) => s.hash(state),
        }
    }
}
