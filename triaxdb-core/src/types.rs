//! Core record types: nouns (vertices), verbs (typed directed edges),
//! identifiers, and timestamps.
//!
//! Records are id-referenced everywhere; no in-memory structure holds a
//! pointer into another index's memory. The [`IdTable`] assigns each noun a
//! dense internal [`DocId`] so that bitmap and HNSW structures can work with
//! `u32` keys while the public API speaks string ids.

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;
use crate::vector::Vector;

/// Dense internal id for a noun, used by bitmap posting lists and HNSW
/// node tables. Assigned by [`IdTable`]; never exposed through the public
/// API.
pub type DocId = u32;

/// Stable public identifier of a noun. Typically a UUID string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NounId(String);

impl NounId {
    /// Wraps an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NounId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NounId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NounId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable public identifier of a verb.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerbId(String);

impl VerbId {
    /// Wraps an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VerbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VerbId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for VerbId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The kind of a noun.
///
/// Kinds form a closed working set per deployment; the well-known ones are
/// provided as constants and new kinds are registered simply by
/// constructing the newtype. Kind names appear in storage keys, so they
/// must be non-empty printable ASCII without `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NounType(Cow<'static, str>);

impl NounType {
    pub const CONCEPT: NounType = NounType(Cow::Borrowed("Concept"));
    pub const DOCUMENT: NounType = NounType(Cow::Borrowed("Document"));
    pub const PERSON: NounType = NounType(Cow::Borrowed("Person"));
    pub const ORGANIZATION: NounType = NounType(Cow::Borrowed("Organization"));
    pub const LOCATION: NounType = NounType(Cow::Borrowed("Location"));
    pub const EVENT: NounType = NounType(Cow::Borrowed("Event"));
    pub const TOPIC: NounType = NounType(Cow::Borrowed("Topic"));
    pub const TASK: NounType = NounType(Cow::Borrowed("Task"));
    pub const MESSAGE: NounType = NounType(Cow::Borrowed("Message"));
    pub const FILE: NounType = NounType(Cow::Borrowed("File"));
    pub const PRODUCT: NounType = NounType(Cow::Borrowed("Product"));
    pub const PROJECT: NounType = NounType(Cow::Borrowed("Project"));

    /// Registers a custom kind.
    pub fn custom(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Returns the kind name.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the name is usable inside a storage key.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_graphic() && b != b'/')
    }
}

impl std::fmt::Display for NounType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NounType {
    fn from(s: &str) -> Self {
        Self(Cow::Owned(s.to_string()))
    }
}

/// The kind of a verb (relationship).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerbType(Cow<'static, str>);

impl VerbType {
    pub const RELATED_TO: VerbType = VerbType(Cow::Borrowed("RelatedTo"));
    pub const REFERENCES: VerbType = VerbType(Cow::Borrowed("References"));
    pub const CONTAINS: VerbType = VerbType(Cow::Borrowed("Contains"));
    pub const PART_OF: VerbType = VerbType(Cow::Borrowed("PartOf"));
    pub const CAUSES: VerbType = VerbType(Cow::Borrowed("Causes"));
    pub const SUPPORTS: VerbType = VerbType(Cow::Borrowed("Supports"));
    pub const CONTRADICTS: VerbType = VerbType(Cow::Borrowed("Contradicts"));
    pub const PRECEDES: VerbType = VerbType(Cow::Borrowed("Precedes"));
    pub const CREATED_BY: VerbType = VerbType(Cow::Borrowed("CreatedBy"));
    pub const OWNED_BY: VerbType = VerbType(Cow::Borrowed("OwnedBy"));
    pub const LOCATED_IN: VerbType = VerbType(Cow::Borrowed("LocatedIn"));
    pub const MEMBER_OF: VerbType = VerbType(Cow::Borrowed("MemberOf"));
    pub const DEPENDS_ON: VerbType = VerbType(Cow::Borrowed("DependsOn"));
    pub const DERIVED_FROM: VerbType = VerbType(Cow::Borrowed("DerivedFrom"));
    pub const MENTIONS: VerbType = VerbType(Cow::Borrowed("Mentions"));

    /// Registers a custom kind.
    pub fn custom(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Returns the kind name.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the name is usable inside a storage key.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_graphic() && b != b'/')
    }
}

impl std::fmt::Display for VerbType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VerbType {
    fn from(s: &str) -> Self {
        Self(Cow::Owned(s.to_string()))
    }
}

/// Milliseconds since the Unix epoch.
///
/// The store guards monotonicity with an atomic high-water mark so that
/// `created_at`/`updated_at` never step backwards under clock adjustments.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(ms)
    }

    /// Raw millisecond value.
    #[inline]
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

/// An indexed record: id + type + vector + metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Noun {
    pub id: NounId,
    pub noun_type: NounType,
    pub vector: Vector,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Noun {
    /// Creates a noun with a generated id and zeroed timestamps; the store
    /// stamps timestamps at commit.
    pub fn new(noun_type: NounType, vector: impl Into<Vector>) -> Self {
        Self {
            id: NounId::generate(),
            noun_type,
            vector: vector.into(),
            metadata: Metadata::new(),
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
        }
    }

    /// Sets the id. Chainable.
    pub fn with_id(mut self, id: impl Into<NounId>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the metadata document. Chainable.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A partial update to a noun.
///
/// Fields set to `None` are left untouched. Supplying a new vector is
/// executed as delete-then-insert in the vector index within the enclosing
/// transaction, since stored vectors are immutable.
#[derive(Debug, Clone, Default)]
pub struct NounPatch {
    pub vector: Option<Vector>,
    pub metadata: Option<Metadata>,
}

impl NounPatch {
    /// Empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the vector. Chainable.
    pub fn with_vector(mut self, vector: impl Into<Vector>) -> Self {
        self.vector = Some(vector.into());
        self
    }

    /// Replaces the metadata document. Chainable.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// True if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.vector.is_none() && self.metadata.is_none()
    }
}

/// A typed directed relationship between two nouns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verb {
    pub id: VerbId,
    pub source: NounId,
    pub target: NounId,
    pub verb_type: VerbType,
    /// Non-negative edge weight; 1.0 when unspecified.
    pub weight: f32,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Verb {
    /// Creates a verb with a generated id, default weight, and zeroed
    /// timestamps; the store stamps timestamps at commit.
    pub fn new(source: NounId, target: NounId, verb_type: VerbType) -> Self {
        Self {
            id: VerbId::generate(),
            source,
            target,
            verb_type,
            weight: 1.0,
            metadata: Metadata::new(),
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
        }
    }

    /// Sets the weight. Chainable.
    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the metadata document. Chainable.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Resolved identity of a dense doc id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdEntry {
    pub noun_id: NounId,
    pub noun_type: NounType,
}

/// Bidirectional mapping between public noun ids and dense [`DocId`]s.
///
/// Released slots are recycled so the id space stays dense, which keeps
/// roaring bitmaps and the metadata chunking compact.
#[derive(Debug, Default)]
pub struct IdTable {
    by_noun: HashMap<NounId, DocId>,
    entries: Vec<Option<IdEntry>>,
    free: Vec<DocId>,
}

impl IdTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a doc id to a noun, recycling freed slots first.
    ///
    /// Returns the existing assignment if the noun is already present.
    pub fn assign(&mut self, noun_id: NounId, noun_type: NounType) -> DocId {
        if let Some(&doc) = self.by_noun.get(&noun_id) {
            return doc;
        }
        let doc = match self.free.pop() {
            Some(doc) => {
                self.entries[doc as usize] = Some(IdEntry {
                    noun_id: noun_id.clone(),
                    noun_type,
                });
                doc
            }
            None => {
                let doc = self.entries.len() as DocId;
                self.entries.push(Some(IdEntry {
                    noun_id: noun_id.clone(),
                    noun_type,
                }));
                doc
            }
        };
        self.by_noun.insert(noun_id, doc);
        doc
    }

    /// Places an assignment at an exact slot, growing the table as needed.
    /// Used when restoring a persisted table or compensating a delete;
    /// the slot is pulled back out of the free list if it was there.
    pub fn restore(&mut self, doc: DocId, noun_id: NounId, noun_type: NounType) {
        let idx = doc as usize;
        if self.entries.len() <= idx {
            self.entries.resize(idx + 1, None);
        }
        self.entries[idx] = Some(IdEntry {
            noun_id: noun_id.clone(),
            noun_type,
        });
        self.free.retain(|d| *d != doc);
        self.by_noun.insert(noun_id, doc);
    }

    /// Recomputes the free list from the gaps in the slot array. Called
    /// once after a batch of [`restore`](Self::restore) calls.
    pub fn rebuild_free_list(&mut self) {
        self.free = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_none())
            .map(|(idx, _)| idx as DocId)
            .rev()
            .collect();
    }

    /// Releases a noun's slot for reuse. Returns the freed doc id.
    pub fn release(&mut self, noun_id: &NounId) -> Option<DocId> {
        let doc = self.by_noun.remove(noun_id)?;
        self.entries[doc as usize] = None;
        self.free.push(doc);
        Some(doc)
    }

    /// Looks up the doc id for a noun.
    #[inline]
    pub fn doc_of(&self, noun_id: &NounId) -> Option<DocId> {
        self.by_noun.get(noun_id).copied()
    }

    /// Resolves a doc id back to its identity.
    #[inline]
    pub fn resolve(&self, doc: DocId) -> Option<&IdEntry> {
        self.entries.get(doc as usize).and_then(|e| e.as_ref())
    }

    /// Number of live assignments.
    #[inline]
    pub fn len(&self) -> usize {
        self.by_noun.len()
    }

    /// True if no nouns are assigned.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_noun.is_empty()
    }

    /// Iterates over live `(doc, entry)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (DocId, &IdEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(doc, entry)| entry.as_ref().map(|e| (doc as DocId, e)))
    }
}
