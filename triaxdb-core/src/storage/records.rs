//! Framed JSON codecs for noun, verb, and commit-log records.
//!
//! The graph rebuild path decodes verb records straight off the raw
//! `verbs/` prefix, so these codecs live beside the storage layer rather
//! than inside the store facade.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::frame;
use crate::types::{Noun, Timestamp, Verb};

/// Encodes a noun record frame.
pub fn encode_noun(noun: &Noun) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(noun)
        .map_err(|e| crate::error::Error::invalid(format!("noun serialize failed: {e}")))?;
    Ok(frame::encode(frame::RECORD_V1, &payload))
}

/// Decodes a noun record frame.
pub fn decode_noun(bytes: &[u8]) -> Result<Noun> {
    let payload = frame::decode(bytes, frame::RECORD_V1)?;
    serde_json::from_slice(payload)
        .map_err(|e| crate::error::Error::corrupt(format!("noun decode failed: {e}")))
}

/// Encodes a verb record frame.
pub fn encode_verb(verb: &Verb) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(verb)
        .map_err(|e| crate::error::Error::invalid(format!("verb serialize failed: {e}")))?;
    Ok(frame::encode(frame::RECORD_V1, &payload))
}

/// Decodes a verb record frame.
pub fn decode_verb(bytes: &[u8]) -> Result<Verb> {
    let payload = frame::decode(bytes, frame::RECORD_V1)?;
    serde_json::from_slice(payload)
        .map_err(|e| crate::error::Error::corrupt(format!("verb decode failed: {e}")))
}

/// A commit-log entry, written after a transaction's forward pass
/// completes. Recovery and audits read these; they are never replayed as a
/// redo log because index writes go through the adapter directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub tx_id: String,
    pub operations: u32,
    pub committed_at: Timestamp,
}

/// Encodes a commit-log record frame.
pub fn encode_commit(record: &CommitRecord) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(record)
        .map_err(|e| crate::error::Error::invalid(format!("commit serialize failed: {e}")))?;
    Ok(frame::encode(frame::RECORD_V1, &payload))
}

/// Decodes a commit-log record frame.
pub fn decode_commit(bytes: &[u8]) -> Result<CommitRecord> {
    let payload = frame::decode(bytes, frame::RECORD_V1)?;
    serde_json::from_slice(payload)
        .map_err(|e| crate::error::Error::corrupt(format!("commit decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::types::{NounType, VerbType};

    #[test]
    fn test_noun_round_trip() {
        let noun = Noun::new(NounType::CONCEPT, vec![1.0, 0.0])
            .with_metadata(Metadata::new().with_field("status", "active"));
        let bytes = encode_noun(&noun).unwrap();
        assert_eq!(decode_noun(&bytes).unwrap(), noun);
    }

    #[test]
    fn test_verb_round_trip() {
        let verb = Verb::new("a".into(), "b".into(), VerbType::RELATED_TO).with_weight(2.5);
        let bytes = encode_verb(&verb).unwrap();
        assert_eq!(decode_verb(&bytes).unwrap(), verb);
    }

    #[test]
    fn test_commit_round_trip() {
        let record = CommitRecord {
            tx_id: "tx-1".to_string(),
            operations: 3,
            committed_at: Timestamp(1234),
        };
        let bytes = encode_commit(&record).unwrap();
        assert_eq!(decode_commit(&bytes).unwrap(), record);
    }

    #[test]
    fn test_corrupt_record_detected() {
        let noun = Noun::new(NounType::CONCEPT, vec![1.0]);
        let mut bytes = encode_noun(&noun).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        assert!(decode_noun(&bytes).is_err());
    }
}
