//! Binary frame codec for persisted records.
//!
//! Every value written through the storage adapter is wrapped in a frame:
//!
//! ```text
//! [length:u32][version:u8][payload...][checksum:u32]
//! ```
//!
//! `length` counts the version byte plus the payload; the checksum trailer
//! covers the same region. An unknown version tag decodes to
//! [`Error::UnsupportedVersion`]; a checksum or length mismatch decodes to
//! [`Error::IndexCorrupt`].

use crate::error::{Error, Result};

/// Frame version for noun/verb/commit records (JSON payload).
pub const RECORD_V1: u8 = 1;
/// Frame version for serialized HNSW partition blocks (binary payload).
pub const HNSW_PARTITION_V1: u8 = 2;
/// Frame version for metadata index chunks (binary payload).
pub const META_CHUNK_V1: u8 = 3;
/// Frame version for graph adjacency blocks (JSON payload).
pub const GRAPH_BLOCK_V1: u8 = 4;
/// Frame version for the store manifest (JSON payload).
pub const STORE_META_V1: u8 = 5;

const HEADER_LEN: usize = 4;
const TRAILER_LEN: usize = 4;

/// Wraps a payload in a versioned, checksummed frame.
pub fn encode(version: u8, payload: &[u8]) -> Vec<u8> {
    let body_len = 1 + payload.len();
    let mut out = Vec::with_capacity(HEADER_LEN + body_len + TRAILER_LEN);
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    out.push(version);
    out.extend_from_slice(payload);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&out[HEADER_LEN..]);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out
}

/// Unwraps a frame, verifying length and checksum and that the version tag
/// is the expected one.
///
/// Returns the payload slice.
pub fn decode(bytes: &[u8], expected_version: u8) -> Result<&[u8]> {
    let (version, payload) = decode_any(bytes)?;
    if version != expected_version {
        return Err(Error::UnsupportedVersion(version));
    }
    Ok(payload)
}

/// Unwraps a frame without constraining the version tag.
///
/// Returns `(version, payload)`.
pub fn decode_any(bytes: &[u8]) -> Result<(u8, &[u8])> {
    if bytes.len() < HEADER_LEN + 1 + TRAILER_LEN {
        return Err(Error::corrupt(format!(
            "frame too short: {} bytes",
            bytes.len()
        )));
    }

    let body_len = u32::from_le_bytes(bytes[..HEADER_LEN].try_into().unwrap()) as usize;
    if bytes.len() != HEADER_LEN + body_len + TRAILER_LEN {
        return Err(Error::corrupt(format!(
            "frame length mismatch: header says {}, frame holds {}",
            body_len,
            bytes.len() - HEADER_LEN - TRAILER_LEN
        )));
    }

    let body = &bytes[HEADER_LEN..HEADER_LEN + body_len];
    let stored = u32::from_le_bytes(bytes[HEADER_LEN + body_len..].try_into().unwrap());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    let actual = hasher.finalize();
    if actual != stored {
        return Err(Error::corrupt(format!(
            "frame checksum mismatch: expected {stored}, got {actual}"
        )));
    }

    Ok((body[0], &body[1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_round_trip() {
        let payload = b"hello frames";
        let frame = encode(RECORD_V1, payload);
        let decoded = decode(&frame, RECORD_V1).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_reencode_is_byte_identical() {
        let payload = vec![7u8; 333];
        let frame = encode(META_CHUNK_V1, &payload);
        let decoded = decode(&frame, META_CHUNK_V1).unwrap();
        assert_eq!(encode(META_CHUNK_V1, decoded), frame);
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode(RECORD_V1, &[]);
        assert_eq!(decode(&frame, RECORD_V1).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let frame = encode(99, b"x");
        let err = decode(&frame, RECORD_V1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let mut frame = encode(RECORD_V1, b"payload");
        let mid = frame.len() / 2;
        frame[mid] ^= 0xFF;
        let err = decode(&frame, RECORD_V1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexCorrupt);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = encode(RECORD_V1, b"payload");
        let err = decode(&frame[..frame.len() - 2], RECORD_V1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexCorrupt);
    }

    #[test]
    fn test_too_short_rejected() {
        assert!(decode_any(&[1, 2, 3]).is_err());
    }
}
