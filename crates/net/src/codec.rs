//! Message encoding and decoding with framing.
//!
//! Frame format: `[length: u32 LE][kind tag: u8][postcard envelope]`, where
//! length counts the tag and the payload but not itself.

use crate::protocol::{Envelope, MessageKind, PROTOCOL_MAGIC, PROTOCOL_VERSION};
use thiserror::Error;

/// Bytes preceding the postcard body.
pub const FRAME_HEADER_LEN: usize = 5;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Frame decoding failures. Every variant means the frame is discarded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes than a frame header.
    #[error("frame too short: {0} bytes (minimum 5)")]
    TooShort(usize),
    /// Length prefix points past the available data.
    #[error("incomplete frame: expected {expected} bytes, got {actual}")]
    Incomplete {
        /// Bytes the header promised.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },
    /// Tag byte outside the kind table.
    #[error("unknown message kind tag {0}")]
    UnknownKind(u8),
    /// Tag byte disagrees with the decoded payload.
    #[error("kind tag {tag} does not match payload kind {payload}")]
    KindMismatch {
        /// Tag byte read from the frame.
        tag: u8,
        /// Tag of the decoded payload.
        payload: u8,
    },
    /// Postcard rejected the body.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Compute schema hash from protocol definitions.
///
/// Both peers exchange this in `hello` to reject incompatible builds.
pub fn compute_schema_hash() -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&PROTOCOL_VERSION.to_le_bytes());
    hasher.update(PROTOCOL_MAGIC);

    // Kind table, in tag order
    for kind in MessageKind::ALL {
        hasher.update(&[kind.tag()]);
        hasher.update(kind.as_str().as_bytes());
    }
    hasher.update(b"Envelope");
    hasher.update(b"SnapshotWire");
    hasher.update(b"FullSyncPayload");

    digest_u64(hasher.finalize().as_bytes())
}

/// First eight bytes of a digest as a little-endian `u64`.
pub(crate) fn digest_u64(bytes: &[u8; 32]) -> u64 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(head)
}

/// Encode an envelope into a length-prefixed frame.
pub fn encode_message(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let payload =
        postcard::to_allocvec(envelope).map_err(|err| CodecError::Malformed(err.to_string()))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    let length = (1 + payload.len()) as u32;
    frame.extend_from_slice(&length.to_le_bytes());
    frame.push(envelope.kind().tag());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Decode one frame.
///
/// Expects data to start with the length prefix; trailing bytes past the
/// declared length are ignored.
pub fn decode_message(data: &[u8]) -> Result<Envelope, CodecError> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(CodecError::TooShort(data.len()));
    }

    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length == 0 {
        return Err(CodecError::TooShort(data.len()));
    }
    let expected = 4usize.saturating_add(length);
    if data.len() < expected {
        return Err(CodecError::Incomplete {
            expected,
            actual: data.len(),
        });
    }

    let tag = data[4];
    let kind = MessageKind::from_tag(tag).ok_or(CodecError::UnknownKind(tag))?;

    let envelope: Envelope = postcard::from_bytes(&data[FRAME_HEADER_LEN..expected])
        .map_err(|err| CodecError::Malformed(err.to_string()))?;

    if envelope.kind() != kind {
        return Err(CodecError::KindMismatch {
            tag,
            payload: envelope.kind().tag(),
        });
    }

    Ok(envelope)
}
