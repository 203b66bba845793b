//! Relay Frames
//!
//! Messages published on a stream's events channel.
//!
//! # Frame Format
//!
//! ```text
//! +----------+------------------+----------------+---------------------------+
//! | Kind (1) | Sequence (8)     | Checksum (4)   | Payload (variable)        |
//! |          | big-endian u64   | CRC32, BE      | chunk bytes (Chunk only)  |
//! +----------+------------------+----------------+---------------------------+
//! ```
//!
//! - `Chunk`: sequence is the zero-based chunk index
//! - `Done`: sequence is the total chunk count, payload is empty
//!
//! The checksum covers kind, sequence and payload.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum payload size (10 MB)
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Kind + sequence + checksum
const HEADER_SIZE: usize = 13;

/// Errors decoding a relay frame
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than a header
    #[error("frame truncated: {0} bytes")]
    Truncated(usize),

    /// Unrecognised kind byte
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    /// Payload exceeds [`MAX_PAYLOAD_SIZE`]
    #[error("payload of {0} bytes exceeds maximum {MAX_PAYLOAD_SIZE}")]
    TooLarge(usize),

    /// Integrity check failed
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum computed over the received bytes
        actual: u32,
    },
}

/// A decoded relay frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One produced chunk
    Chunk {
        /// Zero-based position in the stream
        sequence: u64,
        /// Raw chunk bytes
        payload: Bytes,
    },
    /// The producer finished
    Done {
        /// Number of chunks the stream produced
        total: u64,
    },
}

const KIND_CHUNK: u8 = 0x01;
const KIND_DONE: u8 = 0x02;

#[inline]
fn checksum(kind: u8, sequence: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(&sequence.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

impl Frame {
    /// Encode into wire bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let (kind, sequence, payload): (u8, u64, &[u8]) = match self {
            Self::Chunk { sequence, payload } => (KIND_CHUNK, *sequence, payload),
            Self::Done { total } => (KIND_DONE, *total, &[]),
        };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u8(kind);
        buf.put_u64(sequence);
        buf.put_u32(checksum(kind, sequence, payload));
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decode wire bytes
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] for truncated, oversized, unknown or
    /// corrupted frames.
    pub fn decode(bytes: &Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated(bytes.len()));
        }

        let kind = bytes[0];
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&bytes[1..9]);
        let sequence = u64::from_be_bytes(sequence);
        let mut expected = [0u8; 4];
        expected.copy_from_slice(&bytes[9..HEADER_SIZE]);
        let expected = u32::from_be_bytes(expected);

        let payload = bytes.slice(HEADER_SIZE..);
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::TooLarge(payload.len()));
        }

        let actual = checksum(kind, sequence, &payload);
        if actual != expected {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }

        match kind {
            KIND_CHUNK => Ok(Self::Chunk { sequence, payload }),
            KIND_DONE => Ok(Self::Done { total: sequence }),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}
