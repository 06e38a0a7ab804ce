//! Byte-level codecs for the encrypted payload layer.
//!
//! Three frame families live inside the Olm-encrypted payload:
//!
//! - **Reliable-delivery frames** (subscriptions marked reliable):
//!   ```text
//!   DATA: [0x01][seq:u64 LE][payload...]
//!   ACK:  [0x02][range_count:u16 LE][(start:u64 LE, end:u64 LE) * count]
//!   ```
//! - **Snapshot chunks** (terminal streams, inside a DATA payload):
//!   ```text
//!   [0x02][snapshot_id:u32 LE][chunk_idx:u16 LE][total_chunks:u16 LE][data...]
//!   ```
//! - **Stream frames** (preview streams, inside a DATA payload):
//!   ```text
//!   [0x02][frame_type:1][stream_id:u16 BE][payload...]
//!   ```
//!
//! All decoders fail with [`CodecError::Malformed`] rather than panicking;
//! frames arrive from the network and must never be trusted for length.

// Rust guideline compliant 2026-02

use std::collections::BTreeSet;

/// Leading byte of a reliable DATA frame.
pub const FRAME_DATA: u8 = 0x01;

/// Leading byte of a reliable ACK frame.
pub const FRAME_ACK: u8 = 0x02;

/// ACK range count is carried as u16; anything beyond is dropped from the
/// frame and re-acknowledged on the next heartbeat.
pub const MAX_ACK_RANGES: usize = 65535;

/// Errors produced by the frame decoders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame too short for its claimed shape, or unknown leading byte.
    Malformed(&'static str),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(what) => write!(f, "malformed frame: {what}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// A decoded reliable-delivery frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload-carrying frame with a sequence number.
    Data {
        /// Monotonic sequence number assigned by the sender.
        seq: u64,
        /// The application payload, verbatim.
        payload: Vec<u8>,
    },
    /// Selective acknowledgment carrying inclusive received ranges.
    Ack {
        /// Coalesced `[start, end]` ranges of received sequence numbers.
        ranges: Vec<(u64, u64)>,
    },
}

/// Encode a DATA frame.
pub fn encode_data(seq: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + payload.len());
    out.push(FRAME_DATA);
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encode an ACK frame from coalesced ranges.
///
/// Ranges beyond [`MAX_ACK_RANGES`] are truncated; the receiver keeps
/// acknowledging on its heartbeat so the tail is never lost for good.
pub fn encode_ack(ranges: &[(u64, u64)]) -> Vec<u8> {
    let count = ranges.len().min(MAX_ACK_RANGES);
    let mut out = Vec::with_capacity(1 + 2 + count * 16);
    out.push(FRAME_ACK);
    out.extend_from_slice(&(count as u16).to_le_bytes());
    for &(start, end) in &ranges[..count] {
        out.extend_from_slice(&start.to_le_bytes());
        out.extend_from_slice(&end.to_le_bytes());
    }
    out
}

/// Decode a reliable-delivery frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    match bytes.first() {
        Some(&FRAME_DATA) => {
            if bytes.len() < 9 {
                return Err(CodecError::Malformed("DATA frame shorter than header"));
            }
            let seq = u64::from_le_bytes(bytes[1..9].try_into().expect("8 bytes"));
            Ok(Frame::Data {
                seq,
                payload: bytes[9..].to_vec(),
            })
        }
        Some(&FRAME_ACK) => {
            if bytes.len() < 3 {
                return Err(CodecError::Malformed("ACK frame shorter than header"));
            }
            let count = u16::from_le_bytes(bytes[1..3].try_into().expect("2 bytes")) as usize;
            let body = &bytes[3..];
            if body.len() < count * 16 {
                return Err(CodecError::Malformed("ACK frame shorter than range count"));
            }
            let mut ranges = Vec::with_capacity(count);
            for i in 0..count {
                let at = i * 16;
                let start = u64::from_le_bytes(body[at..at + 8].try_into().expect("8 bytes"));
                let end = u64::from_le_bytes(body[at + 8..at + 16].try_into().expect("8 bytes"));
                ranges.push((start, end));
            }
            Ok(Frame::Ack { ranges })
        }
        Some(_) => Err(CodecError::Malformed("unknown frame type byte")),
        None => Err(CodecError::Malformed("empty frame")),
    }
}

/// Convert a set of sequence numbers to coalesced inclusive ranges.
///
/// Example: {1, 2, 3, 5, 7, 8} -> [(1, 3), (5, 5), (7, 8)]
pub fn coalesce_ranges(set: &BTreeSet<u64>) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut iter = set.iter().peekable();

    while let Some(&start) = iter.next() {
        let mut end = start;
        while let Some(&&next) = iter.peek() {
            if next == end + 1 {
                end = next;
                iter.next();
            } else {
                break;
            }
        }
        ranges.push((start, end));
    }

    ranges
}

/// Expand coalesced ranges back into a set of sequence numbers.
pub fn ranges_to_set(ranges: &[(u64, u64)]) -> BTreeSet<u64> {
    let mut set = BTreeSet::new();
    for &(start, end) in ranges {
        for seq in start..=end {
            set.insert(seq);
        }
    }
    set
}

pub mod snapshot {
    //! Terminal snapshot chunk header.
    //!
    //! A snapshot (full terminal-state dump) is split into chunks that share
    //! a `snapshot_id`; the receiving side reassembles them in `chunk_idx`
    //! order and emits the concatenation exactly once.

    use super::CodecError;

    /// Routing byte that introduces a snapshot chunk inside a terminal
    /// payload.
    pub const SNAPSHOT_TAG: u8 = 0x02;

    /// Fixed header size including the routing byte.
    pub const HEADER_SIZE: usize = 1 + 4 + 2 + 2;

    /// One chunk of a terminal snapshot.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SnapshotChunk {
        /// Identifier shared by all chunks of one snapshot.
        pub snapshot_id: u32,
        /// Zero-based index of this chunk.
        pub chunk_idx: u16,
        /// Total number of chunks in the snapshot.
        pub total_chunks: u16,
        /// Chunk data.
        pub data: Vec<u8>,
    }

    /// Encode a chunk, including the leading routing byte.
    pub fn encode(chunk: &SnapshotChunk) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + chunk.data.len());
        out.push(SNAPSHOT_TAG);
        out.extend_from_slice(&chunk.snapshot_id.to_le_bytes());
        out.extend_from_slice(&chunk.chunk_idx.to_le_bytes());
        out.extend_from_slice(&chunk.total_chunks.to_le_bytes());
        out.extend_from_slice(&chunk.data);
        out
    }

    /// Parse a chunk from bytes beginning at the routing byte.
    pub fn parse(bytes: &[u8]) -> Result<SnapshotChunk, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::Malformed("snapshot chunk shorter than header"));
        }
        if bytes[0] != SNAPSHOT_TAG {
            return Err(CodecError::Malformed("snapshot chunk tag mismatch"));
        }
        Ok(SnapshotChunk {
            snapshot_id: u32::from_le_bytes(bytes[1..5].try_into().expect("4 bytes")),
            chunk_idx: u16::from_le_bytes(bytes[5..7].try_into().expect("2 bytes")),
            total_chunks: u16::from_le_bytes(bytes[7..9].try_into().expect("2 bytes")),
            data: bytes[9..].to_vec(),
        })
    }
}

pub mod stream {
    //! Preview stream-multiplexer frames.
    //!
    //! Many logical TCP-like streams share one preview subscription; each
    //! frame carries a stream id and one of five frame types.

    use super::CodecError;

    /// Routing byte that introduces a stream frame inside a preview payload.
    pub const STREAM_TAG: u8 = 0x02;

    /// Client->CLI, open a new stream. Payload = `[port:u16 BE]`.
    pub const OPEN: u8 = 0x00;
    /// Bidirectional raw data.
    pub const DATA: u8 = 0x01;
    /// Bidirectional close, empty payload.
    pub const CLOSE: u8 = 0x02;
    /// CLI->client, stream connected, empty payload.
    pub const OPENED: u8 = 0x03;
    /// CLI->client, error; payload = UTF-8 message.
    pub const ERROR: u8 = 0x04;

    /// Fixed header size including the routing byte.
    pub const HEADER_SIZE: usize = 1 + 1 + 2;

    /// A wire frame for the stream multiplexer.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct StreamFrame {
        /// Frame type (OPEN, DATA, CLOSE, OPENED, ERROR).
        pub frame_type: u8,
        /// Stream identifier.
        pub stream_id: u16,
        /// Frame payload.
        pub payload: Vec<u8>,
    }

    /// Encode a frame, including the leading routing byte.
    pub fn encode(frame: &StreamFrame) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + frame.payload.len());
        out.push(STREAM_TAG);
        out.push(frame.frame_type);
        out.extend_from_slice(&frame.stream_id.to_be_bytes());
        out.extend_from_slice(&frame.payload);
        out
    }

    /// Parse a frame from bytes beginning at the routing byte.
    pub fn parse(bytes: &[u8]) -> Result<StreamFrame, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::Malformed("stream frame shorter than header"));
        }
        if bytes[0] != STREAM_TAG {
            return Err(CodecError::Malformed("stream frame tag mismatch"));
        }
        Ok(StreamFrame {
            frame_type: bytes[1],
            stream_id: u16::from_be_bytes(bytes[2..4].try_into().expect("2 bytes")),
            payload: bytes[4..].to_vec(),
        })
    }
}
