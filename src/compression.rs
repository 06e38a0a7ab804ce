//! Gzip compression for channel payloads.
//!
//! Payloads travelling inside the encrypted channel carry a one-byte marker
//! prefix describing how to interpret what follows:
//!
//! - `0x00` - no compression; raw bytes (usually UTF-8 JSON) follow
//! - `0x01` - raw terminal bytes (direct PTY output, no JSON involved)
//! - `0x1f` - gzip-compressed UTF-8 JSON (0x1f is the gzip magic byte)
//! - anything else - legacy clients that never added markers; treated as
//!   raw UTF-8 JSON
//!
//! # Usage
//!
//! ```ignore
//! // Compress if over threshold
//! let framed = maybe_compress(data, Some(4096))?;
//!
//! // Strip the marker and inflate if needed
//! let plain = maybe_decompress(&framed)?;
//! ```

// Rust guideline compliant 2025-01

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Marker byte for uncompressed data.
pub const MARKER_UNCOMPRESSED: u8 = 0x00;

/// Marker byte for raw terminal output bytes.
pub const MARKER_TERMINAL: u8 = 0x01;

/// Marker byte for gzip-compressed data (also gzip magic byte).
pub const MARKER_GZIP: u8 = 0x1f;

/// Errors from the compression layer.
#[derive(Debug)]
pub enum CompressionError {
    /// Gzip encoding failed.
    Compress(String),
    /// Gzip decoding failed.
    Decompress(String),
}

impl std::fmt::Display for CompressionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compress(msg) => write!(f, "gzip compress failed: {msg}"),
            Self::Decompress(msg) => write!(f, "gzip decompress failed: {msg}"),
        }
    }
}

impl std::error::Error for CompressionError {}

/// Compress data if it exceeds the threshold.
///
/// Returns data with a marker byte prefix indicating compression status.
/// If compression doesn't reduce size, returns uncompressed with the `0x00`
/// marker.
pub fn maybe_compress(
    data: &[u8],
    threshold: Option<usize>,
) -> Result<Vec<u8>, CompressionError> {
    let threshold = match threshold {
        Some(t) => t,
        None => return Ok(with_marker(MARKER_UNCOMPRESSED, data)),
    };

    if data.len() < threshold {
        return Ok(with_marker(MARKER_UNCOMPRESSED, data));
    }

    let mut compressed = Vec::with_capacity(data.len());
    compressed.push(MARKER_GZIP);

    {
        let mut encoder = GzEncoder::new(&mut compressed, Compression::fast());
        encoder
            .write_all(data)
            .map_err(|e| CompressionError::Compress(format!("write: {e}")))?;
        encoder
            .finish()
            .map_err(|e| CompressionError::Compress(format!("finish: {e}")))?;
    }

    // Only use compressed if actually smaller
    if compressed.len() < data.len() + 1 {
        Ok(compressed)
    } else {
        Ok(with_marker(MARKER_UNCOMPRESSED, data))
    }
}

/// Decompress data based on the marker byte.
///
/// Returns the payload without its marker. Unknown markers are passed
/// through whole for legacy clients that never prefixed one.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if data.is_empty() {
        return Ok(vec![]);
    }

    match data[0] {
        MARKER_UNCOMPRESSED | MARKER_TERMINAL => Ok(data[1..].to_vec()),
        MARKER_GZIP => {
            let mut decoder = GzDecoder::new(&data[1..]);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| CompressionError::Decompress(e.to_string()))?;
            Ok(decompressed)
        }
        _ => Ok(data.to_vec()),
    }
}

fn with_marker(marker: u8, data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(1 + data.len());
    result.push(marker);
    result.extend_from_slice(data);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_uncompressed() {
        let data = b"hello world";
        let framed = maybe_compress(data, Some(1000)).expect("compress");

        assert_eq!(framed[0], MARKER_UNCOMPRESSED);

        let plain = maybe_decompress(&framed).expect("decompress");
        assert_eq!(plain, data);
    }

    #[test]
    fn test_roundtrip_compressed() {
        // Repetitive data compresses well
        let data: Vec<u8> = (0..10000).map(|i| (i % 256) as u8).collect();
        let framed = maybe_compress(&data, Some(100)).expect("compress");

        assert_eq!(framed[0], MARKER_GZIP);
        assert!(framed.len() < data.len());

        let plain = maybe_decompress(&framed).expect("decompress");
        assert_eq!(plain, data);
    }

    #[test]
    fn test_compression_disabled() {
        let data = b"hello world this is a longer string";
        let framed = maybe_compress(data, None).expect("compress");

        assert_eq!(framed[0], MARKER_UNCOMPRESSED);
        assert_eq!(&framed[1..], data.as_slice());
    }

    #[test]
    fn test_terminal_marker_strips() {
        let mut framed = vec![MARKER_TERMINAL];
        framed.extend_from_slice(b"\x1b[2Jls\r\n");
        let plain = maybe_decompress(&framed).expect("decompress");
        assert_eq!(plain, b"\x1b[2Jls\r\n");
    }

    #[test]
    fn test_empty_data() {
        let plain = maybe_decompress(&[]).expect("decompress");
        assert!(plain.is_empty());
    }

    #[test]
    fn test_legacy_json_passthrough() {
        // Legacy peers send bare JSON without a marker
        let json_data = br#"{"type":"input_ready"}"#;
        let result = maybe_decompress(json_data).expect("should pass through");
        assert_eq!(result, json_data);
    }

    #[test]
    fn test_incompressible_data_still_roundtrips() {
        let data: Vec<u8> = (0..1000).map(|_| rand::random::<u8>()).collect();
        let framed = maybe_compress(&data, Some(100)).expect("compress");
        let plain = maybe_decompress(&framed).expect("decompress");
        assert_eq!(plain, data);
    }
}
