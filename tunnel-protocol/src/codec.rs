//! Binary wire codec for [`Message`].
//!
//! `encode` bincode-serializes a message, then LZ4-compresses the result
//! when it is larger than [`COMPRESSION_THRESHOLD_BYTES`], prefixing it
//! with a magic marker so `decode` can tell compressed frames from plain
//! ones without an out-of-band flag. A JSON mode exists for debugging and
//! is explicitly not wire-compatible with the binary form.

use crate::message::Message;
use thiserror::Error;

/// Frames above this size (bytes, post-bincode) get LZ4 block-compressed.
pub const COMPRESSION_THRESHOLD_BYTES: usize = 2048;

/// Magic prefix marking an LZ4-compressed frame.
const COMPRESSED_MAGIC: &[u8; 4] = b"OCTZ";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("frame truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Encode a message to its wire representation, compressing large frames.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let raw = bincode::serialize(message)?;

    if raw.len() <= COMPRESSION_THRESHOLD_BYTES {
        return Ok(raw);
    }

    let compressed = lz4_flex::block::compress(&raw);
    let mut framed = Vec::with_capacity(compressed.len() + 8);
    framed.extend_from_slice(COMPRESSED_MAGIC);
    framed.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    framed.extend_from_slice(&compressed);
    Ok(framed)
}

/// Decode a message from its wire representation. Unknown variant tags
/// and truncated frames surface as [`CodecError`], never a panic.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    if bytes.starts_with(COMPRESSED_MAGIC) {
        if bytes.len() < 8 {
            return Err(CodecError::Truncated {
                expected: 8,
                actual: bytes.len(),
            });
        }
        let uncompressed_len =
            u32::from_le_bytes(bytes[4..8].try_into().expect("slice is 4 bytes")) as usize;
        let raw = lz4_flex::block::decompress(&bytes[8..], uncompressed_len)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        return bincode::deserialize(&raw).map_err(|e| CodecError::Decode(e.to_string()));
    }

    bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Debug-only JSON encoding. Not wire-compatible with [`encode`]/[`decode`].
pub fn to_json(message: &Message) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Debug-only JSON decoding. Not wire-compatible with [`encode`]/[`decode`].
pub fn from_json(text: &str) -> Result<Message, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{LogLevel, PortMapping, UpdateStatus};
    use uuid::Uuid;

    fn sample_small() -> Message {
        Message::Heartbeat { timestamp_ms: 1_700_000_000_000 }
    }

    fn sample_large() -> Message {
        let mapping = PortMapping {
            id: Uuid::nil(),
            external_domain: "app.test".into(),
            internal_host: "10.0.0.7".into(),
            internal_port: 8080,
            internal_use_tls: false,
            allow_self_signed: false,
            enabled: true,
            description: "x".repeat(4096),
        };
        Message::ConfigSync {
            mappings: vec![mapping],
            config_hash: "deadbeefcafef00d".into(),
            landing_page_html: None,
            landing_page_hash: None,
        }
    }

    #[test]
    fn round_trips_small_frame_uncompressed() {
        let encoded = encode(&sample_small()).unwrap();
        assert!(!encoded.starts_with(COMPRESSED_MAGIC));
        let decoded = decode(&encoded).unwrap();
        match decoded {
            Message::Heartbeat { timestamp_ms } => assert_eq!(timestamp_ms, 1_700_000_000_000),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn round_trips_large_frame_compressed() {
        let encoded = encode(&sample_large()).unwrap();
        assert!(encoded.starts_with(COMPRESSED_MAGIC));
        let decoded = decode(&encoded).unwrap();
        match decoded {
            Message::ConfigSync { mappings, .. } => {
                assert_eq!(mappings[0].description.len(), 4096);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn rejects_truncated_compressed_frame() {
        let mut encoded = encode(&sample_large()).unwrap();
        encoded.truncate(5);
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode(&[0xff, 0x00, 0x01]).is_err());
    }

    #[test]
    fn json_mode_round_trips_but_differs_from_binary() {
        let msg = Message::UpdateResponse {
            accepted: true,
            error: None,
            current_version: "1.0.0".into(),
            status: UpdateStatus::Queued,
        };
        let json = to_json(&msg).unwrap();
        let back = from_json(&json).unwrap();
        match back {
            Message::UpdateResponse { accepted, status, .. } => {
                assert!(accepted);
                assert_eq!(status, UpdateStatus::Queued);
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        let binary = encode(&msg).unwrap();
        assert_ne!(binary, json.into_bytes());
    }

    #[test]
    fn log_level_round_trips() {
        let msg = Message::GatewayLog {
            timestamp: chrono::Utc::now(),
            level: LogLevel::Warning,
            message: "disk almost full".into(),
        };
        let encoded = encode(&msg).unwrap();
        let decoded = decode(&encoded).unwrap();
        match decoded {
            Message::GatewayLog { level, .. } => assert_eq!(level, LogLevel::Warning),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
