//! Message encoding, chunking, and reassembly
//!
//! An [`Envelope`] is serialized to JSON, compressed when that shrinks it,
//! sealed with the session key, and emitted either as one frame or as a set
//! of MTU-bounded chunks. Reassembly accepts chunks in any order, keyed by
//! message id, and discards buffers that go stale.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto::{CryptoEngine, CryptoError, Key};

/// Bytes reserved per chunk for the JSON envelope around the payload
/// (keys, uuid, indices)
pub const CHUNK_HEADER_OVERHEAD: usize = 128;

/// The lead chunk additionally carries the compressed flag and the
/// 64-character hex checksum, so it reserves extra header room
pub const LEAD_CHUNK_OVERHEAD: usize = CHUNK_HEADER_OVERHEAD + 104;

/// Bytes a single frame's JSON adds around its base64 payload
const SINGLE_FRAME_OVERHEAD: usize = 192;

/// Smallest MTU the codec can chunk for
pub const MIN_MTU: usize = LEAD_CHUNK_OVERHEAD + 8;

/// Payloads below this size are never worth compressing
const COMPRESSION_MIN: usize = 64;

const COMPRESSION_LEVEL: i32 = 3;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression or decompression failure
    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// Encryption or tag verification failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport-level corruption detected before decryption
    #[error("Checksum mismatch for message {message_id}")]
    Corrupted { message_id: Uuid },

    /// A chunk disagreed with its buffer about the chunk count
    #[error("Inconsistent chunk set for message {message_id}: total {got} != {expected}")]
    ChunkMismatch {
        message_id: Uuid,
        expected: u32,
        got: u32,
    },

    /// A chunk carried an index outside `[0, total)`
    #[error("Chunk index {index} out of range for message {message_id} (total {total})")]
    IndexOutOfRange {
        message_id: Uuid,
        index: u32,
        total: u32,
    },

    /// The requested MTU cannot fit a chunk header plus payload
    #[error("MTU {0} is below the minimum of {MIN_MTU}")]
    MtuTooSmall(usize),
}

/// Clipboard content kind carried in an envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
}

/// Plaintext sync message, pre-encryption
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Content bytes, base64 on the wire
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    /// ISO-8601 creation time
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub message_id: Uuid,
    pub content_type: ContentType,
    pub content_size: u64,
}

impl Envelope {
    pub fn new(content: Vec<u8>, device_id: &str, content_type: ContentType) -> Self {
        Self {
            content_size: content.len() as u64,
            content,
            timestamp: Utc::now(),
            device_id: device_id.to_string(),
            message_id: Uuid::new_v4(),
            content_type,
        }
    }
}

/// A wire frame: either a whole sealed message or one chunk of it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Single {
        #[serde(rename = "messageId")]
        message_id: Uuid,
        compressed: bool,
        /// SHA-256 hex over the sealed bytes
        checksum: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Chunk {
        index: u32,
        total: u32,
        #[serde(rename = "messageId")]
        message_id: Uuid,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        /// Carried on chunk 0 only
        #[serde(skip_serializing_if = "Option::is_none")]
        compressed: Option<bool>,
        /// SHA-256 hex over the complete sealed bytes, chunk 0 only
        #[serde(skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
}

impl Frame {
    pub fn message_id(&self) -> Uuid {
        match self {
            Frame::Single { message_id, .. } | Frame::Chunk { message_id, .. } => *message_id,
        }
    }

    /// Serialize for the transport layer
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a raw transport frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

struct Reassembly {
    total: u32,
    chunks: HashMap<u32, Vec<u8>>,
    compressed: bool,
    checksum: Option<String>,
    last_progress: Instant,
}

/// Per-session codec: owns the session key and in-flight reassembly buffers
pub struct MessageCodec {
    key: Key,
    buffers: HashMap<Uuid, Reassembly>,
    staleness: Duration,
}

impl MessageCodec {
    pub fn new(key: Key, staleness: Duration) -> Self {
        Self {
            key,
            buffers: HashMap::new(),
            staleness,
        }
    }

    /// Replace the session key, discarding reassemblies sealed under the
    /// previous key
    pub fn rekey(&mut self, key: Key) {
        if !self.buffers.is_empty() {
            debug!(
                buffers = self.buffers.len(),
                "Rekey discarding reassembly buffers"
            );
        }
        self.buffers.clear();
        self.key = key;
    }

    /// Encode an envelope into one or more MTU-bounded frames
    pub fn encode(&self, envelope: &Envelope, mtu: usize) -> Result<Vec<Frame>, CodecError> {
        if mtu < MIN_MTU {
            return Err(CodecError::MtuTooSmall(mtu));
        }

        let plain = serde_json::to_vec(envelope)?;
        let (body, compressed) = maybe_compress(&plain)?;
        let sealed = CryptoEngine::encrypt(&body, &self.key)?;
        let checksum = sha256_hex(&sealed);

        // A single frame must fit the MTU after base64 and JSON expansion
        if sealed.len().div_ceil(3) * 4 + SINGLE_FRAME_OVERHEAD <= mtu {
            return Ok(vec![Frame::Single {
                message_id: envelope.message_id,
                compressed,
                checksum,
                data: sealed,
            }]);
        }

        // Base64 expands 3 payload bytes into 4 wire bytes; the lead chunk
        // gets a smaller payload budget to make room for the checksum
        let lead_budget = ((mtu - LEAD_CHUNK_OVERHEAD) / 4).max(1) * 3;
        let tail_budget = ((mtu - CHUNK_HEADER_OVERHEAD) / 4).max(1) * 3;

        let lead_len = lead_budget.min(sealed.len());
        let tail = &sealed[lead_len..];
        let total = (1 + tail.chunks(tail_budget).count()) as u32;

        let mut frames = Vec::with_capacity(total as usize);
        frames.push(Frame::Chunk {
            index: 0,
            total,
            message_id: envelope.message_id,
            data: sealed[..lead_len].to_vec(),
            compressed: Some(compressed),
            checksum: Some(checksum),
        });
        for (i, data) in tail.chunks(tail_budget).enumerate() {
            frames.push(Frame::Chunk {
                index: (i + 1) as u32,
                total,
                message_id: envelope.message_id,
                data: data.to_vec(),
                compressed: None,
                checksum: None,
            });
        }
        Ok(frames)
    }

    /// Ingest one frame; returns the envelope once a message is complete
    ///
    /// Chunks may arrive in any order. The buffer for a message id is
    /// dropped on completion, on corruption, and on staleness.
    pub fn ingest(&mut self, frame: Frame) -> Result<Option<Envelope>, CodecError> {
        self.sweep_stale();

        match frame {
            Frame::Single {
                message_id,
                compressed,
                checksum,
                data,
            } => {
                if sha256_hex(&data) != checksum {
                    return Err(CodecError::Corrupted { message_id });
                }
                self.open(&data, compressed).map(Some)
            }
            Frame::Chunk {
                index,
                total,
                message_id,
                data,
                compressed,
                checksum,
            } => {
                if index >= total {
                    return Err(CodecError::IndexOutOfRange {
                        message_id,
                        index,
                        total,
                    });
                }

                let buffer = self.buffers.entry(message_id).or_insert_with(|| Reassembly {
                    total,
                    chunks: HashMap::new(),
                    compressed: false,
                    checksum: None,
                    last_progress: Instant::now(),
                });

                if buffer.total != total {
                    let expected = buffer.total;
                    self.buffers.remove(&message_id);
                    return Err(CodecError::ChunkMismatch {
                        message_id,
                        expected,
                        got: total,
                    });
                }

                if let Some(compressed) = compressed {
                    buffer.compressed = compressed;
                }
                if checksum.is_some() {
                    buffer.checksum = checksum;
                }
                buffer.chunks.insert(index, data);
                buffer.last_progress = Instant::now();

                if buffer.chunks.len() < total as usize {
                    return Ok(None);
                }

                let Some(buffer) = self.buffers.remove(&message_id) else {
                    return Ok(None);
                };
                let mut sealed = Vec::new();
                for i in 0..total {
                    sealed.extend_from_slice(&buffer.chunks[&i]);
                }

                if let Some(expected) = &buffer.checksum {
                    if &sha256_hex(&sealed) != expected {
                        return Err(CodecError::Corrupted { message_id });
                    }
                }

                self.open(&sealed, buffer.compressed).map(Some)
            }
        }
    }

    fn open(&self, sealed: &[u8], compressed: bool) -> Result<Envelope, CodecError> {
        let body = CryptoEngine::decrypt(sealed, &self.key)?;
        let plain = if compressed {
            zstd::stream::decode_all(&body[..])?
        } else {
            body
        };
        Ok(serde_json::from_slice(&plain)?)
    }

    /// Drop reassembly buffers that have not progressed within the
    /// staleness window
    pub fn sweep_stale(&mut self) {
        let staleness = self.staleness;
        self.buffers.retain(|message_id, buffer| {
            let stale = buffer.last_progress.elapsed() > staleness;
            if stale {
                warn!(%message_id, received = buffer.chunks.len(), total = buffer.total,
                      "Dropping stale reassembly buffer");
            }
            !stale
        });
    }

    /// Discard every in-flight reassembly (used on stop)
    pub fn clear(&mut self) {
        if !self.buffers.is_empty() {
            debug!(buffers = self.buffers.len(), "Clearing reassembly buffers");
        }
        self.buffers.clear();
    }

    /// Number of in-flight reassemblies
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

fn maybe_compress(plain: &[u8]) -> Result<(Vec<u8>, bool), CodecError> {
    if plain.len() < COMPRESSION_MIN {
        return Ok((plain.to_vec(), false));
    }
    let compressed = zstd::stream::encode_all(plain, COMPRESSION_LEVEL)?;
    if compressed.len() < plain.len() {
        Ok((compressed, true))
    } else {
        Ok((plain.to_vec(), false))
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> MessageCodec {
        MessageCodec::new(
            CryptoEngine::derive_key("test-token"),
            Duration::from_secs(30),
        )
    }

    fn envelope(content: &[u8]) -> Envelope {
        Envelope::new(content.to_vec(), "desk-1", ContentType::Text)
    }

    /// Deterministic incompressible bytes, so chunk counts are stable
    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x243F_6A88_85A3_08D3u64;
        (0..len)
            .map(|_| {
                state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
                let mut z = state;
                z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
                z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
                (z ^ (z >> 31)) as u8
            })
            .collect()
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = envelope(b"hi");
        let json = serde_json::to_value(&env).unwrap();
        assert!(json["content"].is_string());
        assert!(json["deviceId"].is_string());
        assert!(json["messageId"].is_string());
        assert_eq!(json["contentType"], "text");
        assert_eq!(json["contentSize"], 2);
    }

    #[test]
    fn test_small_message_is_single_frame() {
        let codec = codec();
        let frames = codec.encode(&envelope(b"hello"), 4096).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Single { .. }));
    }

    #[test]
    fn test_single_frame_roundtrip() {
        let mut codec = codec();
        let env = envelope(b"hello");
        let frames = codec.encode(&env, 4096).unwrap();
        let out = codec.ingest(frames.into_iter().next().unwrap()).unwrap();
        assert_eq!(out, Some(env));
    }

    #[test]
    fn test_large_message_chunks_and_reassembles() {
        let mut codec = codec();
        let content = noise(5000);
        let env = envelope(&content);

        let frames = codec.encode(&env, 256).unwrap();
        assert!(frames.len() >= 25, "expected 25+ chunks, got {}", frames.len());

        let mut result = None;
        for frame in frames {
            result = codec.ingest(frame).unwrap();
        }
        assert_eq!(result.unwrap().content, content);
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_out_of_order_delivery() {
        let mut codec = codec();
        let env = envelope(&noise(3000));
        let mut frames = codec.encode(&env, 256).unwrap();
        assert!(frames.len() > 1);
        frames.reverse();

        let mut result = None;
        for frame in frames {
            result = codec.ingest(frame).unwrap();
        }
        assert_eq!(result, Some(env));
    }

    #[test]
    fn test_missing_chunk_never_completes() {
        let mut codec = codec();
        let mut frames = codec.encode(&envelope(&noise(3000)), 256).unwrap();
        assert!(frames.len() > 2);
        frames.remove(frames.len() / 2);

        for frame in frames {
            assert_eq!(codec.ingest(frame).unwrap(), None);
        }
        assert_eq!(codec.pending(), 1);
    }

    #[test]
    fn test_inconsistent_total_drops_buffer() {
        let mut codec = codec();
        let env = envelope(&noise(3000));
        let frames = codec.encode(&env, 256).unwrap();
        let message_id = env.message_id;

        assert!(matches!(frames[0], Frame::Chunk { .. }));
        codec.ingest(frames[0].clone()).unwrap();
        let bad = Frame::Chunk {
            index: 1,
            total: 999,
            message_id,
            data: vec![0u8; 8],
            compressed: None,
            checksum: None,
        };
        assert!(matches!(
            codec.ingest(bad),
            Err(CodecError::ChunkMismatch { .. })
        ));
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_index_out_of_range_rejected() {
        let mut codec = codec();
        let bad = Frame::Chunk {
            index: 3,
            total: 3,
            message_id: Uuid::new_v4(),
            data: vec![0u8; 8],
            compressed: None,
            checksum: None,
        };
        assert!(matches!(
            codec.ingest(bad),
            Err(CodecError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_corrupted_single_frame_detected_before_decrypt() {
        let mut codec = codec();
        let frames = codec.encode(&envelope(b"hello"), 4096).unwrap();
        if let Frame::Single {
            message_id,
            compressed,
            checksum,
            mut data,
        } = frames.into_iter().next().unwrap()
        {
            data[0] ^= 0xFF;
            let err = codec
                .ingest(Frame::Single {
                    message_id,
                    compressed,
                    checksum,
                    data,
                })
                .unwrap_err();
            assert!(matches!(err, CodecError::Corrupted { .. }));
        } else {
            panic!("expected single frame");
        }
    }

    #[test]
    fn test_compression_only_when_it_shrinks() {
        // Repetitive content shrinks
        let (out, compressed) = maybe_compress(&vec![b'A'; 2048]).unwrap();
        assert!(compressed);
        assert!(out.len() < 2048);

        // Below the size floor nothing is attempted
        let (out, compressed) = maybe_compress(b"hi").unwrap();
        assert!(!compressed);
        assert_eq!(out, b"hi");

        // Incompressible content is carried as-is
        let dense = noise(2048);
        let (out, compressed) = maybe_compress(&dense).unwrap();
        assert!(!compressed);
        assert_eq!(out, dense);
    }

    #[test]
    fn test_every_wire_frame_fits_the_mtu() {
        let codec = codec();
        for mtu in [MIN_MTU, 256, 512] {
            let frames = codec.encode(&envelope(&noise(5000)), mtu).unwrap();
            assert!(frames.len() > 1);
            for frame in &frames {
                let raw = frame.to_bytes().unwrap();
                assert!(
                    raw.len() <= mtu,
                    "frame {:?} serializes to {} bytes at mtu {mtu}",
                    frame.message_id(),
                    raw.len()
                );
            }
        }
    }

    #[test]
    fn test_rekey_switches_session_key() {
        let mut receiver = codec();
        receiver.rekey(CryptoEngine::derive_key("fresh-token"));

        let sender = MessageCodec::new(
            CryptoEngine::derive_key("fresh-token"),
            Duration::from_secs(30),
        );
        let env = envelope(b"rekeyed");
        let mut frames = sender.encode(&env, 4096).unwrap();
        let out = receiver.ingest(frames.remove(0)).unwrap();
        assert_eq!(out, Some(env));
    }

    #[test]
    fn test_stale_buffer_is_swept() {
        let mut codec = MessageCodec::new(
            CryptoEngine::derive_key("test-token"),
            Duration::from_millis(0),
        );
        let frames = codec.encode(&envelope(&noise(3000)), 256).unwrap();
        codec.ingest(frames[0].clone()).unwrap();
        assert_eq!(codec.pending(), 1);

        std::thread::sleep(Duration::from_millis(5));
        codec.sweep_stale();
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_mtu_too_small() {
        let codec = codec();
        assert!(matches!(
            codec.encode(&envelope(b"x"), 16),
            Err(CodecError::MtuTooSmall(16))
        ));
    }

    #[test]
    fn test_frame_bytes_roundtrip() {
        let codec = codec();
        let frames = codec.encode(&envelope(b"hello"), 4096).unwrap();
        let bytes = frames[0].to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frames[0]);
    }

    #[test]
    fn test_wrong_key_fails_decrypt_not_checksum() {
        let sender = codec();
        let mut receiver = MessageCodec::new(
            CryptoEngine::derive_key("other-token"),
            Duration::from_secs(30),
        );
        let frames = sender.encode(&envelope(b"hello"), 4096).unwrap();
        let err = receiver.ingest(frames.into_iter().next().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Crypto(CryptoError::AuthTagMismatch)
        ));
    }
}
