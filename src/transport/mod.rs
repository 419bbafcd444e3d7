//! Frame transports for ClipLink
//!
//! Two channel variants move opaque encrypted frames between paired
//! devices: an MTU-constrained characteristic link (BLE-style writes) and a
//! socket link speaking the WebSocket upgrade protocol and framing.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod ble;
pub mod websocket;

pub use ble::{BleTransport, CharacteristicLink};
pub use websocket::{ReconnectPolicy, WebSocketServer, WebSocketTransport};

/// Maximum delivery attempts per chunk on the constrained link
pub const MAX_CHUNK_ATTEMPTS: u32 = 3;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying link dropped; reconnect may be attempted
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// An operation exceeded its deadline
    #[error("Operation timed out")]
    Timeout,

    /// Retry budget exhausted for one or more chunks
    #[error("Delivery failed after {attempts} attempts")]
    DeliveryFailed { attempts: u32 },

    /// Transport-level corruption (checksum mismatch before decryption)
    #[error("Frame corrupted in transit")]
    Corrupted,

    /// The peer's upgrade request or response was malformed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// A channel able to carry opaque encrypted frames
///
/// Adapters deliver inbound frames through the `mpsc` sender they are
/// constructed with, keeping I/O off the coordinator's serialization domain.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Largest single frame this channel can carry
    fn mtu(&self) -> usize;

    /// Send one ordered set of frames belonging to a single message
    ///
    /// The adapter owns the delivery strategy (batching, retries).
    async fn send_frames(&self, frames: Vec<Bytes>) -> Result<()>;

    /// Close the channel; pending sends fail with `ConnectionLost`
    async fn close(&self) -> Result<()>;
}
