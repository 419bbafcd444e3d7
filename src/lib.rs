//! # ClipLink
//!
//! Secure clipboard synchronization between a desktop host and a mobile
//! companion device.
//!
//! ClipLink pairs devices with a short-lived numeric PIN, issues session
//! tokens, encrypts every payload with AES-256-GCM, and moves content over
//! either an MTU-constrained link (BLE-style characteristic writes) or a
//! WebSocket-style socket link, chunking and reassembling messages that
//! exceed the channel's MTU.

pub mod auth;
pub mod clipboard;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod hub;
pub mod sync;
pub mod transport;

pub use config::Config;

/// Result type alias for ClipLink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ClipLink operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Pairing or session error
    #[error("Authentication error: {0}")]
    Auth(#[from] auth::AuthError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Encryption or decryption error
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    /// Encoding, chunking, or reassembly error
    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// Clipboard collaborator error
    #[error("Clipboard error: {0}")]
    Clipboard(#[from] clipboard::ClipboardError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hard upper bound on clipboard payload size (5MB); the filter cap in
/// [`config::FilterConfig`] is typically much lower
pub const MAX_PAYLOAD_SIZE: usize = 5 * 1024 * 1024;
