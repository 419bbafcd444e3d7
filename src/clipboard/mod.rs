//! Clipboard collaborator interface
//!
//! The engine never touches the OS clipboard itself; a platform integration
//! implements [`ClipboardProvider`] and feeds change events into the
//! coordinator. An in-memory provider is included for tests and headless
//! runs.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::codec::ContentType;

/// Clipboard content with its kind
#[derive(Debug, Clone, PartialEq)]
pub struct ClipboardContent {
    pub data: Vec<u8>,
    pub content_type: ContentType,
}

impl ClipboardContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: text.into().into_bytes(),
            content_type: ContentType::Text,
        }
    }

    pub fn image(data: Vec<u8>) -> Self {
        Self {
            data,
            content_type: ContentType::Image,
        }
    }
}

/// Clipboard errors
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// Platform-specific failure
    #[error("Platform error: {0}")]
    Platform(String),

    /// No content available
    #[error("No clipboard content available")]
    NoContent,
}

/// Platform clipboard contract
#[async_trait]
pub trait ClipboardProvider: Send + Sync {
    /// Current clipboard content, if any
    async fn get_content(&self) -> Result<Option<ClipboardContent>, ClipboardError>;

    /// Replace the clipboard content
    async fn set_content(&self, content: ClipboardContent) -> Result<(), ClipboardError>;

    /// Provider name for logging
    fn name(&self) -> &str;
}

/// Change-notification source: platform integrations push new content here
/// and the coordinator consumes the receiver
pub fn change_channel(buffer: usize) -> (mpsc::Sender<ClipboardContent>, mpsc::Receiver<ClipboardContent>) {
    mpsc::channel(buffer)
}

/// In-memory provider for tests and headless runs
#[derive(Default)]
pub struct MemoryClipboard {
    content: RwLock<Option<ClipboardContent>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClipboardProvider for MemoryClipboard {
    async fn get_content(&self) -> Result<Option<ClipboardContent>, ClipboardError> {
        Ok(self.content.read().await.clone())
    }

    async fn set_content(&self, content: ClipboardContent) -> Result<(), ClipboardError> {
        *self.content.write().await = Some(content);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_provider_roundtrip() {
        let provider = MemoryClipboard::new();
        assert!(provider.get_content().await.unwrap().is_none());

        provider
            .set_content(ClipboardContent::text("hello"))
            .await
            .unwrap();
        let content = provider.get_content().await.unwrap().unwrap();
        assert_eq!(content.data, b"hello");
        assert_eq!(content.content_type, ContentType::Text);
    }
}
