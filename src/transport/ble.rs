//! Constrained-link transport adapter
//!
//! Wraps a platform-provided characteristic link (GATT-style writes with a
//! negotiated MTU). Chunks are written in small parallel batches with an
//! inter-batch delay; any chunk that fails is retried, bounded to
//! [`MAX_CHUNK_ATTEMPTS`] total attempts before the whole send surfaces
//! `DeliveryFailed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{FrameTransport, Result, TransportError, MAX_CHUNK_ATTEMPTS};

/// Platform radio contract: raw characteristic writes plus the MTU the
/// stack negotiated
#[async_trait]
pub trait CharacteristicLink: Send + Sync {
    fn mtu(&self) -> usize;

    async fn write(&self, payload: &[u8]) -> Result<()>;
}

/// Delivery tuning for the constrained link
#[derive(Debug, Clone)]
pub struct BleDeliveryConfig {
    /// Chunks written concurrently per batch
    pub batch_size: usize,

    /// Pause between batches so the radio queue can drain
    pub batch_delay: Duration,
}

impl Default for BleDeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            batch_delay: Duration::from_millis(20),
        }
    }
}

/// BLE-style frame transport
pub struct BleTransport {
    link: Arc<dyn CharacteristicLink>,
    config: BleDeliveryConfig,
    inbound: mpsc::Sender<Bytes>,
    closed: AtomicBool,
}

impl BleTransport {
    pub fn new(
        link: Arc<dyn CharacteristicLink>,
        config: BleDeliveryConfig,
        inbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            link,
            config,
            inbound,
            closed: AtomicBool::new(false),
        }
    }

    /// Entry point for the platform stack's receive notifications
    pub async fn on_receive(&self, payload: Bytes) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.inbound.send(payload).await.is_err() {
            warn!("Inbound frame dropped: coordinator receiver closed");
        }
    }

    async fn send_batch(&self, batch: &[(usize, Bytes)]) -> Vec<usize> {
        let writes = batch.iter().map(|(index, frame)| {
            let link = Arc::clone(&self.link);
            let frame = frame.clone();
            let index = *index;
            async move {
                match link.write(&frame).await {
                    Ok(()) => None,
                    Err(e) => {
                        debug!(chunk = index, error = %e, "Chunk write failed");
                        Some(index)
                    }
                }
            }
        });
        join_all(writes).await.into_iter().flatten().collect()
    }
}

#[async_trait]
impl FrameTransport for BleTransport {
    fn mtu(&self) -> usize {
        self.link.mtu()
    }

    async fn send_frames(&self, frames: Vec<Bytes>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost("transport closed".into()));
        }

        let mut pending: Vec<(usize, Bytes)> = frames.into_iter().enumerate().collect();

        for attempt in 1..=MAX_CHUNK_ATTEMPTS {
            let mut failed = Vec::new();
            for batch in pending.chunks(self.config.batch_size.max(1)) {
                failed.extend(self.send_batch(batch).await);
                if !self.config.batch_delay.is_zero() {
                    tokio::time::sleep(self.config.batch_delay).await;
                }
            }

            if failed.is_empty() {
                return Ok(());
            }

            warn!(
                attempt,
                remaining = failed.len(),
                "Retrying unacknowledged chunks"
            );
            pending.retain(|(index, _)| failed.contains(index));
        }

        Err(TransportError::DeliveryFailed {
            attempts: MAX_CHUNK_ATTEMPTS,
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex;

    /// Link that fails the first `failures` writes of a given chunk payload
    struct FlakyLink {
        mtu: usize,
        failures: u32,
        attempts: AtomicU32,
        written: Mutex<Vec<Vec<u8>>>,
    }

    impl FlakyLink {
        fn new(mtu: usize, failures: u32) -> Self {
            Self {
                mtu,
                failures,
                attempts: AtomicU32::new(0),
                written: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CharacteristicLink for FlakyLink {
        fn mtu(&self) -> usize {
            self.mtu
        }

        async fn write(&self, payload: &[u8]) -> Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(TransportError::ConnectionLost("radio busy".into()));
            }
            self.written.lock().await.push(payload.to_vec());
            Ok(())
        }
    }

    fn transport(link: Arc<FlakyLink>) -> (BleTransport, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(16);
        let config = BleDeliveryConfig {
            batch_size: 2,
            batch_delay: Duration::ZERO,
        };
        (BleTransport::new(link, config, tx), rx)
    }

    #[tokio::test]
    async fn test_all_chunks_written() {
        let link = Arc::new(FlakyLink::new(200, 0));
        let (transport, _rx) = transport(Arc::clone(&link));

        let frames: Vec<Bytes> = (0..5).map(|i| Bytes::from(vec![i as u8; 10])).collect();
        transport.send_frames(frames).await.unwrap();
        assert_eq!(link.written.lock().await.len(), 5);
    }

    #[tokio::test]
    async fn test_failed_chunks_are_retried() {
        // First two writes fail, then everything succeeds
        let link = Arc::new(FlakyLink::new(200, 2));
        let (transport, _rx) = transport(Arc::clone(&link));

        let frames: Vec<Bytes> = (0..4).map(|i| Bytes::from(vec![i as u8; 10])).collect();
        transport.send_frames(frames).await.unwrap();
        assert_eq!(link.written.lock().await.len(), 4);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        // Every write fails
        let link = Arc::new(FlakyLink::new(200, u32::MAX));
        let (transport, _rx) = transport(link);

        let err = transport
            .send_frames(vec![Bytes::from_static(b"chunk")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::DeliveryFailed {
                attempts: MAX_CHUNK_ATTEMPTS
            }
        ));
    }

    #[tokio::test]
    async fn test_inbound_frames_forwarded() {
        let link = Arc::new(FlakyLink::new(200, 0));
        let (transport, mut rx) = transport(link);

        transport.on_receive(Bytes::from_static(b"frame")).await;
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"frame"));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_sends() {
        let link = Arc::new(FlakyLink::new(200, 0));
        let (transport, _rx) = transport(link);
        transport.close().await.unwrap();

        let err = transport
            .send_frames(vec![Bytes::from_static(b"chunk")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost(_)));
    }
}
