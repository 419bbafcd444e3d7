//! Sync coordination: the top-level state machine
//!
//! Drives filtering, rate limiting, loop prevention, encoding, and transport
//! for both directions. All mutable sync state lives behind this type's
//! locks so filtering, dedup checks, and hub mutation are race-free.

pub mod filter;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use filter::{ContentFilter, FilterRejection};

use crate::auth::{AuthMessage, AuthResponse, PairingAuthority, SessionStore};
use crate::clipboard::{ClipboardContent, ClipboardProvider};
use crate::codec::{Envelope, Frame, MessageCodec};
use crate::config::SyncConfig;
use crate::crypto::CryptoEngine;
use crate::hub::ClipboardHub;
use crate::transport::FrameTransport;
use crate::Result;

/// Coordinator states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Monitoring,
    Filtering,
    Encoding,
    Transmitting,
    Decoding,
    Applying,
    Stopped,
}

/// Why a local candidate sync was dropped; all drops are non-fatal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Fingerprint matched recently sent or received content
    DuplicateContent,
    /// Rejected by the content filter
    Filtered(FilterRejection),
    /// Minimum per-device interval not yet elapsed
    RateLimited,
    /// Coordinator already stopped
    Stopped,
}

/// Outcome of a local clipboard change
#[derive(Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Sent { message_id: Uuid, frames: usize },
    Dropped(DropReason),
}

/// Per-device minimum-interval limiter
///
/// `check` is mutating: an accepted call records "now" as the device's last
/// sync time, so it must run exactly once per candidate content.
pub struct RateLimiter {
    min_interval: Duration,
    last_accepted: HashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_accepted: HashMap::new(),
        }
    }

    pub fn check(&mut self, device_id: &str) -> bool {
        let now = Instant::now();
        match self.last_accepted.get(device_id) {
            Some(last) if now.duration_since(*last) < self.min_interval => false,
            _ => {
                self.last_accepted.insert(device_id.to_string(), now);
                true
            }
        }
    }
}

/// Fingerprints of the most recent traffic in each direction, used for
/// loop and duplicate suppression inside the debounce window
struct FingerprintLedger {
    debounce: Duration,
    last_sent: Option<(String, Instant)>,
    last_received: Option<(String, Instant)>,
}

impl FingerprintLedger {
    fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            last_sent: None,
            last_received: None,
        }
    }

    fn is_recent_duplicate(&self, fingerprint: &str) -> bool {
        [&self.last_sent, &self.last_received].iter().any(|slot| {
            slot.as_ref()
                .map(|(fp, at)| fp == fingerprint && at.elapsed() < self.debounce)
                .unwrap_or(false)
        })
    }

    fn record_sent(&mut self, fingerprint: String) {
        self.last_sent = Some((fingerprint, Instant::now()));
    }

    fn record_received(&mut self, fingerprint: String) {
        self.last_received = Some((fingerprint, Instant::now()));
    }
}

/// Orchestrates codec, transport, crypto, sessions, and the hub
pub struct SyncCoordinator {
    device_id: String,
    config: SyncConfig,
    state: RwLock<SyncState>,
    codec: Mutex<MessageCodec>,
    transport: Arc<dyn FrameTransport>,
    clipboard: Arc<dyn ClipboardProvider>,
    hub: Arc<ClipboardHub>,
    filter: ContentFilter,
    rate: Mutex<RateLimiter>,
    ledger: Mutex<FingerprintLedger>,
    pairing: Arc<PairingAuthority>,
    sessions: Arc<SessionStore>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: String,
        config: SyncConfig,
        filter: ContentFilter,
        codec: MessageCodec,
        transport: Arc<dyn FrameTransport>,
        clipboard: Arc<dyn ClipboardProvider>,
        hub: Arc<ClipboardHub>,
        pairing: Arc<PairingAuthority>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        let rate = RateLimiter::new(Duration::from_millis(config.rate_limit_ms));
        let ledger = FingerprintLedger::new(Duration::from_millis(config.debounce_ms));
        Self {
            device_id,
            config,
            state: RwLock::new(SyncState::Idle),
            codec: Mutex::new(codec),
            transport,
            clipboard,
            hub,
            filter,
            rate: Mutex::new(rate),
            ledger: Mutex::new(ledger),
            pairing,
            sessions,
        }
    }

    pub async fn state(&self) -> SyncState {
        *self.state.read().await
    }

    /// Enter `Monitoring`; a stopped coordinator never restarts
    pub async fn start(&self) {
        let mut state = self.state.write().await;
        if *state == SyncState::Stopped {
            return;
        }
        *state = SyncState::Monitoring;
        info!(device_id = %self.device_id, "Sync coordinator monitoring");
    }

    /// Process a local clipboard change
    ///
    /// Filtering happens strictly before encryption and before any hub
    /// insertion; the rate limiter is consulted exactly once.
    pub async fn handle_local_change(&self, content: ClipboardContent) -> Result<SyncOutcome> {
        if self.state().await == SyncState::Stopped {
            return Ok(SyncOutcome::Dropped(DropReason::Stopped));
        }

        let fingerprint = fingerprint(&content.data);
        {
            let ledger = self.ledger.lock().await;
            if ledger.is_recent_duplicate(&fingerprint) {
                debug!("Duplicate content within debounce window, dropping");
                return Ok(SyncOutcome::Dropped(DropReason::DuplicateContent));
            }
        }

        self.set_state(SyncState::Filtering).await;
        if let Err(rejection) = self.filter.check(&content.data) {
            debug!(reason = %rejection, "Content filtered");
            self.set_state(SyncState::Monitoring).await;
            return Ok(SyncOutcome::Dropped(DropReason::Filtered(rejection)));
        }

        if !self.rate.lock().await.check(&self.device_id) {
            debug!("Rate limit hit, dropping candidate sync");
            self.set_state(SyncState::Monitoring).await;
            return Ok(SyncOutcome::Dropped(DropReason::RateLimited));
        }

        self.set_state(SyncState::Encoding).await;
        let envelope = Envelope::new(
            content.data.clone(),
            &self.device_id,
            content.content_type,
        );
        let message_id = envelope.message_id;
        let frames = {
            let codec = self.codec.lock().await;
            codec.encode(&envelope, self.transport.mtu())?
        };

        self.set_state(SyncState::Transmitting).await;
        let mut raw = Vec::with_capacity(frames.len());
        for frame in &frames {
            raw.push(Bytes::from(frame.to_bytes()?));
        }
        let frame_count = raw.len();
        self.transport.send_frames(raw).await?;

        self.ledger.lock().await.record_sent(fingerprint);
        if let Some(entry_id) = self.hub.insert(content.data, &self.device_id).await {
            debug!(%entry_id, "Local content recorded in hub");
        }
        self.set_state(SyncState::Monitoring).await;

        info!(%message_id, frames = frame_count, "Clipboard change synced");
        Ok(SyncOutcome::Sent {
            message_id,
            frames: frame_count,
        })
    }

    /// Process one inbound raw frame
    ///
    /// Returns the hub entry id once a message completes and is applied.
    /// Malformed frames are dropped with a logged reason, never a panic.
    pub async fn handle_remote_frame(&self, raw: &[u8]) -> Result<Option<Uuid>> {
        if self.state().await == SyncState::Stopped {
            return Ok(None);
        }

        let frame = match Frame::from_bytes(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed inbound frame");
                return Ok(None);
            }
        };

        self.set_state(SyncState::Decoding).await;
        let envelope = {
            let mut codec = self.codec.lock().await;
            match codec.ingest(frame) {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    self.set_state(SyncState::Monitoring).await;
                    return Ok(None);
                }
                Err(e) => {
                    self.set_state(SyncState::Monitoring).await;
                    return Err(e.into());
                }
            }
        };

        self.set_state(SyncState::Applying).await;

        // Echo defense: session scoping should prevent this, but a relay
        // hub can still reflect our own traffic
        if envelope.device_id == self.device_id {
            debug!(message_id = %envelope.message_id, "Dropping echoed message from self");
            self.set_state(SyncState::Monitoring).await;
            return Ok(None);
        }

        let fp = fingerprint(&envelope.content);
        {
            let ledger = self.ledger.lock().await;
            if ledger.is_recent_duplicate(&fp) {
                debug!(message_id = %envelope.message_id, "Dropping looped duplicate");
                self.set_state(SyncState::Monitoring).await;
                return Ok(None);
            }
        }

        self.clipboard
            .set_content(ClipboardContent {
                data: envelope.content.clone(),
                content_type: envelope.content_type,
            })
            .await
            .map_err(crate::Error::from)?;

        let entry_id = self.hub.insert(envelope.content, &envelope.device_id).await;
        self.ledger.lock().await.record_received(fp);
        self.set_state(SyncState::Monitoring).await;

        info!(
            message_id = %envelope.message_id,
            source = %envelope.device_id,
            "Remote clipboard change applied"
        );
        Ok(entry_id)
    }

    /// Answer a wire auth message; `None` for message kinds a host ignores
    pub async fn handle_auth_message(&self, message: AuthMessage) -> Option<AuthMessage> {
        match message {
            AuthMessage::AuthRequest(request) => {
                let response = match self.pairing.validate(&request.pin, &request.device_id).await
                {
                    Ok(token) => {
                        self.hub.add_device(&request.device_id).await;
                        // All sealed traffic for this session uses the key
                        // derived from the freshly issued token
                        self.codec
                            .lock()
                            .await
                            .rekey(CryptoEngine::derive_key(&token.value));
                        AuthResponse::ok(token.value)
                    }
                    Err(e) => {
                        warn!(device_id = %request.device_id, error = %e, "Pairing rejected");
                        AuthResponse::rejected(&e)
                    }
                };
                Some(AuthMessage::AuthResponse(response))
            }
            AuthMessage::ReconnectRequest(request) => {
                let response = match self
                    .sessions
                    .check(&request.session_token, &request.device_id)
                    .await
                {
                    Ok(()) => {
                        self.hub.add_device(&request.device_id).await;
                        self.codec
                            .lock()
                            .await
                            .rekey(CryptoEngine::derive_key(&request.session_token));
                        AuthResponse::ok(request.session_token)
                    }
                    Err(e) => {
                        warn!(device_id = %request.device_id, error = %e, "Reconnect rejected");
                        self.hub.remove_device(&request.device_id).await;
                        AuthResponse::rejected(&e)
                    }
                };
                Some(AuthMessage::AuthResponse(response))
            }
            AuthMessage::AuthResponse(_) => None,
        }
    }

    /// Event loop: consumes clipboard changes and inbound frames until
    /// stopped; reassembly staleness is swept on a housekeeping tick
    pub async fn run(
        self: Arc<Self>,
        mut changes: tokio::sync::mpsc::Receiver<ClipboardContent>,
        mut frames: tokio::sync::mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        self.start().await;
        let mut housekeeping =
            tokio::time::interval(Duration::from_secs(self.config.reassembly_staleness_secs.max(1)));

        loop {
            if self.state().await == SyncState::Stopped {
                return Ok(());
            }
            tokio::select! {
                change = changes.recv() => match change {
                    Some(content) => {
                        if let Err(e) = self.handle_local_change(content).await {
                            warn!(error = %e, "Local sync failed");
                        }
                    }
                    None => return Ok(()),
                },
                frame = frames.recv() => match frame {
                    Some(raw) => {
                        // Auth traffic shares the frame channel; its JSON
                        // tag disambiguates it from codec frames
                        if let Ok(message) = serde_json::from_slice::<AuthMessage>(&raw) {
                            if let Some(response) = self.handle_auth_message(message).await {
                                match serde_json::to_vec(&response) {
                                    Ok(bytes) => {
                                        if let Err(e) = self
                                            .transport
                                            .send_frames(vec![Bytes::from(bytes)])
                                            .await
                                        {
                                            warn!(error = %e, "Auth response send failed");
                                        }
                                    }
                                    Err(e) => warn!(error = %e, "Auth response encode failed"),
                                }
                            }
                        } else if let Err(e) = self.handle_remote_frame(&raw).await {
                            warn!(error = %e, "Inbound frame failed");
                        }
                    }
                    None => return Ok(()),
                },
                _ = housekeeping.tick() => {
                    self.codec.lock().await.sweep_stale();
                }
            }
        }
    }

    /// Stop synchronously: clear reassembly buffers and close the
    /// transport. `Stopped` is terminal, so the event loop and its
    /// housekeeping tick wind down on their next pass.
    pub async fn stop(&self) -> Result<()> {
        *self.state.write().await = SyncState::Stopped;
        self.codec.lock().await.clear();
        self.transport.close().await?;
        info!(device_id = %self.device_id, "Sync coordinator stopped");
        Ok(())
    }

    async fn set_state(&self, next: SyncState) {
        let mut state = self.state.write().await;
        // Stopped is terminal
        if *state != SyncState::Stopped {
            *state = next;
        }
    }
}

/// SHA-256 hex fingerprint used for dedup and loop prevention
pub fn fingerprint(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}
