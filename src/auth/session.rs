//! Session token issuance, validation, and expiry
//!
//! Tokens are opaque random strings bound to a single device. A device holds
//! at most one active session; re-pairing supersedes the previous token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::AuthError;

/// Bytes of entropy in a token value (hex-encoded on the wire)
const TOKEN_ENTROPY_BYTES: usize = 32;

/// A session token as handed to the paired device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    /// Opaque random value, hex-encoded
    pub value: String,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Server-side record for an issued token
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionInfo {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Issues, validates, revokes, and sweeps session tokens
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionInfo>>>,
    session_ttl: Duration,
}

impl SessionStore {
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            session_ttl,
        }
    }

    /// Create a session for a device, superseding any existing one
    pub async fn create_session(&self, device_id: &str) -> SessionToken {
        let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let value = hex::encode(bytes);

        let created_at = Utc::now();
        let expires_at =
            created_at + chrono::Duration::from_std(self.session_ttl).unwrap_or_default();

        let mut sessions = self.sessions.write().await;
        // One active session per device
        sessions.retain(|_, info| info.device_id != device_id);
        sessions.insert(
            value.clone(),
            SessionInfo {
                device_id: device_id.to_string(),
                created_at,
                expires_at,
            },
        );

        info!(device_id, expires_at = %expires_at, "Session created");
        SessionToken {
            value,
            device_id: device_id.to_string(),
            created_at,
            expires_at,
        }
    }

    /// Typed validation, distinguishing unknown from expired tokens
    ///
    /// An expired entry is evicted on lookup.
    pub async fn check(&self, token: &str, device_id: &str) -> Result<(), AuthError> {
        let mut sessions = self.sessions.write().await;
        let info = sessions.get(token).ok_or(AuthError::SessionNotFound)?;

        if info.is_expired(Utc::now()) {
            let device_id = info.device_id.clone();
            sessions.remove(token);
            return Err(AuthError::SessionExpired { device_id });
        }

        if info.device_id != device_id {
            return Err(AuthError::SessionNotFound);
        }
        Ok(())
    }

    /// Boolean validation per the wire contract
    pub async fn validate(&self, token: &str, device_id: &str) -> bool {
        self.check(token, device_id).await.is_ok()
    }

    /// Remove a session, disconnecting its device
    pub async fn revoke(&self, token: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(info) = sessions.remove(token) {
            info!(device_id = %info.device_id, "Session revoked");
        }
    }

    /// Remove every expired session; returns how many were evicted
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, info| !info.is_expired(now));
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, "Swept expired sessions");
        }
        evicted
    }

    /// Devices holding a live session right now
    pub async fn connected_devices(&self) -> Vec<String> {
        let now = Utc::now();
        let sessions = self.sessions.read().await;
        let mut devices: Vec<String> = sessions
            .values()
            .filter(|info| !info.is_expired(now))
            .map(|info| info.device_id.clone())
            .collect();
        devices.sort();
        devices.dedup();
        devices
    }

    /// Spawn the periodic expired-session sweep
    ///
    /// This is the only background scan over the session table.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                store.cleanup_expired().await;
            }
        })
    }
}
