//! Short-lived PIN issuance and validation
//!
//! The authority keeps at most one live PIN. Issuing a new PIN invalidates
//! the previous one, and a PIN is consumed by its first successful
//! validation. An expiry task clears an unconsumed PIN after its TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::session::{SessionStore, SessionToken};
use super::AuthError;

/// A live pairing PIN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pin {
    /// Exactly 4 ASCII digits, zero-padded
    pub code: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Pin {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

struct PairingState {
    live: Option<Pin>,
    /// Incremented on every issue/consume so a stale expiry task cannot
    /// clear a newer PIN
    generation: u64,
    failed_attempts: u64,
}

/// Generates and validates pairing PINs, issuing session tokens on success
pub struct PairingAuthority {
    state: Arc<Mutex<PairingState>>,
    sessions: Arc<SessionStore>,
    pin_ttl: Duration,
}

impl PairingAuthority {
    pub fn new(sessions: Arc<SessionStore>, pin_ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(PairingState {
                live: None,
                generation: 0,
                failed_attempts: 0,
            })),
            sessions,
            pin_ttl,
        }
    }

    /// Generate a fresh 4-digit PIN, replacing any prior live PIN
    ///
    /// Arms an expiry task that clears the PIN if it is still unconsumed
    /// when the TTL elapses.
    pub async fn generate_pin(&self) -> Pin {
        let code = format!("{:04}", rand::rng().random_range(0..10_000u32));
        let issued_at = Utc::now();
        let pin = Pin {
            code,
            issued_at,
            expires_at: issued_at + chrono::Duration::from_std(self.pin_ttl).unwrap_or_default(),
        };

        let generation = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            state.live = Some(pin.clone());
            state.generation
        };

        let state = Arc::clone(&self.state);
        let ttl = self.pin_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut state = state.lock().await;
            if state.generation == generation && state.live.is_some() {
                debug!("Pairing PIN expired unconsumed");
                state.live = None;
            }
        });

        info!(expires_at = %pin.expires_at, "Issued pairing PIN");
        pin
    }

    /// Validate a typed PIN for a device
    ///
    /// On success the PIN is consumed and a session token for `device_id`
    /// is created. Failure leaves the PIN live but counts the attempt.
    pub async fn validate(&self, input: &str, device_id: &str) -> Result<SessionToken, AuthError> {
        let mut state = self.state.lock().await;

        let live = match &state.live {
            Some(pin) => pin.clone(),
            None => {
                state.failed_attempts += 1;
                return Err(AuthError::PinExpired);
            }
        };

        if live.is_expired(Utc::now()) {
            state.live = None;
            state.generation += 1;
            state.failed_attempts += 1;
            return Err(AuthError::PinExpired);
        }

        if input.len() != live.code.len() || input != live.code {
            state.failed_attempts += 1;
            warn!(device_id, attempts = state.failed_attempts, "PIN validation failed");
            return Err(AuthError::InvalidPin);
        }

        // Consume: first successful validation retires the PIN and
        // disarms the expiry task via the generation bump.
        state.live = None;
        state.generation += 1;
        drop(state);

        let token = self.sessions.create_session(device_id).await;
        info!(device_id, "Device paired");
        Ok(token)
    }

    /// Number of failed validation attempts since construction, for logging
    pub async fn failed_attempts(&self) -> u64 {
        self.state.lock().await.failed_attempts
    }

    /// Whether a live, unexpired PIN exists right now
    pub async fn has_live_pin(&self) -> bool {
        let state = self.state.lock().await;
        state
            .live
            .as_ref()
            .map(|p| !p.is_expired(Utc::now()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority(ttl: Duration) -> PairingAuthority {
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(60)));
        PairingAuthority::new(sessions, ttl)
    }

    #[tokio::test]
    async fn test_pin_is_four_digits() {
        let authority = authority(Duration::from_secs(300));
        for _ in 0..32 {
            let pin = authority.generate_pin().await;
            assert_eq!(pin.code.len(), 4);
            assert!(pin.code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_pin_single_use() {
        let authority = authority(Duration::from_secs(300));
        let pin = authority.generate_pin().await;

        let token = authority.validate(&pin.code, "phone-1").await.unwrap();
        assert_eq!(token.device_id, "phone-1");

        // Second validation of the same PIN must fail
        let err = authority.validate(&pin.code, "phone-1").await.unwrap_err();
        assert!(matches!(err, AuthError::PinExpired | AuthError::InvalidPin));
    }

    #[tokio::test]
    async fn test_wrong_pin_rejected_but_pin_stays_live() {
        let authority = authority(Duration::from_secs(300));
        let pin = authority.generate_pin().await;
        let wrong = if pin.code == "0000" { "0001" } else { "0000" };

        assert_eq!(
            authority.validate(wrong, "phone-1").await.unwrap_err(),
            AuthError::InvalidPin
        );
        assert_eq!(authority.failed_attempts().await, 1);

        // The correct PIN still works afterwards; no lockout
        assert!(authority.validate(&pin.code, "phone-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_new_pin_invalidates_previous() {
        let authority = authority(Duration::from_secs(300));
        let first = authority.generate_pin().await;
        let second = authority.generate_pin().await;

        if first.code != second.code {
            assert_eq!(
                authority.validate(&first.code, "phone-1").await.unwrap_err(),
                AuthError::InvalidPin
            );
        }
        assert!(authority.validate(&second.code, "phone-1").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_expires_after_ttl() {
        let authority = authority(Duration::from_millis(50));
        let pin = authority.generate_pin().await;

        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = authority.validate(&pin.code, "phone-1").await.unwrap_err();
        assert_eq!(err, AuthError::PinExpired);
        assert!(!authority.has_live_pin().await);
    }

    #[tokio::test]
    async fn test_validate_with_no_pin_is_expired() {
        let authority = authority(Duration::from_secs(300));
        assert_eq!(
            authority.validate("1234", "phone-1").await.unwrap_err(),
            AuthError::PinExpired
        );
    }
}
