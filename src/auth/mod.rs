//! PIN pairing and session management for ClipLink
//!
//! A device pairs by typing a short-lived 4-digit PIN displayed on the host.
//! Successful validation consumes the PIN and issues a session token that
//! authorizes subsequent traffic until it expires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod pairing;
pub mod session;

pub use pairing::{Pin, PairingAuthority};
pub use session::{SessionInfo, SessionStore, SessionToken};

/// Authentication errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The supplied PIN does not match the live PIN
    #[error("Invalid PIN")]
    InvalidPin,

    /// No live PIN, or the live PIN has passed its expiry
    #[error("PIN expired")]
    PinExpired,

    /// The session token exists but is past its expiry
    #[error("Session expired for device {device_id}")]
    SessionExpired { device_id: String },

    /// No session matches the supplied token
    #[error("Session not found")]
    SessionNotFound,
}

/// Wire-level authentication message envelope
///
/// Carried as JSON: `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AuthMessage {
    /// Client presents a PIN to obtain a session token
    AuthRequest(AuthRequest),

    /// Host answers a pairing or reconnect attempt
    AuthResponse(AuthResponse),

    /// Client resumes with an existing session token
    ReconnectRequest(ReconnectRequest),
}

/// Pairing attempt payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthRequest {
    pub pin: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Pairing or reconnect result payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(rename = "sessionToken", skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Session resumption payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectRequest {
    #[serde(rename = "sessionToken")]
    pub session_token: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
}

impl AuthResponse {
    /// Successful response carrying a freshly issued or still-valid token
    pub fn ok(token: String) -> Self {
        Self {
            success: true,
            session_token: Some(token),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Failed response with a human-readable reason
    pub fn rejected(error: &AuthError) -> Self {
        Self {
            success: false,
            session_token: None,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_request_wire_shape() {
        let msg = AuthMessage::AuthRequest(AuthRequest {
            pin: "4821".to_string(),
            device_id: "phone-1".to_string(),
            timestamp: Utc::now(),
        });

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "auth_request");
        assert_eq!(json["data"]["pin"], "4821");
        assert_eq!(json["data"]["deviceId"], "phone-1");
    }

    #[test]
    fn test_auth_response_omits_absent_fields() {
        let msg = AuthMessage::AuthResponse(AuthResponse::rejected(&AuthError::InvalidPin));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "auth_response");
        assert_eq!(json["data"]["success"], false);
        assert!(json["data"].get("sessionToken").is_none());
        assert_eq!(json["data"]["error"], "Invalid PIN");
    }

    #[test]
    fn test_reconnect_request_roundtrip() {
        let msg = AuthMessage::ReconnectRequest(ReconnectRequest {
            session_token: "tok".to_string(),
            device_id: "phone-1".to_string(),
            timestamp: Utc::now(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        let back: AuthMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
