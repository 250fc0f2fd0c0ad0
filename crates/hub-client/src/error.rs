//! Client error types.

use reqwest::StatusCode;
use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the session and notification core.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An authenticated call was rejected even after a renewal and retry.
    #[error("Authorization expired")]
    AuthExpired,

    /// The refresh credential was rejected or the renewal could not complete.
    /// The session has been destroyed.
    #[error("Credential renewal failed: {0}")]
    RenewalFailed(String),

    /// Login was rejected by the server.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// No session is stored.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The request did not complete within the configured timeout.
    #[error("Request timed out")]
    Timeout,

    /// Non-authorization HTTP failure.
    #[error("API error ({status}): {body}")]
    Api { status: StatusCode, body: String },

    /// The push transport closed unexpectedly.
    #[error("Notification channel dropped: {0}")]
    ChannelDropped(String),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A push payload could not be decoded.
    #[error("Malformed push message: {0}")]
    MalformedPush(String),

    /// Credential storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a websocket error.
    pub fn websocket(msg: impl Into<String>) -> Self {
        Self::WebSocket(msg.into())
    }

    /// Map a reqwest error, keeping timeouts distinct from other network failures.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err)
        }
    }

    /// Whether this error is an authorization rejection.
    #[inline]
    pub fn is_auth_rejection(&self) -> bool {
        match self {
            Self::AuthExpired => true,
            Self::Api { status, .. } => *status == StatusCode::UNAUTHORIZED,
            _ => false,
        }
    }

    /// Check if this error requires the user to log in again.
    pub fn requires_relogin(&self) -> bool {
        matches!(
            self,
            Self::RenewalFailed(_) | Self::NotAuthenticated | Self::InvalidCredentials(_)
        )
    }

    /// Check if this error is transient and may be retried by the caller.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::ChannelDropped(_) | Self::WebSocket(_) => {
                true
            }
            Self::Api { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}
