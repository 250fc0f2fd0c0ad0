//! Client configuration.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{ClientError, Result};
use crate::notifications::ReconnectPolicy;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_USER_AGENT: &str = concat!("hub-client/", env!("CARGO_PKG_VERSION"));

/// Path of the push endpoint, relative to the host.
pub const PUSH_PATH: &str = "/ws/notifications/";

/// Configuration shared by every component of the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Scheme, host and port of the remote API (no trailing path).
    pub base_url: String,

    /// Prefix for the resource routes (notifications, tasks, ...).
    pub api_prefix: String,

    /// Explicit push endpoint. Derived from `base_url` when absent.
    pub push_url: Option<String>,

    /// Federated-identity exchange route.
    pub federated_login_path: String,

    /// Upper bound for every HTTP call, renewal included.
    pub request_timeout_ms: u64,

    /// User agent string
    pub user_agent: String,

    /// Where credentials are persisted. In-memory only when absent.
    pub credentials_path: Option<PathBuf>,

    /// Push channel reconnection policy.
    pub reconnect: ReconnectPolicy,

    /// How long to wait for the server to acknowledge the handshake.
    pub handshake_timeout_ms: u64,

    /// Keep-alive ping interval for the push channel (disabled when absent).
    pub heartbeat_interval_secs: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_prefix: "/api".to_string(),
            push_url: None,
            federated_login_path: "/auth/google/".to_string(),
            request_timeout_ms: 15_000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            credentials_path: None,
            reconnect: ReconnectPolicy::default(),
            handshake_timeout_ms: 10_000,
            heartbeat_interval_secs: Some(30),
        }
    }
}

impl ClientConfig {
    /// Create a config pointing at `base_url` with defaults for everything else.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }

    pub fn with_push_url(mut self, url: impl Into<String>) -> Self {
        self.push_url = Some(url.into());
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval_secs = interval.map(|d| d.as_secs().max(1));
        self
    }

    #[inline]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[inline]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[inline]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_secs.map(Duration::from_secs)
    }

    /// Check the config for values that would make every call fail.
    pub fn validate(&self) -> Result<()> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| ClientError::config(format!("invalid base_url: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ClientError::config(format!(
                "base_url must be http(s), got {}",
                base.scheme()
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ClientError::config("request_timeout_ms must be > 0"));
        }
        self.reconnect.validate()?;
        self.push_endpoint()?;
        Ok(())
    }

    /// Absolute URL for a route below the host (e.g. `/auth/jwt/create/`).
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| ClientError::config(format!("invalid url {joined}: {e}")))
    }

    /// Absolute URL for a resource route below `api_prefix`.
    pub fn api_endpoint(&self, path: &str) -> Result<Url> {
        let prefix = self.api_prefix.trim_matches('/');
        if prefix.is_empty() {
            self.endpoint(path)
        } else {
            self.endpoint(&format!("{}/{}", prefix, path.trim_start_matches('/')))
        }
    }

    /// WebSocket URL of the push channel.
    pub fn push_endpoint(&self) -> Result<String> {
        if let Some(url) = &self.push_url {
            return Ok(url.clone());
        }

        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ClientError::config(format!("invalid base_url: {e}")))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::config("cannot derive push url from base_url"))?;
        url.set_path(PUSH_PATH);
        url.set_query(None);
        Ok(url.to_string())
    }

    /// Build the shared HTTP client.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        install_rustls_provider();
        reqwest::Client::builder()
            .timeout(self.request_timeout())
            .connect_timeout(self.request_timeout())
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(|e| ClientError::config(format!("failed to build http client: {e}")))
    }
}

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}
