//! # hub-client
//!
//! Session lifecycle and realtime notification core for the Green Living Hub client.
//!
//! - [`credentials`]: credential persistence, the [`SessionManager`] and the
//!   single-flight [`RefreshCoordinator`]
//! - [`http`]: auth endpoints and the [`RequestGateway`] that renews and retries
//!   once on an authorization rejection
//! - [`notifications`]: the push [`NotificationChannel`] and the
//!   [`NotificationStore`] it feeds
//!
//! ## Example
//!
//! ```rust,ignore
//! use hub_client::{ClientConfig, HubClient};
//!
//! let client = HubClient::new(ClientConfig::new("https://hub.example.com"))?;
//! client.login("user@example.com", "secret").await?;
//! client.notifications().load_initial().await?;
//! client.channel().connect()?;
//! ```

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod notifications;

pub use client::HubClient;
pub use config::ClientConfig;
pub use credentials::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, RefreshCoordinator,
    RefreshPhase, Session, SessionEvent, SessionManager, UserProfile,
};
pub use error::{ClientError, Result};
pub use http::{ApiResponse, RequestGateway, RequestSpec};
pub use notifications::{
    ChannelEvent, ChannelState, Notification, NotificationChannel, NotificationStore,
    ReconnectPolicy,
};
