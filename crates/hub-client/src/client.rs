use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::credentials::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, RefreshCoordinator, Session,
    SessionManager, UserProfile,
};
use crate::error::{ClientError, Result};
use crate::http::{AuthApi, RequestGateway, RequestSpec};
use crate::notifications::{NotificationChannel, NotificationStore};

/// All client components wired together from one [`ClientConfig`].
///
/// Each component is also usable on its own; this type only builds them with a
/// shared HTTP client and session.
pub struct HubClient {
    config: Arc<ClientConfig>,
    session: Arc<SessionManager>,
    refresher: RefreshCoordinator,
    gateway: RequestGateway,
    notifications: Arc<NotificationStore>,
    channel: NotificationChannel,
}

impl HubClient {
    /// Build a client, persisting credentials at `config.credentials_path` when set.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let store: Arc<dyn CredentialStore> = match &config.credentials_path {
            Some(path) => Arc::new(FileCredentialStore::new(path)),
            None => Arc::new(MemoryCredentialStore::new()),
        };
        Self::with_store(config, store)
    }

    pub fn with_store(config: ClientConfig, store: Arc<dyn CredentialStore>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let http = config.http_client()?;

        let api = AuthApi::new(http.clone(), Arc::clone(&config));
        let session = Arc::new(SessionManager::new(store, api.clone()));
        let refresher =
            RefreshCoordinator::new(Arc::clone(&session), api, config.request_timeout());
        let gateway = RequestGateway::new(
            http,
            Arc::clone(&config),
            Arc::clone(&session),
            refresher.clone(),
        );
        let notifications = Arc::new(NotificationStore::new(gateway.clone()));
        let channel = NotificationChannel::new(
            Arc::clone(&config),
            Arc::clone(&session),
            Arc::clone(&notifications),
        );

        debug!(base_url = %config.base_url, "Client initialized");
        Ok(Self {
            config,
            session,
            refresher,
            gateway,
            notifications,
            channel,
        })
    }

    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Session> {
        self.session.login(identifier, secret).await
    }

    pub async fn login_with_federated_token(&self, provider_token: &str) -> Result<Session> {
        self.session.login_with_federated_token(provider_token).await
    }

    /// Disconnect the push channel, then drop the session.
    pub async fn logout(&self) -> Result<()> {
        self.channel.disconnect().await;
        self.session.logout().await
    }

    /// Re-validate persisted credentials and cache the profile.
    ///
    /// Goes through the gateway, so an expired access credential is renewed first.
    /// Returns `Ok(None)` when nothing is stored.
    pub async fn restore_session(&self) -> Result<Option<UserProfile>> {
        if self.session.current_access_credential().await.is_none() {
            return Ok(None);
        }
        let spec = RequestSpec::get(AuthApi::profile_path()).absolute();
        let profile: UserProfile = match self.gateway.call_json(&spec).await {
            Ok(profile) => profile,
            Err(ClientError::AuthExpired) => {
                self.session.logout().await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.session.restore(profile.clone()).await;
        info!(user_id = profile.id, "Persisted session is valid");
        Ok(Some(profile))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn notifications(&self) -> &Arc<NotificationStore> {
        &self.notifications
    }

    pub fn channel(&self) -> &NotificationChannel {
        &self.channel
    }
}
