//! Authenticated identity.
//!
//! The [`SessionManager`] is the single owner of the session: it commits logins,
//! performs logouts, and applies the outcome of renewals decided by the
//! [`RefreshCoordinator`](super::RefreshCoordinator). Every write to the
//! credential store goes through it, serialized by one lock and guarded by a
//! generation counter so a renewal started for an old session can never
//! overwrite a newer one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, instrument, warn};

use super::store::CredentialStore;
use crate::error::{ClientError, Result};
use crate::http::api::{AuthApi, TokenPair, detail_message, is_rejected_login};

pub type UserId = u64;

/// Profile returned by `/auth/users/me/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Any other fields the server returns.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The authenticated session.
#[derive(Clone)]
pub struct Session {
    pub access: String,
    pub refresh: String,
    pub user_id: UserId,
    pub profile: Option<UserProfile>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A login (or session restore) succeeded.
    LoggedIn { user_id: UserId },
    /// The access credential was renewed.
    Renewed,
    /// Explicit logout.
    LoggedOut,
    /// Renewal failed and the session was destroyed.
    ForcedLogout { reason: String },
}

/// Listener invoked with the failure reason when the session becomes unrecoverable.
pub type ForcedLogoutListener = Arc<dyn Fn(&str) + Send + Sync>;

const EVENT_CHANNEL_CAPACITY: usize = 32;

pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    api: AuthApi,
    profile: RwLock<Option<UserProfile>>,
    listeners: RwLock<Vec<ForcedLogoutListener>>,
    event_tx: broadcast::Sender<SessionEvent>,
    /// Bumped on every login, logout and forced logout.
    generation: AtomicU64,
    /// Serializes every credential write.
    write_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CredentialStore>, api: AuthApi) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            api,
            profile: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            event_tx,
            generation: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Log in with an identifier and secret.
    ///
    /// On failure the existing session (if any) is left untouched.
    #[instrument(skip(self, secret))]
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Session> {
        let pair = self
            .api
            .obtain_pair(identifier, secret)
            .await
            .map_err(reject_as_invalid)?;
        self.establish(pair).await
    }

    /// Log in through the federated-identity exchange.
    #[instrument(skip_all)]
    pub async fn login_with_federated_token(&self, provider_token: &str) -> Result<Session> {
        let pair = self
            .api
            .exchange_federated(provider_token)
            .await
            .map_err(reject_as_invalid)?;
        self.establish(pair).await
    }

    /// Fetch the profile for a freshly issued pair, then commit both.
    async fn establish(&self, pair: TokenPair) -> Result<Session> {
        let profile = self
            .api
            .fetch_profile(&pair.access)
            .await
            .map_err(reject_as_invalid)?;

        {
            let _guard = self.write_lock.lock().await;
            self.store.save(&pair.access, &pair.refresh).await?;
            *self.profile.write() = Some(profile.clone());
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        info!(user_id = profile.id, "Logged in");
        let _ = self.event_tx.send(SessionEvent::LoggedIn {
            user_id: profile.id,
        });

        Ok(Session {
            access: pair.access,
            refresh: pair.refresh,
            user_id: profile.id,
            profile: Some(profile),
        })
    }

    /// Drop the session. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<()> {
        let had_session = {
            let _guard = self.write_lock.lock().await;
            let had_session = self.store.access().await.is_some()
                || self.store.refresh().await.is_some()
                || self.profile.read().is_some();
            self.store.clear().await?;
            *self.profile.write() = None;
            self.generation.fetch_add(1, Ordering::SeqCst);
            had_session
        };

        if had_session {
            info!("Logged out");
            let _ = self.event_tx.send(SessionEvent::LoggedOut);
        }
        Ok(())
    }

    /// The access credential to attach to outgoing calls.
    pub async fn current_access_credential(&self) -> Option<String> {
        self.store.access().await
    }

    pub(crate) async fn refresh_credential(&self) -> Option<String> {
        self.store.refresh().await
    }

    /// Register a listener for forced logouts.
    pub fn on_forced_logout<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(callback));
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Cached profile of the logged-in user.
    pub fn profile(&self) -> Option<UserProfile> {
        self.profile.read().clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.profile.read().as_ref().map(|p| p.id)
    }

    /// Snapshot of the full session, if one exists.
    pub async fn session(&self) -> Option<Session> {
        let access = self.store.access().await?;
        let refresh = self.store.refresh().await?;
        let profile = self.profile()?;
        Some(Session {
            access,
            refresh,
            user_id: profile.id,
            profile: Some(profile),
        })
    }

    /// Cache the profile of a persisted session after it was re-validated.
    pub async fn restore(&self, profile: UserProfile) {
        let user_id = profile.id;
        {
            let _guard = self.write_lock.lock().await;
            *self.profile.write() = Some(profile);
        }
        info!(user_id, "Session restored");
        let _ = self.event_tx.send(SessionEvent::LoggedIn { user_id });
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Apply a successful renewal started under `generation`.
    ///
    /// Returns `Ok(false)` when the session changed in the meantime; nothing is written then.
    pub(crate) async fn commit_renewal(
        &self,
        generation: u64,
        access: &str,
        rotated_refresh: Option<&str>,
    ) -> Result<bool> {
        {
            let _guard = self.write_lock.lock().await;
            if self.generation() != generation {
                warn!("Session changed during renewal; discarding renewed credential");
                return Ok(false);
            }
            match rotated_refresh {
                Some(refresh) => self.store.save(access, refresh).await?,
                None => self.store.update_access(access).await?,
            }
        }

        let _ = self.event_tx.send(SessionEvent::Renewed);
        Ok(true)
    }

    /// Destroy the session after a failed renewal started under `generation`.
    ///
    /// Listeners fire only if this call actually destroyed the session. Returns
    /// the generation that follows the destroyed one, or `None` if the session
    /// had already changed.
    pub(crate) async fn force_logout(&self, generation: u64, reason: &str) -> Option<u64> {
        let ended = {
            let _guard = self.write_lock.lock().await;
            if self.generation() != generation {
                return None;
            }
            if let Err(e) = self.store.clear().await {
                error!(error = %e, "Failed to clear credentials after renewal failure");
            }
            *self.profile.write() = None;
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        error!(%reason, "Session unrecoverable; forcing logout");
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(reason);
        }
        let _ = self.event_tx.send(SessionEvent::ForcedLogout {
            reason: reason.to_string(),
        });
        Some(ended)
    }
}

/// Login endpoints answer bad credentials with 400/401/403.
fn reject_as_invalid(err: ClientError) -> ClientError {
    match err {
        ClientError::Api { status, body } if is_rejected_login(status) => {
            ClientError::InvalidCredentials(detail_message(&body))
        }
        other => other,
    }
}
