//! Raw authentication endpoints.
//!
//! These calls carry no retry logic of their own; the session manager and the
//! refresh coordinator decide what a failure means.

use std::sync::Arc;

use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ClientConfig;
use crate::credentials::UserProfile;
use crate::error::{ClientError, Result};

const OBTAIN_PAIR_PATH: &str = "/auth/jwt/create/";
const REFRESH_PATH: &str = "/auth/jwt/refresh/";
const PROFILE_PATH: &str = "/auth/users/me/";

/// Access/refresh pair issued on login.
#[derive(Clone, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair").finish_non_exhaustive()
    }
}

/// Result of a renewal. `refresh` is present only when the server rotated it.
#[derive(Clone, Deserialize)]
pub struct RenewedAccess {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

impl std::fmt::Debug for RenewedAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewedAccess")
            .field("rotated", &self.refresh.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct ObtainPairRequest<'a> {
    identifier: &'a str,
    secret: &'a str,
}

#[derive(Serialize)]
struct FederatedRequest<'a> {
    access_token: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

/// Thin client over the `/auth` routes.
#[derive(Clone)]
pub struct AuthApi {
    client: Client,
    config: Arc<ClientConfig>,
}

impl AuthApi {
    pub fn new(client: Client, config: Arc<ClientConfig>) -> Self {
        Self { client, config }
    }

    /// Exchange an identifier/secret pair for credentials.
    pub async fn obtain_pair(&self, identifier: &str, secret: &str) -> Result<TokenPair> {
        let url = self.config.endpoint(OBTAIN_PAIR_PATH)?;
        let response = self
            .client
            .post(url)
            .json(&ObtainPairRequest { identifier, secret })
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        let response = ensure_success(response).await?;
        response.json().await.map_err(ClientError::from_reqwest)
    }

    /// Exchange a federated-identity provider token for credentials.
    pub async fn exchange_federated(&self, provider_token: &str) -> Result<TokenPair> {
        let url = self.config.endpoint(&self.config.federated_login_path)?;
        let response = self
            .client
            .post(url)
            .json(&FederatedRequest {
                access_token: provider_token,
            })
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        let response = ensure_success(response).await?;
        response.json().await.map_err(ClientError::from_reqwest)
    }

    /// Renew the access credential.
    pub async fn renew(&self, refresh: &str) -> Result<RenewedAccess> {
        let url = self.config.endpoint(REFRESH_PATH)?;
        let response = self
            .client
            .post(url)
            .json(&RefreshRequest { refresh })
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        let response = ensure_success(response).await?;
        let renewed: RenewedAccess = response.json().await.map_err(ClientError::from_reqwest)?;
        debug!(rotated = renewed.refresh.is_some(), "Access credential renewed");
        Ok(renewed)
    }

    /// Fetch the profile of the user owning `access`.
    pub async fn fetch_profile(&self, access: &str) -> Result<UserProfile> {
        let url = self.config.endpoint(PROFILE_PATH)?;
        let response = self
            .client
            .get(url)
            .bearer_auth(access)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        let response = ensure_success(response).await?;
        response.json().await.map_err(ClientError::from_reqwest)
    }

    /// Route of the profile endpoint, for authenticated calls through the gateway.
    pub fn profile_path() -> &'static str {
        PROFILE_PATH
    }
}

/// Turn a non-2xx response into `ClientError::Api`, keeping the body for diagnostics.
pub(crate) async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Api { status, body })
}

/// Whether a login endpoint rejected the submitted credentials.
pub(crate) fn is_rejected_login(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    )
}

/// Extract the server's `detail` message, falling back to the raw body.
pub(crate) fn detail_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
