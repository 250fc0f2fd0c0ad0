//! Authenticated request gateway.
//!
//! Every call carries the current access credential. An authorization rejection
//! drives exactly one renew-then-retry cycle for that call; a second rejection is
//! returned as [`ClientError::AuthExpired`].

use std::sync::Arc;

use bytes::Bytes;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::config::ClientConfig;
use crate::credentials::{RefreshCoordinator, SessionManager};
use crate::error::{ClientError, Result};

use super::api::ensure_success;

/// Description of one request, replayable for the retry.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    path: String,
    /// Whether `path` lives below the configured `api_prefix`.
    prefixed: bool,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            prefixed: true,
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Resolve `path` against the host instead of the API prefix.
    pub fn absolute(mut self) -> Self {
        self.prefixed = false;
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Successful response with its body already read.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

enum Attempt {
    Done(ApiResponse),
    Unauthorized,
}

/// Wraps every authenticated call.
#[derive(Clone)]
pub struct RequestGateway {
    client: Client,
    config: Arc<ClientConfig>,
    session: Arc<SessionManager>,
    refresher: RefreshCoordinator,
}

impl RequestGateway {
    pub fn new(
        client: Client,
        config: Arc<ClientConfig>,
        session: Arc<SessionManager>,
        refresher: RefreshCoordinator,
    ) -> Self {
        Self {
            client,
            config,
            session,
            refresher,
        }
    }

    /// Issue `spec`, renewing the credential and retrying once on a 401.
    #[instrument(skip(self, spec), fields(method = %spec.method, path = %spec.path))]
    pub async fn call(&self, spec: &RequestSpec) -> Result<ApiResponse> {
        let epoch = self.refresher.epoch();
        let access = self
            .session
            .current_access_credential()
            .await
            .ok_or(ClientError::NotAuthenticated)?;

        match self.send(spec, &access).await? {
            Attempt::Done(response) => return Ok(response),
            Attempt::Unauthorized => debug!("Access credential rejected; renewing"),
        }

        let renewed = self.refresher.renew_after(epoch).await?;

        match self.send(spec, &renewed).await? {
            Attempt::Done(response) => Ok(response),
            Attempt::Unauthorized => {
                warn!("Rejected again after renewal");
                Err(ClientError::AuthExpired)
            }
        }
    }

    /// Call and decode a JSON body.
    pub async fn call_json<T: DeserializeOwned>(&self, spec: &RequestSpec) -> Result<T> {
        self.call(spec).await?.json()
    }

    /// Call and discard the body.
    pub async fn call_empty(&self, spec: &RequestSpec) -> Result<()> {
        self.call(spec).await.map(|_| ())
    }

    async fn send(&self, spec: &RequestSpec, access: &str) -> Result<Attempt> {
        let url = if spec.prefixed {
            self.config.api_endpoint(&spec.path)?
        } else {
            self.config.endpoint(&spec.path)?
        };

        let mut request = self
            .client
            .request(spec.method.clone(), url)
            .bearer_auth(access);
        if !spec.query.is_empty() {
            request = request.query(&spec.query);
        }
        if let Some(body) = &spec.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(ClientError::from_reqwest)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(Attempt::Unauthorized);
        }

        let response = ensure_success(response).await?;
        let status = response.status();
        let body = response.bytes().await.map_err(ClientError::from_reqwest)?;
        Ok(Attempt::Done(ApiResponse { status, body }))
    }
}
