//! Credential persistence abstraction.
//!
//! Holds the two opaque credential strings. Nothing here validates their
//! contents. A store that cannot be read behaves as if no session exists.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

/// Storage key of the access credential.
pub const ACCESS_KEY: &str = "accessToken";
/// Storage key of the refresh credential.
pub const REFRESH_KEY: &str = "refreshToken";

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Replace both credentials.
    async fn save(&self, access: &str, refresh: &str) -> Result<()>;

    /// Replace only the access credential.
    async fn update_access(&self, access: &str) -> Result<()>;

    /// Current access credential, if any.
    async fn access(&self) -> Option<String>;

    /// Current refresh credential, if any.
    async fn refresh(&self) -> Option<String>;

    /// Erase both credentials.
    async fn clear(&self) -> Result<()>;
}

/// On-disk / in-memory document layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(rename = "accessToken", default, skip_serializing_if = "Option::is_none")]
    access: Option<String>,
    #[serde(rename = "refreshToken", default, skip_serializing_if = "Option::is_none")]
    refresh: Option<String>,
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// Volatile store, lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: RwLock<StoredCredentials>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a session.
    pub fn with_credentials(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(StoredCredentials {
                access: Some(access.into()),
                refresh: Some(refresh.into()),
            }),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn save(&self, access: &str, refresh: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.access = Some(access.to_string());
        inner.refresh = Some(refresh.to_string());
        Ok(())
    }

    async fn update_access(&self, access: &str) -> Result<()> {
        self.inner.write().access = Some(access.to_string());
        Ok(())
    }

    async fn access(&self) -> Option<String> {
        non_empty(self.inner.read().access.as_ref())
    }

    async fn refresh(&self) -> Option<String> {
        non_empty(self.inner.read().refresh.as_ref())
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.write() = StoredCredentials::default();
        Ok(())
    }
}

/// JSON file store that survives restarts.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> StoredCredentials {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return StoredCredentials::default();
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Credential store unreadable; treating as logged out"
                );
                return StoredCredentials::default();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Credential store corrupt; treating as logged out"
                );
                StoredCredentials::default()
            }
        }
    }

    async fn persist(&self, stored: &StoredCredentials) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ClientError::storage(format!("create {}: {e}", parent.display())))?;
        }

        let data = serde_json::to_vec_pretty(stored)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| ClientError::storage(format!("write {}: {e}", tmp.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await
            {
                warn!(
                    path = %tmp.display(),
                    error = %e,
                    "Failed to restrict credentials file permissions"
                );
            }
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ClientError::storage(format!("rename {}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), "Credentials persisted");
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn save(&self, access: &str, refresh: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.persist(&StoredCredentials {
            access: Some(access.to_string()),
            refresh: Some(refresh.to_string()),
        })
        .await
    }

    async fn update_access(&self, access: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut stored = self.load().await;
        stored.access = Some(access.to_string());
        self.persist(&stored).await
    }

    async fn access(&self) -> Option<String> {
        non_empty(self.load().await.access.as_ref())
    }

    async fn refresh(&self) -> Option<String> {
        non_empty(self.load().await.refresh.as_ref())
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ClientError::storage(format!(
                "remove {}: {e}",
                self.path.display()
            ))),
        }
    }
}
