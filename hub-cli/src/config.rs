use anyhow::{Context, Result};
use hub_client::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const APP_DIR: &str = "hubctl";
const CONFIG_FILE: &str = "config.toml";
const CREDENTIALS_FILE: &str = "credentials.json";

/// On-disk configuration: a `[client]` table holding [`ClientConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub client: ClientConfig,
}

impl AppConfig {
    /// Load from `path`, or from the platform config dir. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<AppConfig>(&raw)
                .with_context(|| format!("Invalid configuration in {}", path.display()))?
        } else {
            debug!(path = %path.display(), "No configuration file; using defaults");
            AppConfig::default()
        };

        if config.client.credentials_path.is_none() {
            config.client.credentials_path = Some(Self::default_credentials_path()?);
        }
        Ok(config)
    }

    /// Overwrite the file with defaults.
    pub fn reset(path: Option<&Path>) -> Result<PathBuf> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, AppConfig::default().show()?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn show(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("No configuration directory on this platform")?;
        Ok(dir.join(APP_DIR).join(CONFIG_FILE))
    }

    fn default_credentials_path() -> Result<PathBuf> {
        let dir = dirs::data_local_dir().context("No data directory on this platform")?;
        Ok(dir.join(APP_DIR).join(CREDENTIALS_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [client]
            base_url = "https://hub.example.com"

            [client.reconnect]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.client.base_url, "https://hub.example.com");
        assert_eq!(config.client.reconnect.max_attempts, 3);
        assert_eq!(config.client.reconnect.max_delay_ms, 30_000);
    }

    #[test]
    fn test_show_round_trips() {
        let shown = AppConfig::default().show().unwrap();
        let parsed: AppConfig = toml::from_str(&shown).unwrap();
        assert_eq!(parsed.client.base_url, ClientConfig::default().base_url);
    }
}
