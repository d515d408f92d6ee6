use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Well known tenants and authorities
pub mod authority {
    /// Tenant id of Microsoft consumer accounts
    pub const MSA_CONSUMER_TENANT_ID: &str = "9188040d-6c67-4c5b-b112-36a304b66dad";
    /// Passthrough tenant used when an MSA signs in to first party AAD apps
    pub const MSA_PASSTHROUGH_TENANT_ID: &str = "f8cdef31-a31e-4b4a-93e4-5f571e91255a";
    pub const DEFAULT_ENVIRONMENT: &str = "login.microsoftonline.com";
}

/// Default telemetry limits
pub mod telemetry {
    /// Maximum length of a telemetry header value
    pub const HEADER_DATA_LIMIT: usize = 3800;
    /// Maximum number of failed requests kept for the last request header
    pub const FAILED_REQUEST_CAP: usize = 100;
}

pub const APP_NAME: &str = "identity-common";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Overrides the platform config directory
    pub dir: Option<PathBuf>,
    pub store_name: String,
    pub encrypt: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            dir: None,
            store_name: "com.microsoft.identity.client.account_credential_cache".to_string(),
            encrypt: true,
        }
    }
}

impl StorageSettings {
    /// Configured directory, or the platform default
    pub fn resolve_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => default_storage_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub header_data_limit: usize,
    pub failed_request_cap: usize,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            header_data_limit: telemetry::HEADER_DATA_LIMIT,
            failed_request_cap: telemetry::FAILED_REQUEST_CAP,
        }
    }
}

/// Top level configuration, usually read from `identity-common.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub logging: LoggingConfig,
    pub storage: StorageSettings,
    pub telemetry: TelemetrySettings,
}

impl CommonConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content)
            .context("Failed to parse configuration")
            .map_err(|e| ConfigError::ParsingFailed { source: e })
    }

    /// Load configuration from a file. A missing file yields the defaults.
    #[instrument(level = "debug")]
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read configuration file")
            .map_err(|e| ConfigError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?;

        Self::from_toml_str(&content)
    }
}

/// Platform config directory for this library
pub fn default_storage_dir() -> Result<PathBuf, ConfigError> {
    let project_dirs = directories::ProjectDirs::from("", "", APP_NAME)
        .ok_or(ConfigError::ProjectDirectoriesUnavailable)?;

    Ok(project_dirs.config_dir().join("storage"))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to parse config: {source}")]
    ParsingFailed {
        #[source]
        source: anyhow::Error,
    },

    #[error("Could not determine config directory")]
    ProjectDirectoriesUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = CommonConfig::default();
        assert_eq!(config.telemetry.header_data_limit, 3800);
        assert_eq!(config.telemetry.failed_request_cap, 100);
        assert!(config.storage.encrypt);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CommonConfig::from_toml_str(
            r#"
            [logging]
            level = "debug"

            [telemetry]
            failed_request_cap = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.telemetry.failed_request_cap, 10);
        assert_eq!(config.telemetry.header_data_limit, 3800);
    }

    #[test]
    fn test_invalid_toml() {
        let result = CommonConfig::from_toml_str("[logging\nlevel=");
        assert!(matches!(result, Err(ConfigError::ParsingFailed { .. })));
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = CommonConfig::load(&temp.path().join("missing.toml"))
            .await
            .unwrap();
        assert_eq!(config, CommonConfig::default());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("identity-common.toml");
        tokio::fs::write(&path, "[storage]\nencrypt = false\ndir = \"/tmp/ic\"\n")
            .await
            .unwrap();

        let config = CommonConfig::load(&path).await.unwrap();
        assert!(!config.storage.encrypt);
        assert_eq!(config.storage.resolve_dir().unwrap(), PathBuf::from("/tmp/ic"));
    }
}
