//! Configuration management for ezftp
//!
//! Config files are stored in platform-appropriate locations:
//! - Linux: ~/.config/ezftp/
//! - macOS: ~/Library/Application Support/ezftp/
//! - Windows: %APPDATA%\ezftp\

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::{CredentialError, CredentialStore};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Config directory not found")]
    NoDirFound,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Credential file location override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,

    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upload client configuration
    #[serde(default)]
    pub client: ClientConfig,
}

/// Server-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// FTP control port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory exposed to FTP clients
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Bind to this address instead of the resolved outward-facing one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<IpAddr>,

    /// Time connected clients get to finish after a stop request
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Extra time before the server thread is torn down regardless
    #[serde(default = "default_force_close")]
    pub force_close_secs: u64,

    /// Drop sessions idle for this long
    #[serde(default = "default_idle_timeout")]
    pub idle_session_timeout_secs: u64,
}

/// Upload client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Control connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Socket read/write timeout during a transfer in seconds
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,

    /// Upload target; the resolved local address when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_host: Option<String>,
}

// Default value functions
fn default_port() -> u16 {
    crate::DEFAULT_FTP_PORT
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from(crate::DEFAULT_UPLOAD_DIR)
}
fn default_shutdown_grace() -> u64 {
    5
}
fn default_force_close() -> u64 {
    3
}
fn default_idle_timeout() -> u64 {
    600 // 10 minutes
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_transfer_timeout() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            upload_dir: default_upload_dir(),
            bind_addr: None,
            shutdown_grace_secs: default_shutdown_grace(),
            force_close_secs: default_force_close(),
            idle_session_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
            default_host: None,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn force_close(&self) -> Duration {
        Duration::from_secs(self.force_close_secs)
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

impl Config {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join("ezftp"))
            .ok_or(ConfigError::NoDirFound)
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load config from specific path
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be in 1-65535".to_string()));
        }
        if self.client.connect_timeout_secs == 0 || self.client.transfer_timeout_secs == 0 {
            return Err(ConfigError::Invalid("client timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Credential store honoring the `credentials_path` override
    pub fn credential_store(&self) -> Result<CredentialStore, CredentialError> {
        match &self.credentials_path {
            Some(path) => Ok(CredentialStore::new(path)),
            None => CredentialStore::default_location(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, crate::DEFAULT_FTP_PORT);
        assert_eq!(config.server.upload_dir, PathBuf::from("uploaded_files"));
        assert!(config.server.bind_addr.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[client]"));

        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.client.transfer_timeout_secs, config.client.transfer_timeout_secs);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            credentials_path = "/tmp/creds.cfg"

            [server]
            port = 2121
            bind_addr = "127.0.0.1"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.server.port, 2121);
        assert_eq!(parsed.server.bind_addr, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(parsed.server.shutdown_grace_secs, 5);
        assert_eq!(parsed.client.connect_timeout_secs, 10);
        assert_eq!(
            parsed.credential_store().unwrap().path(),
            std::path::Path::new("/tmp/creds.cfg")
        );
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_save_and_load_from() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let mut config = Config::default();
        config.server.port = 2221;
        config.client.default_host = Some("192.0.2.7".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.server.port, 2221);
        assert_eq!(loaded.client.default_host.as_deref(), Some("192.0.2.7"));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        // Files written before the banner setting was dropped still load
        let parsed: Config = toml::from_str(
            r#"
            [server]
            port = 2121
            greeting = "custom banner"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.server.port, 2121);

        let saved = toml::to_string_pretty(&parsed).unwrap();
        assert!(!saved.contains("greeting"));
    }
}
