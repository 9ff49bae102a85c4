//! Configuration file handling
//!
//! Settings live in `<config_dir>/stationmail/config.toml`. A missing file
//! yields defaults; a malformed one is an error so typos are not silently
//! ignored.

use crate::email::coordinator::CoordinatorSettings;
use crate::email::{AttachmentLimits, OutboxSettings, Profile, ProfileService, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const APP_DIR: &str = "stationmail";
const CONFIG_FILE: &str = "config.toml";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot determine the {0} directory")]
    NoDirectory(&'static str),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Local identity used for `from` on new threads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub callsign: String,
    pub npub: String,
    pub nickname: String,
    /// Station new threads are sent through
    pub station: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            callsign: "NOCALL".to_string(),
            npub: String::new(),
            nickname: String::new(),
            station: "local".to_string(),
        }
    }
}

/// Outbox timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub send_timeout_secs: u64,
    pub dsn_timeout_secs: u64,
    /// Seconds between background outbox passes
    pub interval_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 15,
            dsn_timeout_secs: 600,
            interval_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-subscriber buffer sizes of the event streams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub change_buffer: usize,
    pub notification_buffer: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            change_buffer: 256,
            notification_buffer: 64,
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// Where threads are stored; defaults to the platform data directory
    pub data_dir: Option<PathBuf>,
    pub identity: IdentityConfig,
    pub attachments: AttachmentLimits,
    pub outbox: OutboxConfig,
    pub events: EventConfig,
}

impl MailConfig {
    /// `<platform config dir>/stationmail`
    pub fn default_config_dir() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or(ConfigError::NoDirectory("config"))
    }

    /// Load from `config_dir`, or the platform default when `None`
    pub async fn load(config_dir: Option<&Path>) -> ConfigResult<Self> {
        let dir = match config_dir {
            Some(dir) => dir.to_path_buf(),
            None => Self::default_config_dir()?,
        };
        Self::load_from(&dir.join(CONFIG_FILE)).await
    }

    pub async fn load_from(path: &Path) -> ConfigResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let config: MailConfig = toml::from_str(&content)?;
                info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub async fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Configured data directory, else `<platform data dir>/stationmail`
    pub fn resolve_data_dir(&self) -> ConfigResult<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join(APP_DIR))
                .ok_or(ConfigError::NoDirectory("data")),
        }
    }

    pub fn coordinator_settings(&self, data_dir: PathBuf) -> CoordinatorSettings {
        CoordinatorSettings {
            data_dir,
            attachments: self.attachments,
            outbox: OutboxSettings {
                send_timeout: Duration::from_secs(self.outbox.send_timeout_secs),
                dsn_timeout: Duration::from_secs(self.outbox.dsn_timeout_secs),
                retry: self.outbox.retry.clone(),
            },
            outbox_interval: Duration::from_secs(self.outbox.interval_secs.max(1)),
            change_buffer: self.events.change_buffer,
            notification_buffer: self.events.notification_buffer,
        }
    }
}

/// Profile taken from the `[identity]` section
#[derive(Debug, Clone)]
pub struct ConfiguredProfile(pub IdentityConfig);

impl ProfileService for ConfiguredProfile {
    fn profile(&self) -> Profile {
        Profile {
            callsign: self.0.callsign.clone(),
            npub: self.0.npub.clone(),
            nickname: self.0.nickname.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = MailConfig::load(Some(dir.path())).await.unwrap();
        assert_eq!(config, MailConfig::default());
        assert_eq!(config.attachments.max_file_bytes, 5 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[identity]\ncallsign = \"X1ABCD\"\n\n[outbox.retry]\nmax_failed_passes = 3\n",
        )
        .unwrap();

        let config = MailConfig::load(Some(dir.path())).await.unwrap();
        assert_eq!(config.identity.callsign, "X1ABCD");
        assert_eq!(config.identity.station, "local");
        assert_eq!(config.outbox.retry.max_failed_passes, 3);
        assert_eq!(config.outbox.retry.base_delay_secs, 5);
        assert_eq!(config.outbox.send_timeout_secs, 15);
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "outbox = 12").unwrap();
        assert!(matches!(
            MailConfig::load(Some(dir.path())).await,
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let mut config = MailConfig::default();
        config.data_dir = Some(dir.path().join("data"));
        config.outbox.interval_secs = 5;

        config.save_to(&path).await.unwrap();
        assert_eq!(MailConfig::load_from(&path).await.unwrap(), config);

        let settings = config.coordinator_settings(config.resolve_data_dir().unwrap());
        assert_eq!(settings.outbox_interval, Duration::from_secs(5));
        assert_eq!(settings.data_dir, dir.path().join("data"));
    }
}
