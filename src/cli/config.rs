use crate::messages::{WireConfig, MAX_MESSAGE_SIZE};
use crate::network::{ClientOptions, Endpoint, HeartbeatConfig, ReconnectPolicy};
use crate::recovery::{BackoffPolicy, DEFAULT_HISTORY_LIMIT};
use crate::state::SnapshotConfig;
use directories::ProjectDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Could not determine the configuration directory")]
    ConfigDirUnavailable,

    #[error("Invalid validation pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub connect_timeout_secs: u64,
    pub max_message_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            path: "/".to_string(),
            query: BTreeMap::new(),
            connect_timeout_secs: 10,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub client_id: String,
    pub client_name: String,
    pub capabilities: Vec<String>,
    pub headers: BTreeMap<String, String>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            client_name: "livelink".to_string(),
            capabilities: vec!["updates".to_string(), "state-preservation".to_string()],
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub auto_reconnect: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub auto_recovery: bool,
    pub history_limit: usize,
    /// How often the route probe checks reachability
    pub reachability_poll_secs: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            auto_recovery: true,
            history_limit: DEFAULT_HISTORY_LIMIT,
            reachability_poll_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub enabled: bool,
    pub persistence_enabled: bool,
    pub cross_artifact_enabled: bool,
    pub compatibility_threshold: f64,
    pub max_history: usize,
    pub max_age_days: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        let defaults = SnapshotConfig::default();
        Self {
            enabled: defaults.enabled,
            persistence_enabled: defaults.persistence_enabled,
            cross_artifact_enabled: defaults.cross_artifact_enabled,
            compatibility_threshold: defaults.compatibility_threshold,
            max_history: defaults.max_history,
            max_age_days: defaults.max_age_days,
            directory: None,
        }
    }
}

/// On-disk client configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerSection,
    pub client: ClientSection,
    pub reconnect: ReconnectSection,
    pub heartbeat: HeartbeatSection,
    pub recovery: RecoverySection,
    pub snapshots: SnapshotSection,
}

impl ClientConfig {
    /// Get the default config directory
    pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("dev", "livelink", "livelink")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::ConfigDirUnavailable)
    }

    /// Get the default config file path
    pub fn default_config_file() -> Result<PathBuf, ConfigError> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ClientConfig = toml::from_str(&content)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load configuration from `path`, writing the defaults there if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }
        let config = ClientConfig::default();
        config.save(path)?;
        info!(path = %path.display(), "Created default configuration");
        Ok(config)
    }

    pub fn load_or_create_default() -> Result<Self, ConfigError> {
        Self::load_or_create(&Self::default_config_file()?)
    }

    /// Reject values the client cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let host = Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9\-\.]*[A-Za-z0-9])?$")?;
        let client_id = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-\.]{0,127}$")?;
        let path = Regex::new(r"^/?[A-Za-z0-9_\-\./~]*$")?;

        if !host.is_match(&self.server.host) {
            return Err(ConfigError::invalid(
                "server.host",
                format!("'{}' is not a hostname or IPv4 address", self.server.host),
            ));
        }
        if self.server.port == 0 {
            return Err(ConfigError::invalid("server.port", "must not be 0"));
        }
        if !path.is_match(&self.server.path) {
            return Err(ConfigError::invalid(
                "server.path",
                format!("'{}' contains unsupported characters", self.server.path),
            ));
        }
        if self.server.connect_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "server.connect_timeout_secs",
                "must be at least 1",
            ));
        }
        if self.server.max_message_size == 0 {
            return Err(ConfigError::invalid("server.max_message_size", "must be positive"));
        }
        if !client_id.is_match(&self.client.client_id) {
            return Err(ConfigError::invalid(
                "client.client_id",
                "use 1-128 letters, digits, '.', '_' or '-'",
            ));
        }
        if self.client.client_name.trim().is_empty() {
            return Err(ConfigError::invalid("client.client_name", "must not be empty"));
        }

        let reconnect = &self.reconnect;
        if reconnect.base_delay_ms == 0 {
            return Err(ConfigError::invalid("reconnect.base_delay_ms", "must be positive"));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(ConfigError::invalid(
                "reconnect.max_delay_ms",
                "must not be smaller than base_delay_ms",
            ));
        }
        if !reconnect.factor.is_finite() || reconnect.factor < 1.0 {
            return Err(ConfigError::invalid("reconnect.factor", "must be at least 1.0"));
        }
        if self.heartbeat.enabled && self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::invalid(
                "heartbeat.interval_secs",
                "must be at least 1 when heartbeats are enabled",
            ));
        }
        if self.recovery.history_limit == 0 {
            return Err(ConfigError::invalid("recovery.history_limit", "must be positive"));
        }
        if self.recovery.reachability_poll_secs == 0 {
            return Err(ConfigError::invalid(
                "recovery.reachability_poll_secs",
                "must be at least 1",
            ));
        }

        let snapshots = &self.snapshots;
        if !(0.0..=1.0).contains(&snapshots.compatibility_threshold) {
            return Err(ConfigError::invalid(
                "snapshots.compatibility_threshold",
                "must be between 0.0 and 1.0",
            ));
        }
        if snapshots.max_history == 0 {
            return Err(ConfigError::invalid("snapshots.max_history", "must be positive"));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.server.host.clone(), self.server.port)
            .with_path(self.server.path.clone())
            .with_query(self.server.query.clone())
    }

    pub fn reachability_interval(&self) -> Duration {
        Duration::from_secs(self.recovery.reachability_poll_secs)
    }

    /// Build client options from this configuration
    pub fn to_options(&self) -> ClientOptions {
        let connect_timeout = Duration::from_secs(self.server.connect_timeout_secs);
        ClientOptions {
            endpoint: self.endpoint(),
            client_id: self.client.client_id.clone(),
            client_name: self.client.client_name.clone(),
            headers: self.client.headers.clone(),
            connect_timeout,
            reconnect: ReconnectPolicy {
                auto_reconnect: self.reconnect.auto_reconnect,
                max_attempts: self.reconnect.max_attempts,
                backoff: BackoffPolicy::new(
                    Duration::from_millis(self.reconnect.base_delay_ms),
                    Duration::from_millis(self.reconnect.max_delay_ms),
                    self.reconnect.factor,
                ),
            },
            heartbeat: HeartbeatConfig {
                enabled: self.heartbeat.enabled,
                interval: Duration::from_secs(self.heartbeat.interval_secs),
            },
            auto_recovery: self.recovery.auto_recovery,
            error_history_limit: self.recovery.history_limit,
            snapshots: SnapshotConfig {
                enabled: self.snapshots.enabled,
                persistence_enabled: self.snapshots.persistence_enabled,
                cross_artifact_enabled: self.snapshots.cross_artifact_enabled,
                compatibility_threshold: self.snapshots.compatibility_threshold,
                max_history: self.snapshots.max_history,
                max_age_days: self.snapshots.max_age_days,
                directory: self.snapshots.directory.clone(),
            },
            wire: WireConfig::with_max_message_size(self.server.max_message_size),
        }
    }
}
