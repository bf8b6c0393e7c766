//! Daemon configuration
//!
//! Loaded from a TOML file; every field has a default so an empty (or
//! missing) file yields a working configuration.
//!
//! ```toml
//! log_level = "debug"
//!
//! [registry]
//! grace_period_secs = 300
//!
//! [keepalive]
//! threshold = 3
//! default_target = "1.1.1.1"
//!
//! [assignments]
//! "aa:bb:cc:dd:ee:ff" = "work"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Registry / eviction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// How long a stopped tunnel with no devices is kept around.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Period of the eviction sweep.
    #[serde(default = "default_evict_interval")]
    pub evict_interval_secs: u64,
}

fn default_grace_period() -> u64 {
    300
}

fn default_evict_interval() -> u64 {
    60
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
            evict_interval_secs: default_evict_interval(),
        }
    }
}

impl RegistryConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn evict_interval(&self) -> Duration {
        Duration::from_secs(self.evict_interval_secs)
    }
}

/// Daemon-wide keep-alive defaults; profiles may override target, interval
/// and threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveDefaults {
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    /// Consecutive unanswered probes before the tunnel is declared dead.
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    #[serde(default = "default_target")]
    pub default_target: String,
    #[serde(default = "default_ping_command")]
    pub ping_command: String,
}

fn default_probe_interval() -> u64 {
    10
}

fn default_threshold() -> u32 {
    3
}

fn default_target() -> String {
    "1.1.1.1".to_string()
}

fn default_ping_command() -> String {
    "ping".to_string()
}

impl Default for KeepAliveDefaults {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            threshold: default_threshold(),
            default_target: default_target(),
            ping_command: default_ping_command(),
        }
    }
}

/// VPN client launch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_command")]
    pub command: String,
    /// Invoked as `<kill_command> <pid>`.
    #[serde(default = "default_kill_command")]
    pub kill_command: String,
    #[serde(default = "default_profile_dir")]
    pub profile_dir: PathBuf,
    /// Credentials, logs and runtime state.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
}

fn default_client_command() -> String {
    "openvpn".to_string()
}

fn default_kill_command() -> String {
    "kill".to_string()
}

fn default_profile_dir() -> PathBuf {
    PathBuf::from("/etc/vpnmux/profiles")
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/run/vpnmux")
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command: default_client_command(),
            kill_command: default_kill_command(),
            profile_dir: default_profile_dir(),
            runtime_dir: default_runtime_dir(),
        }
    }
}

/// Status relay socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_listen")]
    pub listen: SocketAddr,
}

fn default_relay_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7505))
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_relay_listen(),
        }
    }
}

/// Scripts run on routing, proxy and DNS changes (absent hooks only log).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub route_up: Option<String>,
    #[serde(default)]
    pub route_down: Option<String>,
    #[serde(default)]
    pub acl: Option<String>,
    #[serde(default)]
    pub dns: Option<String>,
}

/// Full daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub keepalive: KeepAliveDefaults,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Static device -> profile routing applied at startup.
    #[serde(default)]
    pub assignments: BTreeMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            registry: RegistryConfig::default(),
            keepalive: KeepAliveDefaults::default(),
            client: ClientConfig::default(),
            relay: RelayConfig::default(),
            hooks: HooksConfig::default(),
            assignments: BTreeMap::new(),
        }
    }
}

impl DaemonConfig {
    /// Load and validate a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML content.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive.threshold == 0 {
            return Err(ConfigError::Invalid(
                "keepalive.threshold must be at least 1".into(),
            ));
        }
        if self.keepalive.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "keepalive.interval_secs must be at least 1".into(),
            ));
        }
        if self.registry.evict_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "registry.evict_interval_secs must be at least 1".into(),
            ));
        }
        if self.client.command.trim().is_empty() || self.client.kill_command.trim().is_empty() {
            return Err(ConfigError::Invalid("client commands must not be empty".into()));
        }
        Ok(())
    }

    /// Settings shared by every supervisor.
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            client_command: self.client.command.clone(),
            kill_command: self.client.kill_command.clone(),
            keepalive: self.keepalive.clone(),
        }
    }
}

/// Per-supervisor launch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub client_command: String,
    pub kill_command: String,
    pub keepalive: KeepAliveDefaults,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        DaemonConfig::default().supervisor_settings()
    }
}
