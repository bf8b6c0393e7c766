//! VPN profiles
//!
//! A profile describes one VPN client configuration. Profiles are owned by
//! the profile store; supervisors keep a cached copy and reload it before
//! starting the client and before adding devices.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Profile identifier (also names the tunnel and its status channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Safe to embed in file names and channel names.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 64
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProfileId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Device identifier (usually the device MAC address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Username/password pair handed to the client through a transient file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-profile keep-alive probing settings.
///
/// Unset fields fall back to the daemon-wide keep-alive defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Host to probe through the tunnel.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Consecutive unanswered probes before the tunnel is declared dead.
    #[serde(default)]
    pub threshold: Option<u32>,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            target: None,
            interval_secs: None,
            threshold: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// VPN client profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnProfile {
    pub id: ProfileId,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Client configuration file passed to the VPN binary.
    pub config_path: PathBuf,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Route lookups of attached devices through the tunnel's name servers.
    #[serde(default = "default_true")]
    pub use_tunnel_dns: bool,
    #[serde(default)]
    pub keepalive: KeepAliveSettings,
    /// Extra client arguments appended verbatim.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl VpnProfile {
    /// Create a profile with defaults for everything but the config file.
    pub fn new(id: impl Into<ProfileId>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            config_path: config_path.into(),
            credentials: None,
            use_tunnel_dns: true,
            keepalive: KeepAliveSettings::default(),
            extra_args: Vec::new(),
        }
    }

    /// Build the client command line for one launch.
    pub fn client_args(&self, launch: &LaunchContext<'_>) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            self.config_path.display().to_string(),
            "--log".to_string(),
            launch.log_path.display().to_string(),
            "--setenv".to_string(),
            "VPNMUX_CHANNEL".to_string(),
            launch.channel.to_string(),
            "--setenv".to_string(),
            "VPNMUX_ROUTE_MARK".to_string(),
            launch.route_mark.to_string(),
        ];
        if let Some(path) = launch.credentials_path {
            args.push("--auth-user-pass".to_string());
            args.push(path.display().to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Per-launch values that end up on the client command line.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    pub channel: &'a str,
    pub log_path: &'a Path,
    pub credentials_path: Option<&'a Path>,
    pub route_mark: u32,
}

/// Profile store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("Profile not found: {0}")]
    NotFound(ProfileId),

    #[error("Invalid profile id: {0:?}")]
    InvalidId(String),

    #[error("Profile {0} is disabled")]
    Disabled(ProfileId),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}
