//! External collaborators
//!
//! The supervisor notifies routing, proxy ACL and DNS components on tunnel
//! transitions but owns none of them. Each concern is a trait so the daemon
//! can plug in real implementations and tests can record calls.

use crate::bus::PubSubTransport;
use crate::config::SupervisorSettings;
use crate::process::{ProcessError, ProcessRunner};
use crate::profile::{DeviceId, ProfileError, ProfileId, VpnProfile};
use crate::runtime::{TunnelLink, TunnelRuntimeState};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Routing-table slot reserved for one supervisor.
///
/// Not `Clone`: the supervisor that acquired it is its only owner, and
/// releasing it consumes the handle.
#[derive(Debug, PartialEq, Eq)]
pub struct RouteHandle {
    mark: u32,
}

impl RouteHandle {
    pub fn new(mark: u32) -> Self {
        Self { mark }
    }

    /// Routing mark / table number of the slot.
    pub fn mark(&self) -> u32 {
        self.mark
    }
}

/// Collaborator failures (logged by the supervisor, never fatal to it).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("No free route slot")]
    RoutesExhausted,

    #[error("Hook failed: {0}")]
    Hook(String),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
}

/// Kernel routing / firewall controller.
pub trait Routing: Send + Sync {
    fn acquire_route(&self) -> Result<RouteHandle, CollaboratorError>;

    fn release_route(&self, handle: RouteHandle);

    /// Tunnel is usable: steer the route slot through it.
    fn apply_route(&self, handle: &RouteHandle, link: &TunnelLink) -> Result<(), CollaboratorError>;

    /// Tunnel gone: drop its routes (and the trusted-peer exception).
    fn clear_route(
        &self,
        handle: &RouteHandle,
        trusted_ip: Option<IpAddr>,
    ) -> Result<(), CollaboratorError>;

    /// The set of devices routed through some tunnel changed.
    fn device_routing_changed(&self);
}

/// Reverse-proxy access list.
pub trait ProxyAcl: Send + Sync {
    fn set_acl_devices(&self, tunnel: &ProfileId, devices: &[DeviceId]) -> Result<(), CollaboratorError>;
}

/// DNS server control.
pub trait DnsControl: Send + Sync {
    fn use_tunnel_resolver(&self, device: &DeviceId, tunnel: &ProfileId) -> Result<(), CollaboratorError>;

    fn use_default_resolver(&self, device: &DeviceId) -> Result<(), CollaboratorError>;

    fn add_tunnel_name_servers(
        &self,
        tunnel: &ProfileId,
        servers: &[IpAddr],
        local_ip: IpAddr,
    ) -> Result<(), CollaboratorError>;

    fn remove_tunnel_name_servers(&self, tunnel: &ProfileId) -> Result<(), CollaboratorError>;
}

/// Profile and runtime-state persistence.
pub trait ProfileStore: Send + Sync {
    fn get(&self, id: &ProfileId) -> Result<VpnProfile, ProfileError>;

    fn list(&self) -> Result<Vec<ProfileId>, ProfileError>;

    fn save_state(&self, state: &TunnelRuntimeState) -> Result<(), ProfileError>;

    fn load_state(&self, id: &ProfileId) -> Result<Option<TunnelRuntimeState>, ProfileError>;

    fn remove_state(&self, id: &ProfileId) -> Result<(), ProfileError>;

    /// Write the transient credential file, if the profile has credentials.
    fn write_credentials(&self, profile: &VpnProfile) -> Result<Option<PathBuf>, ProfileError>;

    fn remove_credentials(&self, id: &ProfileId) -> Result<(), ProfileError>;

    /// Empty the client instance log, returning its path.
    fn truncate_log(&self, id: &ProfileId) -> Result<PathBuf, ProfileError>;

    /// Flag a profile for deletion once its tunnel is gone.
    fn mark_deleted(&self, id: &ProfileId) -> Result<(), ProfileError>;

    fn is_marked_deleted(&self, id: &ProfileId) -> bool;

    /// Remove the profile and every on-disk artifact belonging to it.
    fn delete_profile(&self, id: &ProfileId) -> Result<(), ProfileError>;
}

/// Everything a supervisor talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn ProcessRunner>,
    pub transport: Arc<dyn PubSubTransport>,
    pub routing: Arc<dyn Routing>,
    pub proxy: Arc<dyn ProxyAcl>,
    pub dns: Arc<dyn DnsControl>,
    pub store: Arc<dyn ProfileStore>,
    pub settings: SupervisorSettings,
}
