//! Runtime state of a tunnel
//!
//! [`TunnelRuntimeState`] is the persisted projection saved through the
//! profile store after every change. [`TunnelStatus`] is the in-memory
//! snapshot published by the supervisor after each queued task.

use crate::profile::{DeviceId, ProfileId};
use crate::state::TunnelState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Interface parameters reported by the client when the tunnel comes up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelLink {
    /// Virtual interface name (e.g. `tun0`).
    pub interface: String,
    /// Gateway of the tunnel network.
    pub net_gateway: IpAddr,
    /// Peer (VPN server side) gateway.
    pub vpn_gateway: IpAddr,
    /// Local endpoint address on the tunnel.
    pub local_ip: IpAddr,
    /// Real address of the VPN server, routed outside the tunnel.
    pub trusted_ip: IpAddr,
    /// Name servers pushed by the server.
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
}

/// Persisted projection of a supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRuntimeState {
    pub profile_id: ProfileId,
    pub devices: BTreeSet<DeviceId>,
    /// Routing mark of the route slot owned by the supervisor.
    pub route: Option<u32>,
    pub link: Option<TunnelLink>,
    pub state: TunnelState,
    /// Set while a requested restart is being carried out.
    #[serde(default)]
    pub pending_restart: bool,
    #[serde(default)]
    pub restarts: u32,
    /// Unix seconds of the last change.
    #[serde(default)]
    pub updated_at: u64,
}

impl TunnelRuntimeState {
    pub fn new(profile_id: ProfileId, route: Option<u32>) -> Self {
        Self {
            profile_id,
            devices: BTreeSet::new(),
            route,
            link: None,
            state: TunnelState::Stopped,
            pending_restart: false,
            restarts: 0,
            updated_at: unix_now(),
        }
    }

    /// Forget everything learned from the previous client session.
    pub fn clear_link(&mut self) {
        self.link = None;
    }

    pub fn interface(&self) -> Option<&str> {
        self.link.as_ref().map(|l| l.interface.as_str())
    }

    pub fn touch(&mut self) {
        self.updated_at = unix_now();
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Point-in-time view of a supervisor.
///
/// Lags the supervisor by at most the task currently running on its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub profile_id: ProfileId,
    pub state: TunnelState,
    pub devices: Vec<DeviceId>,
    pub link: Option<TunnelLink>,
    /// Recent `error` reports from the status channel, oldest first.
    pub errors: Vec<String>,
    /// Exit code of the last client process.
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    pub restarts: u32,
    /// When the tunnel last entered `Stopped` (creation time if never started).
    pub stopped_at: Option<Instant>,
    /// The client announced a graceful shutdown.
    pub shutting_down: bool,
}

impl TunnelStatus {
    pub fn new(profile_id: ProfileId) -> Self {
        Self {
            profile_id,
            state: TunnelState::Stopped,
            devices: Vec::new(),
            link: None,
            errors: Vec::new(),
            exit_code: None,
            pid: None,
            restarts: 0,
            stopped_at: Some(Instant::now()),
            shutting_down: false,
        }
    }

    /// A client process exists or is being handled.
    pub fn active(&self) -> bool {
        self.state.is_active()
    }

    pub fn up(&self) -> bool {
        self.state.is_up()
    }

    pub fn has_devices(&self) -> bool {
        !self.devices.is_empty()
    }

    pub fn has_device(&self, device: &DeviceId) -> bool {
        self.devices.contains(device)
    }

    /// Format for logs and status output.
    pub fn format(&self) -> String {
        format!(
            "{}: {} | devices: {} | iface: {} | restarts: {} | exit: {}",
            self.profile_id,
            self.state,
            self.devices.len(),
            self.link.as_ref().map(|l| l.interface.as_str()).unwrap_or("-"),
            self.restarts,
            self.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> TunnelLink {
        TunnelLink {
            interface: "tun0".into(),
            net_gateway: "10.8.0.1".parse().unwrap(),
            vpn_gateway: "10.8.0.5".parse().unwrap(),
            local_ip: "10.8.0.6".parse().unwrap(),
            trusted_ip: "203.0.113.7".parse().unwrap(),
            dns_servers: vec!["10.8.0.1".parse().unwrap()],
        }
    }

    #[test]
    fn test_runtime_state_json_shape() {
        let mut state = TunnelRuntimeState::new(ProfileId::new("work"), Some(4097));
        state.devices.insert(DeviceId::new("aa:bb:cc:dd:ee:ff"));
        state.link = Some(link());
        state.state = TunnelState::Up;

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["profile_id"], "work");
        assert_eq!(json["state"], "up");
        assert_eq!(json["route"], 4097);
        assert_eq!(json["link"]["interface"], "tun0");
        assert_eq!(json["devices"][0], "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_clear_link() {
        let mut state = TunnelRuntimeState::new(ProfileId::new("work"), None);
        state.link = Some(link());
        assert_eq!(state.interface(), Some("tun0"));

        state.clear_link();
        assert!(state.interface().is_none());
    }

    #[test]
    fn test_status_format() {
        let mut status = TunnelStatus::new(ProfileId::new("work"));
        status.link = Some(link());
        status.exit_code = Some(1);

        let line = status.format();
        assert!(line.starts_with("work: stopped"));
        assert!(line.contains("iface: tun0"));
        assert!(line.contains("exit: 1"));
        assert!(!status.active());
    }
}
