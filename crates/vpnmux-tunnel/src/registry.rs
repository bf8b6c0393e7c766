//! Tunnel registry
//!
//! Maps profile ids to supervisors, creating them on first use and evicting
//! them once they have sat stopped with no devices for the grace period.
//! A device is attached to at most one tunnel at a time: routing it
//! somewhere else detaches it from its current tunnel first.

use crate::collaborators::Collaborators;
use crate::config::RegistryConfig;
use crate::profile::{DeviceId, ProfileError, ProfileId, VpnProfile};
use crate::runtime::TunnelStatus;
use crate::state::TunnelState;
use crate::supervisor::{SupervisorError, TunnelSupervisor};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid profile id: {0}")]
    InvalidId(ProfileId),

    #[error("Profile {0} is being deleted")]
    Deleted(ProfileId),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Result of a profile deletion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Profile and artifacts removed.
    Deleted,
    /// Tunnel still live; removal happens when it is evicted.
    Deferred,
}

/// Profile id -> supervisor map.
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<ProfileId, TunnelSupervisor>>,
    /// Serializes device moves and eviction against each other.
    moves: Mutex<()>,
    ctx: Collaborators,
    config: RegistryConfig,
}

impl TunnelRegistry {
    pub fn new(ctx: Collaborators, config: RegistryConfig) -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            moves: Mutex::new(()),
            ctx,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn tunnels(&self) -> MutexGuard<'_, HashMap<ProfileId, TunnelSupervisor>> {
        self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_moves(&self) -> MutexGuard<'_, ()> {
        self.moves.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route `device` through the tunnel of `profile`.
    pub fn route(&self, device: &DeviceId, profile: &ProfileId) -> Result<(), RegistryError> {
        if !profile.is_valid() {
            return Err(RegistryError::InvalidId(profile.clone()));
        }

        // Deletion marks are only read under the moves lock.
        let _moves = self.lock_moves();
        if self.ctx.store.is_marked_deleted(profile) {
            return Err(RegistryError::Deleted(profile.clone()));
        }
        if let Some(current) = self.tunnel_of(device) {
            if current.id() == profile {
                debug!("Device {} already on tunnel {}", device, profile);
                return Ok(());
            }
            info!("Moving device {} from {} to {}", device, current.id(), profile);
            current.stop_devices(vec![device.clone()]).wait()?;
        }

        let fresh = self.ctx.store.get(profile)?;
        if !fresh.enabled {
            return Err(ProfileError::Disabled(profile.clone()).into());
        }
        let supervisor = self.get_or_create(fresh)?;
        supervisor.add_devices(vec![device.clone()])?.wait()?;
        Ok(())
    }

    /// Detach `device` from whichever tunnel holds it; false if none did.
    pub fn unroute(&self, device: &DeviceId) -> Result<bool, RegistryError> {
        let _moves = self.lock_moves();
        match self.tunnel_of(device) {
            Some(supervisor) => {
                info!("Unrouting device {} from {}", device, supervisor.id());
                supervisor.stop_devices(vec![device.clone()]).wait()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The tunnel currently holding `device`.
    pub fn tunnel_of(&self, device: &DeviceId) -> Option<TunnelSupervisor> {
        self.tunnels()
            .values()
            .find(|s| s.status().has_device(device))
            .cloned()
    }

    pub fn supervisor(&self, id: &ProfileId) -> Option<TunnelSupervisor> {
        self.tunnels().get(id).cloned()
    }

    /// Return the supervisor for `profile`, creating it if absent.
    pub fn get_or_create(&self, profile: VpnProfile) -> Result<TunnelSupervisor, RegistryError> {
        let mut tunnels = self.tunnels();
        if let Some(existing) = tunnels.get(&profile.id) {
            return Ok(existing.clone());
        }
        let id = profile.id.clone();
        let supervisor = TunnelSupervisor::new(profile, self.ctx.clone())?;
        tunnels.insert(id, supervisor.clone());
        Ok(supervisor)
    }

    /// Snapshots of every registered tunnel, ordered by id.
    pub fn statuses(&self) -> Vec<TunnelStatus> {
        let mut statuses: Vec<TunnelStatus> = self.tunnels().values().map(|s| s.status()).collect();
        statuses.sort_by(|a, b| a.profile_id.cmp(&b.profile_id));
        statuses
    }

    pub fn len(&self) -> usize {
        self.tunnels().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels().is_empty()
    }

    /// Evict tunnels idle for at least the grace period.
    pub fn evict(&self) -> Vec<ProfileId> {
        self.evict_at(Instant::now())
    }

    /// Eviction pass as of `now`.
    pub fn evict_at(&self, now: Instant) -> Vec<ProfileId> {
        let _moves = self.lock_moves();
        let mut tunnels = self.tunnels();
        let grace = self.config.grace_period();

        // Idle, empty and past the grace period
        let candidates: Vec<TunnelSupervisor> = tunnels
            .values()
            .filter(|s| {
                let status = s.status();
                if status.has_devices() || !status.state.is_idle() {
                    return false;
                }
                let stopped_at = status.stopped_at.unwrap_or(now);
                now.saturating_duration_since(stopped_at) >= grace
            })
            .cloned()
            .collect();

        let mut evicted = Vec::new();
        for supervisor in candidates {
            let id = supervisor.id().clone();
            // Re-check: a task may have run since the snapshot
            if !supervisor.status().state.is_idle() {
                continue;
            }
            if let Err(e) = supervisor.close().wait() {
                if supervisor.status().state != TunnelState::Closed {
                    warn!("Tunnel {}: not evicted: {}", id, e);
                    continue;
                }
            }

            // Drop the handle, stop its worker, then clean up files
            tunnels.remove(&id);
            supervisor.shutdown_queue();
            self.discard(&id);
            info!("Tunnel {}: evicted", id);
            evicted.push(id);
        }
        evicted
    }

    /// Drop persisted state, and the profile itself if it was marked deleted.
    fn discard(&self, id: &ProfileId) {
        if let Err(e) = self.ctx.store.remove_state(id) {
            warn!("Tunnel {}: failed to remove runtime state: {}", id, e);
        }
        if self.ctx.store.is_marked_deleted(id) {
            match self.ctx.store.delete_profile(id) {
                Ok(()) => info!("Profile {} deleted", id),
                Err(e) => warn!("Profile {}: deferred deletion failed: {}", id, e),
            }
        }
    }

    /// Delete a profile, deferring while its tunnel is live.
    pub fn delete_profile(&self, id: &ProfileId) -> Result<DeleteOutcome, RegistryError> {
        let _moves = self.lock_moves();
        let Some(supervisor) = self.supervisor(id) else {
            self.ctx.store.delete_profile(id)?;
            info!("Profile {} deleted", id);
            return Ok(DeleteOutcome::Deleted);
        };

        self.ctx.store.mark_deleted(id)?;
        let status = supervisor.status();
        if status.state.is_idle() && !status.has_devices() {
            if supervisor.close().wait().is_ok() || supervisor.status().state == TunnelState::Closed {
                self.tunnels().remove(id);
                supervisor.shutdown_queue();
                self.discard(id);
                return Ok(DeleteOutcome::Deleted);
            }
        }

        info!("Profile {} marked for deletion; tunnel still live", id);
        if status.has_devices() {
            // Detaching the last device stops the client.
            let _ = supervisor.stop_devices(status.devices);
        }
        Ok(DeleteOutcome::Deferred)
    }

    /// Apply a changed profile: restart a live tunnel, or detach everything
    /// if the profile was disabled.
    pub fn profile_changed(&self, id: &ProfileId) -> Result<(), RegistryError> {
        let _moves = self.lock_moves();
        let Some(supervisor) = self.supervisor(id) else {
            return Ok(());
        };
        let profile = self.ctx.store.get(id)?;
        let status = supervisor.status();
        if !profile.enabled {
            info!("Profile {} disabled; detaching {} devices", id, status.devices.len());
            supervisor.stop_devices(status.devices).wait()?;
        } else if status.active() {
            info!("Profile {} changed; restarting tunnel", id);
            supervisor.restart().wait()?;
        }
        Ok(())
    }

    /// Stop every tunnel, wait up to `timeout` for them to settle, then stop
    /// the supervisor workers.
    pub fn shutdown(&self, timeout: Duration) {
        let _moves = self.lock_moves();
        let supervisors: Vec<TunnelSupervisor> = self.tunnels().drain().map(|(_, s)| s).collect();
        info!("Shutting down {} tunnels", supervisors.len());

        for supervisor in &supervisors {
            let devices = supervisor.status().devices;
            let _ = supervisor.stop_devices(devices);
            let _ = supervisor.stop();
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline
            && supervisors.iter().any(|s| !s.status().state.is_idle())
        {
            thread::sleep(Duration::from_millis(20));
        }

        for supervisor in supervisors {
            let status = supervisor.status();
            if !status.state.is_idle() {
                warn!("Tunnel {} still {} at shutdown", status.profile_id, status.state);
            }
            supervisor.shutdown_queue();
        }
    }
}
