//! Tunnel supervisor
//!
//! One supervisor per VPN profile. It owns the client process, the status
//! channel listener and (while the tunnel is up) a keep-alive monitor, and
//! multiplexes any number of devices onto the tunnel.
//!
//! ```text
//!   TunnelSupervisor (handle, Clone)
//!        │ submit("add_devices" | "stop" | ...)
//!        ▼
//!   TaskQueue ──► SupervisorCore ── runner.start ──► client process
//!        ▲            │                                  │
//!        │            ├── StatusChannelListener ◄── status lines
//!        │            └── KeepAliveMonitor ◄── probe output
//!        │
//!        └── "process_exit" / "status_*" / "keepalive_stall" tasks
//! ```
//!
//! All state lives in [`SupervisorCore`] on the queue worker; the handle
//! only submits tasks and reads the [`TunnelStatus`] snapshot published
//! after each one.

use crate::collaborators::{CollaboratorError, Collaborators, RouteHandle};
use crate::keepalive::{KeepAliveConfig, KeepAliveMonitor};
use crate::process::{ProcessError, SpawnedProcess};
use crate::profile::{DeviceId, LaunchContext, ProfileError, ProfileId, VpnProfile};
use crate::queue::{Completion, QueueState, TaskQueue, TaskSender};
use crate::runtime::{TunnelLink, TunnelRuntimeState, TunnelStatus};
use crate::state::{TransitionError, TunnelState};
use crate::status_channel::{ChannelError, StatusChannelListener, StatusEvent, StatusListener};
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Status-channel `error` reports kept per tunnel.
const MAX_ERRORS: usize = 16;

/// Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Status channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Tunnel {0} is closed")]
    Closed(ProfileId),

    #[error("Tunnel {0} still has devices")]
    HasDevices(ProfileId),

    #[error("Task queue closed before {0} ran")]
    QueueClosed(String),

    #[error("Task {task} panicked: {message}")]
    TaskPanicked { task: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// The structured transition error, if this is one.
    pub fn as_transition(&self) -> Option<TransitionError> {
        match self {
            SupervisorError::Transition(e) => Some(*e),
            _ => None,
        }
    }
}

/// Forwards status-channel events into the supervisor's queue.
struct SupervisorEvents {
    tasks: TaskSender<SupervisorCore>,
}

impl StatusListener for SupervisorEvents {
    fn on_status(&self, event: StatusEvent) {
        let name = format!("status_{}", event.keyword());
        let _ = self.tasks.submit(&name, move |core| core.on_status(event));
    }
}

/// Supervisor state, owned by the queue worker.
struct SupervisorCore {
    profile: VpnProfile,
    runtime: TunnelRuntimeState,
    route: Option<RouteHandle>,
    listener: StatusChannelListener,
    keepalive: Option<KeepAliveMonitor>,
    /// Bumped on every keep-alive start; stale stall reports are ignored.
    keepalive_session: u64,
    pid: Option<u32>,
    restart_requested: bool,
    errors: VecDeque<String>,
    exit_code: Option<i32>,
    stopped_at: Instant,
    shutting_down: bool,
    ctx: Collaborators,
    tasks: TaskSender<SupervisorCore>,
    status: Arc<RwLock<TunnelStatus>>,
}

impl QueueState for SupervisorCore {
    fn label(&self) -> String {
        format!("Tunnel {}", self.runtime.profile_id)
    }

    fn after_task(&mut self) {
        let snapshot = self.snapshot();
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

impl SupervisorCore {
    fn id(&self) -> &ProfileId {
        &self.runtime.profile_id
    }

    fn snapshot(&self) -> TunnelStatus {
        TunnelStatus {
            profile_id: self.runtime.profile_id.clone(),
            state: self.runtime.state,
            devices: self.runtime.devices.iter().cloned().collect(),
            link: self.runtime.link.clone(),
            errors: self.errors.iter().cloned().collect(),
            exit_code: self.exit_code,
            pid: self.pid,
            restarts: self.runtime.restarts,
            stopped_at: Some(self.stopped_at),
            shutting_down: self.shutting_down,
        }
    }

    /// Validated state change; persists the runtime state.
    fn transition(&mut self, target: TunnelState) -> Result<TunnelState, TransitionError> {
        let from = self.runtime.state;
        self.runtime.state = from.transition(target)?;
        info!("Tunnel {}: {} -> {}", self.id(), from, target);
        self.persist();
        Ok(from)
    }

    fn persist(&mut self) {
        self.runtime.touch();
        if let Err(e) = self.ctx.store.save_state(&self.runtime) {
            warn!("Tunnel {}: failed to save runtime state: {}", self.id(), e);
        }
    }

    // ---- operations -------------------------------------------------------

    fn start(&mut self) -> Result<(), SupervisorError> {
        self.transition(TunnelState::Starting)?;
        // Nothing from the previous session carries over.
        self.exit_code = None;
        self.shutting_down = false;
        self.errors.clear();

        match self.launch() {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Tunnel {}: failed to start client: {}", self.id(), e);
                // Never retry a failed launch from the exit path.
                self.restart_requested = false;
                if let Err(exit_err) = self.handle_exit(None) {
                    error!("Tunnel {}: cleanup after failed start: {}", self.id(), exit_err);
                }
                Err(e)
            }
        }
    }

    fn launch(&mut self) -> Result<(), SupervisorError> {
        // Credentials and status channel must exist before the client does
        let credentials = self.ctx.store.write_credentials(&self.profile)?;
        if !self.listener.is_started() {
            self.listener.start()?;
        }
        let log_path = self.ctx.store.truncate_log(self.id())?;

        let args = self.profile.client_args(&LaunchContext {
            channel: self.listener.channel(),
            log_path: &log_path,
            credentials_path: credentials.as_deref(),
            route_mark: self.route.as_ref().map_or(0, RouteHandle::mark),
        });
        let process = self.ctx.runner.start(&self.ctx.settings.client_command, &args)?;
        let pid = process.pid;
        self.pid = Some(pid);
        info!("Tunnel {}: client started (pid {})", self.id(), pid);

        self.transition(TunnelState::ProcessRunning)?;
        self.watch_exit(process)
    }

    /// Wait for the client on a background thread; the exit re-enters the
    /// queue as a task.
    fn watch_exit(&mut self, mut process: SpawnedProcess) -> Result<(), SupervisorError> {
        let pid = process.pid;
        // The client logs to its own file; stdout is never read.
        process.discard_output();
        let tasks = self.tasks.clone();
        let spawned = thread::Builder::new()
            .name(format!("tunnel-exit-{pid}"))
            .spawn(move || {
                let result = process.wait();
                let _ = tasks.submit("process_exit", move |core| core.on_process_exit(pid, result));
            });

        if let Err(e) = spawned {
            let _ = self
                .ctx
                .runner
                .run(&self.ctx.settings.kill_command, &[pid.to_string()]);
            return Err(e.into());
        }
        Ok(())
    }

    fn on_process_exit(
        &mut self,
        pid: u32,
        result: Result<Option<i32>, ProcessError>,
    ) -> Result<(), SupervisorError> {
        if self.pid != Some(pid) {
            debug!("Tunnel {}: ignoring exit of stale pid {}", self.id(), pid);
            return Ok(());
        }
        let code = match result {
            Ok(code) => code,
            Err(e) => {
                warn!("Tunnel {}: lost track of client {}: {}", self.id(), pid, e);
                None
            }
        };
        info!("Tunnel {}: client {} exited ({:?})", self.id(), pid, code);
        self.handle_exit(code)
    }

    /// Process-exit path: cleanup, then either restart or settle in `Stopped`.
    fn handle_exit(&mut self, code: Option<i32>) -> Result<(), SupervisorError> {
        self.pid = None;
        self.exit_code = code;
        if self.runtime.state != TunnelState::ProcessDead {
            self.transition(TunnelState::ProcessDead)?;
        }

        // Undo everything the session set up
        self.stop_keepalive();
        self.teardown_link();
        self.stop_listener();
        if let Err(e) = self.ctx.store.remove_credentials(self.id()) {
            warn!("Tunnel {}: failed to remove credentials: {}", self.id(), e);
        }

        // Restart with the same devices if one was requested
        if std::mem::take(&mut self.restart_requested) && self.prepare_restart() {
            self.runtime.pending_restart = true;
            self.runtime.restarts += 1;
            self.runtime.clear_link();
            self.transition(TunnelState::Stopped)?;
            info!("Tunnel {}: restarting (#{})", self.id(), self.runtime.restarts);
            return self.start();
        }

        // Otherwise release the devices
        for device in &self.runtime.devices {
            if let Err(e) = self.ctx.dns.use_default_resolver(device) {
                warn!("Tunnel {}: failed to reset resolver of {}: {}", self.runtime.profile_id, device, e);
            }
        }
        self.runtime.devices.clear();
        self.runtime.pending_restart = false;
        self.runtime.clear_link();
        self.refresh_device_routing();

        self.transition(TunnelState::Stopped)?;
        self.stopped_at = Instant::now();
        Ok(())
    }

    /// Reload the profile for a restart; false if the tunnel should stay down.
    fn prepare_restart(&mut self) -> bool {
        if self.runtime.devices.is_empty() {
            return false;
        }
        match self.ctx.store.get(self.id()) {
            Ok(profile) if profile.enabled => {
                self.profile = profile;
                true
            }
            Ok(_) => {
                info!("Tunnel {}: profile disabled, not restarting", self.id());
                false
            }
            Err(e) => {
                warn!("Tunnel {}: restarting with cached profile: {}", self.id(), e);
                true
            }
        }
    }

    fn stop(&mut self) -> Result<(), SupervisorError> {
        let state = self.runtime.state;
        if matches!(
            state,
            TunnelState::Stopped | TunnelState::Closed | TunnelState::Killing | TunnelState::ProcessDead
        ) {
            debug!("Tunnel {}: stop ignored in {}", self.id(), state);
            return Ok(());
        }
        state.transition(TunnelState::Killing)?;

        let Some(pid) = self.pid else {
            self.transition(TunnelState::Killing)?;
            return self.handle_exit(None);
        };

        info!("Tunnel {}: terminating client {}", self.id(), pid);
        match self
            .ctx
            .runner
            .run(&self.ctx.settings.kill_command, &[pid.to_string()])
        {
            Ok(()) => {
                // The exit watcher completes the stop.
                self.transition(TunnelState::Killing)?;
                Ok(())
            }
            Err(e @ ProcessError::Interrupted { .. }) => {
                warn!("Tunnel {}: termination interrupted, staying {}", self.id(), state);
                Err(e.into())
            }
            Err(e) => {
                error!("Tunnel {}: termination failed, forcing stop: {}", self.id(), e);
                self.transition(TunnelState::Killing)?;
                self.handle_exit(None)?;
                Err(e.into())
            }
        }
    }

    fn restart(&mut self) -> Result<(), SupervisorError> {
        if self.runtime.state.is_idle() {
            debug!("Tunnel {}: nothing to restart", self.id());
            return Ok(());
        }
        self.restart_requested = true;
        self.stop()
    }

    fn add_devices(&mut self, devices: Vec<DeviceId>) -> Result<(), SupervisorError> {
        if self.runtime.state == TunnelState::Closed {
            return Err(SupervisorError::Closed(self.id().clone()));
        }

        let mut added = false;
        for device in devices {
            if !self.runtime.devices.insert(device.clone()) {
                continue;
            }
            added = true;
            info!("Tunnel {}: device {} attached", self.id(), device);
            if self.profile.use_tunnel_dns {
                if let Err(e) = self.ctx.dns.use_tunnel_resolver(&device, self.id()) {
                    warn!("Tunnel {}: failed to route DNS of {}: {}", self.id(), device, e);
                }
            }
        }
        if added {
            self.persist();
        }

        let result = match self.runtime.state {
            TunnelState::Stopped if !self.runtime.devices.is_empty() => self.start(),
            // The exit already in flight picks the devices back up.
            TunnelState::Killing | TunnelState::ProcessDead if !self.runtime.devices.is_empty() => {
                self.restart_requested = true;
                Ok(())
            }
            _ => Ok(()),
        };
        self.refresh_device_routing();
        result
    }

    fn stop_devices(&mut self, devices: Vec<DeviceId>) -> Result<(), SupervisorError> {
        let mut removed = false;
        for device in &devices {
            if !self.runtime.devices.remove(device) {
                continue;
            }
            removed = true;
            info!("Tunnel {}: device {} detached", self.id(), device);
            if let Err(e) = self.ctx.dns.use_default_resolver(device) {
                warn!("Tunnel {}: failed to reset resolver of {}: {}", self.id(), device, e);
            }
        }
        if removed {
            self.persist();
        }
        self.refresh_device_routing();

        if self.runtime.devices.is_empty() {
            self.restart_requested = false;
            self.stop()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SupervisorError> {
        if !self.runtime.devices.is_empty() {
            return Err(SupervisorError::HasDevices(self.id().clone()));
        }
        self.transition(TunnelState::Closed)?;
        if let Some(route) = self.route.take() {
            debug!("Tunnel {}: releasing route {}", self.id(), route.mark());
            self.ctx.routing.release_route(route);
        }
        self.runtime.route = None;
        self.persist();
        Ok(())
    }

    // ---- status channel ---------------------------------------------------

    fn on_status(&mut self, event: StatusEvent) -> Result<(), SupervisorError> {
        match event {
            StatusEvent::Up(link) => self.on_up(link),
            StatusEvent::Down { reason } => self.on_down(reason),
            StatusEvent::Error { message } => {
                warn!("Tunnel {}: client reported error: {}", self.id(), message);
                if self.errors.len() == MAX_ERRORS {
                    self.errors.pop_front();
                }
                self.errors.push_back(message);
                Ok(())
            }
            StatusEvent::Pid(pid) => {
                match self.pid {
                    Some(known) if known == pid => debug!("Tunnel {}: pid {} confirmed", self.id(), pid),
                    known => warn!(
                        "Tunnel {}: client reported pid {} but supervising {:?}",
                        self.id(),
                        pid,
                        known
                    ),
                }
                Ok(())
            }
            StatusEvent::Shutdown => {
                info!("Tunnel {}: client shutting down", self.id());
                self.shutting_down = true;
                Ok(())
            }
        }
    }

    fn on_up(&mut self, link: TunnelLink) -> Result<(), SupervisorError> {
        self.transition(TunnelState::Up)?;
        info!(
            "Tunnel {}: up on {} (gw {}, peer {})",
            self.id(),
            link.interface,
            link.net_gateway,
            link.trusted_ip
        );
        self.runtime.pending_restart = false;
        self.runtime.link = Some(link.clone());
        self.persist();

        if let Some(route) = &self.route {
            if let Err(e) = self.ctx.routing.apply_route(route, &link) {
                warn!("Tunnel {}: failed to apply route: {}", self.runtime.profile_id, e);
            }
        }
        self.refresh_device_routing();
        if !link.dns_servers.is_empty() {
            if let Err(e) =
                self.ctx
                    .dns
                    .add_tunnel_name_servers(self.id(), &link.dns_servers, link.local_ip)
            {
                warn!("Tunnel {}: failed to configure name servers: {}", self.id(), e);
            }
        }

        self.stop_keepalive();
        if self.profile.keepalive.enabled {
            self.start_keepalive(&link.interface);
        }
        Ok(())
    }

    fn on_down(&mut self, reason: Option<String>) -> Result<(), SupervisorError> {
        let from = self.transition(TunnelState::Down)?;
        let reason = reason.as_deref().unwrap_or("no reason given");
        if from == TunnelState::ProcessRunning {
            info!("Tunnel {}: down before coming up ({})", self.id(), reason);
        } else {
            info!(
                "Tunnel {}: down on {} ({})",
                self.id(),
                self.runtime.interface().unwrap_or("-"),
                reason
            );
        }
        self.stop_keepalive();
        Ok(())
    }

    // ---- keep-alive -------------------------------------------------------

    fn start_keepalive(&mut self, interface: &str) {
        self.keepalive_session += 1;
        let session = self.keepalive_session;
        let config = KeepAliveConfig::resolve(
            &self.ctx.settings.keepalive,
            &self.profile.keepalive,
            interface,
            &self.ctx.settings.kill_command,
        );
        let tasks = self.tasks.clone();
        let on_dead = move || {
            let _ = tasks.submit("keepalive_stall", move |core| core.on_keepalive_stall(session));
        };

        match KeepAliveMonitor::start(config, self.ctx.runner.clone(), on_dead) {
            Ok(monitor) => {
                info!(
                    "Tunnel {}: probing {} via {} (dead after {} misses)",
                    self.id(),
                    monitor.target(),
                    monitor.interface(),
                    monitor.threshold()
                );
                self.keepalive = Some(monitor);
            }
            Err(e) => warn!("Tunnel {}: keep-alive not started: {}", self.id(), e),
        }
    }

    fn stop_keepalive(&mut self) {
        if let Some(monitor) = self.keepalive.take() {
            monitor.stop();
        }
    }

    fn on_keepalive_stall(&mut self, session: u64) -> Result<(), SupervisorError> {
        if session != self.keepalive_session || self.runtime.state != TunnelState::Up {
            debug!("Tunnel {}: ignoring stale keep-alive report", self.id());
            return Ok(());
        }
        warn!("Tunnel {}: keep-alive failed, restarting client", self.id());
        self.restart_requested = true;
        self.stop()
    }

    // ---- collaborator notifications ---------------------------------------

    fn refresh_device_routing(&self) {
        let devices: Vec<DeviceId> = self.runtime.devices.iter().cloned().collect();
        if let Err(e) = self.ctx.proxy.set_acl_devices(self.id(), &devices) {
            warn!("Tunnel {}: failed to update proxy ACL: {}", self.id(), e);
        }
        self.ctx.routing.device_routing_changed();
    }

    fn teardown_link(&mut self) {
        let link = self.runtime.link.clone();
        if let Some(route) = &self.route {
            let trusted = link.as_ref().map(|l| l.trusted_ip);
            if let Err(e) = self.ctx.routing.clear_route(route, trusted) {
                warn!("Tunnel {}: failed to clear route: {}", self.runtime.profile_id, e);
            }
        }
        if link.is_some_and(|l| !l.dns_servers.is_empty()) {
            if let Err(e) = self.ctx.dns.remove_tunnel_name_servers(self.id()) {
                warn!("Tunnel {}: failed to remove name servers: {}", self.id(), e);
            }
        }
    }

    fn stop_listener(&mut self) {
        if !self.listener.is_started() {
            return;
        }
        if let Err(e) = self.listener.stop() {
            warn!("Tunnel {}: failed to detach status channel: {}", self.id(), e);
        }
    }
}

impl Drop for SupervisorCore {
    fn drop(&mut self) {
        self.stop_keepalive();
        if let Some(route) = self.route.take() {
            self.ctx.routing.release_route(route);
        }
    }
}

struct SupervisorInner {
    id: ProfileId,
    queue: TaskQueue<SupervisorCore>,
    status: Arc<RwLock<TunnelStatus>>,
    ctx: Collaborators,
}

/// Handle to one tunnel's supervisor.
#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<SupervisorInner>,
}

impl TunnelSupervisor {
    /// Create a supervisor, reserving its route slot for its whole lifetime.
    pub fn new(profile: VpnProfile, ctx: Collaborators) -> Result<Self, SupervisorError> {
        let id = profile.id.clone();
        let route = ctx.routing.acquire_route()?;
        let status = Arc::new(RwLock::new(TunnelStatus::new(id.clone())));

        let queue = {
            let id = id.clone();
            let ctx = ctx.clone();
            let status = status.clone();
            TaskQueue::spawn(format!("tunnel-{id}"), move |tasks| {
                let events: Arc<dyn StatusListener> = Arc::new(SupervisorEvents {
                    tasks: tasks.clone(),
                });
                let listener = StatusChannelListener::new(&id, ctx.transport.clone(), events);
                let mut runtime = TunnelRuntimeState::new(id.clone(), Some(route.mark()));
                runtime.touch();
                if let Err(e) = ctx.store.save_state(&runtime) {
                    warn!("Tunnel {}: failed to save runtime state: {}", id, e);
                }
                Ok::<_, SupervisorError>(SupervisorCore {
                    profile,
                    runtime,
                    route: Some(route),
                    listener,
                    keepalive: None,
                    keepalive_session: 0,
                    pid: None,
                    restart_requested: false,
                    errors: VecDeque::new(),
                    exit_code: None,
                    stopped_at: Instant::now(),
                    shutting_down: false,
                    ctx,
                    tasks,
                    status,
                })
            })?
        };

        info!("Tunnel {}: supervisor created", id);
        Ok(Self {
            inner: Arc::new(SupervisorInner {
                id,
                queue,
                status,
                ctx,
            }),
        })
    }

    pub fn id(&self) -> &ProfileId {
        &self.inner.id
    }

    /// Latest snapshot (lags by at most the task currently running).
    pub fn status(&self) -> TunnelStatus {
        self.inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reload the profile from the store; disabled profiles are refused.
    fn load_profile(&self) -> Result<VpnProfile, SupervisorError> {
        let profile = self.inner.ctx.store.get(&self.inner.id)?;
        if !profile.enabled {
            return Err(ProfileError::Disabled(profile.id).into());
        }
        Ok(profile)
    }

    /// Launch the client; illegal unless `Stopped`.
    pub fn start(&self) -> Result<Completion, SupervisorError> {
        let profile = self.load_profile()?;
        Ok(self.inner.queue.submit("start", move |core| {
            core.profile = profile;
            core.start()
        }))
    }

    /// Attach devices, starting the tunnel if it is stopped.
    pub fn add_devices(&self, devices: Vec<DeviceId>) -> Result<Completion, SupervisorError> {
        let profile = self.load_profile()?;
        Ok(self.inner.queue.submit("add_devices", move |core| {
            core.profile = profile;
            core.add_devices(devices)
        }))
    }

    /// Detach devices, stopping the tunnel once none remain.
    pub fn stop_devices(&self, devices: Vec<DeviceId>) -> Completion {
        self.inner
            .queue
            .submit("stop_devices", move |core| core.stop_devices(devices))
    }

    /// Terminate the client.
    pub fn stop(&self) -> Completion {
        self.inner.queue.submit("stop", |core| core.stop())
    }

    /// Terminate the client and start it again once it has exited.
    pub fn restart(&self) -> Completion {
        self.inner.queue.submit("restart", |core| core.restart())
    }

    /// Release the route slot; only legal when stopped with no devices.
    pub fn close(&self) -> Completion {
        self.inner.queue.submit("close", |core| core.close())
    }

    /// Apply a status event directly, bypassing the channel.
    pub fn handle_status(&self, event: StatusEvent) -> Completion {
        let name = format!("status_{}", event.keyword());
        self.inner
            .queue
            .submit(&name, move |core| core.on_status(event))
    }

    /// Wait until every task submitted so far has run.
    pub fn flush(&self) -> Result<(), SupervisorError> {
        self.inner.queue.flush()
    }

    /// Stop the worker thread; later submissions report `QueueClosed`.
    pub fn shutdown_queue(&self) {
        self.inner.queue.shutdown();
    }
}

impl std::fmt::Debug for TunnelSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSupervisor")
            .field("id", &self.inner.id)
            .field("state", &self.status().state)
            .finish()
    }
}
