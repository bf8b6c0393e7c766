//! Test doubles for the collaborators

use crate::bus::{LocalBus, PubSubTransport, SubscriptionHandler, SubscriptionId};
use crate::collaborators::{
    CollaboratorError, Collaborators, DnsControl, ProfileStore, ProxyAcl, RouteHandle, Routing,
};
use crate::config::SupervisorSettings;
use crate::process::{ProcessError, ProcessRunner, SpawnedProcess};
use crate::profile::{Credentials, DeviceId, ProfileError, ProfileId, VpnProfile};
use crate::runtime::{TunnelLink, TunnelRuntimeState};
use crate::status_channel::{ChannelError, StatusEvent, StatusListener};
use crossbeam_channel::{bounded, unbounded, Sender};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Poll `condition` until it holds or five seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Link parameters as reported by a typical `up` line.
pub fn link(interface: &str) -> TunnelLink {
    TunnelLink {
        interface: interface.to_string(),
        net_gateway: "10.8.0.1".parse().unwrap(),
        vpn_gateway: "10.8.0.5".parse().unwrap(),
        local_ip: "10.8.0.6".parse().unwrap(),
        trusted_ip: "203.0.113.7".parse().unwrap(),
        dns_servers: vec!["10.8.0.1".parse().unwrap()],
    }
}

pub fn sample_profile(id: &str) -> VpnProfile {
    let mut profile = VpnProfile::new(id, format!("/etc/vpnmux/{id}.ovpn"));
    profile.credentials = Some(Credentials {
        username: "user".into(),
        password: "secret".into(),
    });
    profile
}

// ---- process runner -------------------------------------------------------

struct FakeProcess {
    command: String,
    stdout: Sender<String>,
    exit: Sender<Option<i32>>,
}

#[derive(Default)]
struct FakeRunnerState {
    next_pid: u32,
    live: HashMap<u32, FakeProcess>,
    started: Vec<(u32, String, Vec<String>)>,
    runs: Vec<(String, Vec<String>)>,
    scripts: HashMap<String, VecDeque<Vec<String>>>,
    spawn_failures: HashMap<String, usize>,
    kill_failure: Option<ProcessError>,
}

/// Scripted process runner; `kill <pid>` ends the fake process.
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<FakeRunnerState>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stdout lines for the next start of `command`.
    pub fn script_output(&self, command: &str, lines: Vec<String>) {
        let mut state = self.state.lock().unwrap();
        state
            .scripts
            .entry(command.to_string())
            .or_default()
            .push_back(lines);
    }

    pub fn fail_next_spawn(&self, command: &str) {
        let mut state = self.state.lock().unwrap();
        *state.spawn_failures.entry(command.to_string()).or_default() += 1;
    }

    /// Make every `kill` run fail with `error` (or succeed again with `None`).
    pub fn fail_kills(&self, error: Option<ProcessError>) {
        self.state.lock().unwrap().kill_failure = error;
    }

    /// End a live process with the given exit code.
    pub fn exit(&self, pid: u32, code: Option<i32>) {
        let process = self.state.lock().unwrap().live.remove(&pid);
        if let Some(process) = process {
            let _ = process.exit.send(code);
        }
    }

    /// Write a stdout line; false if the process or its reader is gone.
    pub fn emit(&self, pid: u32, line: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .live
            .get(&pid)
            .is_some_and(|process| process.stdout.send(line.to_string()).is_ok())
    }

    /// `(pid, args)` of every start of `command`.
    pub fn started(&self, command: &str) -> Vec<(u32, Vec<String>)> {
        let state = self.state.lock().unwrap();
        state
            .started
            .iter()
            .filter(|(_, c, _)| c == command)
            .map(|(pid, _, args)| (*pid, args.clone()))
            .collect()
    }

    pub fn live_pids(&self, command: &str) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        let mut pids: Vec<u32> = state
            .live
            .iter()
            .filter(|(_, p)| p.command == command)
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Pids passed to `kill`, in order.
    pub fn killed(&self) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        state
            .runs
            .iter()
            .filter(|(c, _)| c == "kill")
            .filter_map(|(_, args)| args.first().and_then(|a| a.parse().ok()))
            .collect()
    }
}

impl ProcessRunner for FakeRunner {
    fn start(&self, command: &str, args: &[String]) -> Result<SpawnedProcess, ProcessError> {
        let mut state = self.state.lock().unwrap();
        if let Some(failures) = state.spawn_failures.get_mut(command) {
            if *failures > 0 {
                *failures -= 1;
                return Err(ProcessError::Spawn {
                    command: command.to_string(),
                    message: "No such file or directory".into(),
                });
            }
        }

        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        let (stdout_tx, stdout_rx) = unbounded();
        if let Some(lines) = state.scripts.get_mut(command).and_then(VecDeque::pop_front) {
            for line in lines {
                let _ = stdout_tx.send(line);
            }
        }
        let (exit_tx, exit_rx) = bounded(1);
        state.live.insert(
            pid,
            FakeProcess {
                command: command.to_string(),
                stdout: stdout_tx,
                exit: exit_tx,
            },
        );
        state.started.push((pid, command.to_string(), args.to_vec()));

        let name = command.to_string();
        Ok(SpawnedProcess::new(
            pid,
            stdout_rx,
            Box::new(move || {
                exit_rx
                    .recv()
                    .map_err(|_| ProcessError::IoError(format!("{name}: runner dropped")))
            }),
        ))
    }

    fn run(&self, command: &str, args: &[String]) -> Result<(), ProcessError> {
        let mut state = self.state.lock().unwrap();
        state.runs.push((command.to_string(), args.to_vec()));
        if command != "kill" {
            return Ok(());
        }
        if let Some(error) = state.kill_failure.clone() {
            return Err(error);
        }
        for pid in args.iter().filter_map(|a| a.parse::<u32>().ok()) {
            if let Some(process) = state.live.remove(&pid) {
                let _ = process.exit.send(None);
            }
        }
        Ok(())
    }
}

// ---- routing / proxy / dns ------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookCall {
    AcquireRoute(u32),
    ReleaseRoute(u32),
    ApplyRoute {
        mark: u32,
        interface: String,
    },
    ClearRoute {
        mark: u32,
        trusted_ip: Option<IpAddr>,
    },
    RoutingChanged,
    Acl {
        tunnel: ProfileId,
        devices: Vec<DeviceId>,
    },
    TunnelResolver {
        device: DeviceId,
        tunnel: ProfileId,
    },
    DefaultResolver {
        device: DeviceId,
    },
    AddNameServers {
        tunnel: ProfileId,
        servers: Vec<IpAddr>,
        local_ip: IpAddr,
    },
    RemoveNameServers {
        tunnel: ProfileId,
    },
}

/// Records every routing, proxy and DNS call.
pub struct RecordingHooks {
    calls: Mutex<Vec<HookCall>>,
    next_mark: AtomicU32,
}

impl Default for RecordingHooks {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_mark: AtomicU32::new(1),
        }
    }
}

impl RecordingHooks {
    fn record(&self, call: HookCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<HookCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn contains(&self, call: &HookCall) -> bool {
        self.calls.lock().unwrap().contains(call)
    }

    pub fn count(&self, predicate: impl Fn(&HookCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }

    /// Device list of the most recent ACL push for `tunnel`.
    pub fn last_acl(&self, tunnel: &ProfileId) -> Option<Vec<DeviceId>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|c| match c {
                HookCall::Acl { tunnel: t, devices } if t == tunnel => Some(devices.clone()),
                _ => None,
            })
    }
}

impl Routing for RecordingHooks {
    fn acquire_route(&self) -> Result<RouteHandle, CollaboratorError> {
        let mark = self.next_mark.fetch_add(1, Ordering::SeqCst);
        self.record(HookCall::AcquireRoute(mark));
        Ok(RouteHandle::new(mark))
    }

    fn release_route(&self, handle: RouteHandle) {
        self.record(HookCall::ReleaseRoute(handle.mark()));
    }

    fn apply_route(&self, handle: &RouteHandle, link: &TunnelLink) -> Result<(), CollaboratorError> {
        self.record(HookCall::ApplyRoute {
            mark: handle.mark(),
            interface: link.interface.clone(),
        });
        Ok(())
    }

    fn clear_route(
        &self,
        handle: &RouteHandle,
        trusted_ip: Option<IpAddr>,
    ) -> Result<(), CollaboratorError> {
        self.record(HookCall::ClearRoute {
            mark: handle.mark(),
            trusted_ip,
        });
        Ok(())
    }

    fn device_routing_changed(&self) {
        self.record(HookCall::RoutingChanged);
    }
}

impl ProxyAcl for RecordingHooks {
    fn set_acl_devices(&self, tunnel: &ProfileId, devices: &[DeviceId]) -> Result<(), CollaboratorError> {
        self.record(HookCall::Acl {
            tunnel: tunnel.clone(),
            devices: devices.to_vec(),
        });
        Ok(())
    }
}

impl DnsControl for RecordingHooks {
    fn use_tunnel_resolver(&self, device: &DeviceId, tunnel: &ProfileId) -> Result<(), CollaboratorError> {
        self.record(HookCall::TunnelResolver {
            device: device.clone(),
            tunnel: tunnel.clone(),
        });
        Ok(())
    }

    fn use_default_resolver(&self, device: &DeviceId) -> Result<(), CollaboratorError> {
        self.record(HookCall::DefaultResolver {
            device: device.clone(),
        });
        Ok(())
    }

    fn add_tunnel_name_servers(
        &self,
        tunnel: &ProfileId,
        servers: &[IpAddr],
        local_ip: IpAddr,
    ) -> Result<(), CollaboratorError> {
        self.record(HookCall::AddNameServers {
            tunnel: tunnel.clone(),
            servers: servers.to_vec(),
            local_ip,
        });
        Ok(())
    }

    fn remove_tunnel_name_servers(&self, tunnel: &ProfileId) -> Result<(), CollaboratorError> {
        self.record(HookCall::RemoveNameServers {
            tunnel: tunnel.clone(),
        });
        Ok(())
    }
}

// ---- profile store --------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    profiles: HashMap<ProfileId, VpnProfile>,
    states: HashMap<ProfileId, TunnelRuntimeState>,
    credentials: HashSet<ProfileId>,
    deleted: HashSet<ProfileId>,
}

/// In-memory profile store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn insert(&self, profile: VpnProfile) {
        self.inner
            .lock()
            .unwrap()
            .profiles
            .insert(profile.id.clone(), profile);
    }

    pub fn profile(&self, id: &str) -> VpnProfile {
        self.inner.lock().unwrap().profiles[&ProfileId::new(id)].clone()
    }

    pub fn contains(&self, id: &ProfileId) -> bool {
        self.inner.lock().unwrap().profiles.contains_key(id)
    }

    pub fn saved_state(&self, id: &ProfileId) -> Option<TunnelRuntimeState> {
        self.inner.lock().unwrap().states.get(id).cloned()
    }

    pub fn has_credentials(&self, id: &ProfileId) -> bool {
        self.inner.lock().unwrap().credentials.contains(id)
    }
}

impl ProfileStore for MemoryStore {
    fn get(&self, id: &ProfileId) -> Result<VpnProfile, ProfileError> {
        self.inner
            .lock()
            .unwrap()
            .profiles
            .get(id)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(id.clone()))
    }

    fn list(&self) -> Result<Vec<ProfileId>, ProfileError> {
        let mut ids: Vec<ProfileId> = self.inner.lock().unwrap().profiles.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn save_state(&self, state: &TunnelRuntimeState) -> Result<(), ProfileError> {
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(state.profile_id.clone(), state.clone());
        Ok(())
    }

    fn load_state(&self, id: &ProfileId) -> Result<Option<TunnelRuntimeState>, ProfileError> {
        Ok(self.saved_state(id))
    }

    fn remove_state(&self, id: &ProfileId) -> Result<(), ProfileError> {
        self.inner.lock().unwrap().states.remove(id);
        Ok(())
    }

    fn write_credentials(&self, profile: &VpnProfile) -> Result<Option<PathBuf>, ProfileError> {
        if profile.credentials.is_none() {
            return Ok(None);
        }
        self.inner.lock().unwrap().credentials.insert(profile.id.clone());
        Ok(Some(PathBuf::from(format!("/run/vpnmux/{}.auth", profile.id))))
    }

    fn remove_credentials(&self, id: &ProfileId) -> Result<(), ProfileError> {
        self.inner.lock().unwrap().credentials.remove(id);
        Ok(())
    }

    fn truncate_log(&self, id: &ProfileId) -> Result<PathBuf, ProfileError> {
        Ok(PathBuf::from(format!("/run/vpnmux/{id}.log")))
    }

    fn mark_deleted(&self, id: &ProfileId) -> Result<(), ProfileError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.profiles.contains_key(id) {
            return Err(ProfileError::NotFound(id.clone()));
        }
        inner.deleted.insert(id.clone());
        Ok(())
    }

    fn is_marked_deleted(&self, id: &ProfileId) -> bool {
        self.inner.lock().unwrap().deleted.contains(id)
    }

    fn delete_profile(&self, id: &ProfileId) -> Result<(), ProfileError> {
        let mut inner = self.inner.lock().unwrap();
        inner.profiles.remove(id);
        inner.states.remove(id);
        inner.credentials.remove(id);
        inner.deleted.remove(id);
        Ok(())
    }
}

// ---- pub/sub --------------------------------------------------------------

type Subscriptions = Arc<Mutex<HashMap<SubscriptionId, (String, Arc<dyn SubscriptionHandler>)>>>;

/// Transport confirming (un)subscriptions from another thread after a delay.
pub struct DelayedTransport {
    delay: Duration,
    next_id: AtomicU64,
    subscriptions: Subscriptions,
}

impl DelayedTransport {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_id: AtomicU64::new(1),
            subscriptions: Arc::default(),
        }
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .values()
            .any(|(c, _)| c == channel)
    }

    /// Deliver a line synchronously to the channel's subscribers.
    pub fn deliver(&self, channel: &str, line: &str) {
        let handlers: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|(c, _)| c == channel)
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler.on_message(channel, line);
        }
    }
}

impl PubSubTransport for DelayedTransport {
    fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionId, ChannelError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let subscriptions = self.subscriptions.clone();
        let channel = channel.to_string();
        let delay = self.delay;
        thread::spawn(move || {
            thread::sleep(delay);
            subscriptions
                .lock()
                .unwrap()
                .insert(id, (channel.clone(), handler.clone()));
            handler.on_subscribed(&channel);
        });
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ChannelError> {
        let subscriptions = self.subscriptions.clone();
        let delay = self.delay;
        thread::spawn(move || {
            thread::sleep(delay);
            let removed = subscriptions.lock().unwrap().remove(&id);
            if let Some((channel, handler)) = removed {
                handler.on_unsubscribed(&channel);
            }
        });
        Ok(())
    }
}

/// [`LocalBus`] wrapper remembering which channels are subscribed.
pub struct TrackingTransport {
    bus: Arc<LocalBus>,
    active: Mutex<HashMap<SubscriptionId, String>>,
}

impl TrackingTransport {
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.active.lock().unwrap().values().any(|c| c == channel)
    }
}

impl PubSubTransport for TrackingTransport {
    fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionId, ChannelError> {
        let id = self.bus.subscribe(channel, handler)?;
        self.active.lock().unwrap().insert(id, channel.to_string());
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ChannelError> {
        self.active.lock().unwrap().remove(&id);
        self.bus.unsubscribe(id)
    }
}

/// Records the events of one status channel.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<StatusEvent>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl StatusListener for EventLog {
    fn on_status(&self, event: StatusEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---- wiring ---------------------------------------------------------------

/// Fakes wired into a [`Collaborators`] bundle.
pub struct Harness {
    pub runner: Arc<FakeRunner>,
    pub bus: Arc<LocalBus>,
    pub transport: Arc<TrackingTransport>,
    pub hooks: Arc<RecordingHooks>,
    pub store: Arc<MemoryStore>,
    pub ctx: Collaborators,
}

impl Harness {
    pub fn with_profiles(ids: &[&str]) -> Self {
        let runner = Arc::new(FakeRunner::new());
        let bus = Arc::new(LocalBus::new().unwrap());
        let transport = Arc::new(TrackingTransport {
            bus: bus.clone(),
            active: Mutex::new(HashMap::new()),
        });
        let hooks = Arc::new(RecordingHooks::default());
        let store = Arc::new(MemoryStore::default());
        for id in ids {
            store.insert(sample_profile(id));
        }

        let ctx = Collaborators {
            runner: runner.clone(),
            transport: transport.clone(),
            routing: hooks.clone(),
            proxy: hooks.clone(),
            dns: hooks.clone(),
            store: store.clone(),
            settings: SupervisorSettings::default(),
        };

        Self {
            runner,
            bus,
            transport,
            hooks,
            store,
            ctx,
        }
    }

    pub fn bus_subscribed(&self, channel: &str) -> bool {
        self.transport.is_subscribed(channel)
    }
}
