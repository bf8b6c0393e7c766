//! vpnmux tunnel supervision
//!
//! Runs one external VPN client process per profile and keeps its lifecycle,
//! its routing and the set of devices attached to it consistent.
//!
//! # Architecture
//!
//! ```text
//!   route(device, profile)          ┌──────────────────────┐
//!  ───────────────────────────────▶ │    TunnelRegistry    │ ◀── EvictionTimer
//!                                   └──────────┬───────────┘
//!                                              │ one per profile
//!                                              ▼
//!  ┌─────────────┐  status lines   ┌──────────────────────┐   spawn/kill   ┌────────────┐
//!  │ pub/sub bus │ ──────────────▶ │   TunnelSupervisor   │ ─────────────▶ │ VPN client │
//!  └─────────────┘ (StatusChannel  │  (serial task queue) │                └────────────┘
//!                    Listener)     └──┬────────────────┬──┘
//!                                     │ stall          │ hooks
//!                               ┌─────┴──────────┐  ┌──┴──────────────────┐
//!                               │KeepAliveMonitor│  │ routing / ACL / DNS │
//!                               └────────────────┘  └─────────────────────┘
//! ```
//!
//! Every mutation of a tunnel runs as a named task on that tunnel's worker
//! thread; readers get a snapshot through [`TunnelSupervisor::status`].

pub mod bus;
pub mod collaborators;
pub mod config;
pub mod eviction;
pub mod keepalive;
pub mod process;
pub mod profile;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod status_channel;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use bus::{LocalBus, PubSubTransport, SubscriptionHandler, SubscriptionId};
pub use collaborators::{
    CollaboratorError, Collaborators, DnsControl, ProfileStore, ProxyAcl, RouteHandle, Routing,
};
pub use config::{ConfigError, DaemonConfig, RegistryConfig, SupervisorSettings};
pub use eviction::EvictionTimer;
pub use keepalive::{KeepAliveConfig, KeepAliveMonitor};
pub use process::{ProcessError, ProcessRunner, SpawnedProcess, SystemProcessRunner};
pub use profile::{DeviceId, ProfileError, ProfileId, VpnProfile};
pub use queue::Completion;
pub use registry::{DeleteOutcome, RegistryError, TunnelRegistry};
pub use runtime::{TunnelLink, TunnelRuntimeState, TunnelStatus};
pub use state::{TransitionError, TunnelState};
pub use status_channel::{ChannelError, StatusChannelListener, StatusEvent, StatusListener};
pub use store::FileProfileStore;
pub use supervisor::{SupervisorError, TunnelSupervisor};
