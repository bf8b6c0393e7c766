//! Tunnel lifecycle state machine
//!
//! Every supervisor holds exactly one [`TunnelState`]. Moves between states
//! go through [`TunnelState::transition`], which checks the requested target
//! against the allow-list of legal source states.
//!
//! ```text
//!  Stopped ──start──▶ Starting ──spawned──▶ ProcessRunning ──up──▶ Up ◀──up── Down
//!     ▲                  │                      │    └──down──▶ Down ◀──down──┘
//!     │                  └────────stop──────────┴────────▶ Killing
//!     └──────────── exit handler (via ProcessDead) ◀────────┘
//!  Stopped ──close──▶ Closed
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tunnel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    /// No client process, nothing in flight.
    Stopped,
    /// Credentials written, status channel attached, spawn in progress.
    Starting,
    /// Client process running, tunnel not reported up yet.
    ProcessRunning,
    /// Status channel reported the tunnel usable.
    Up,
    /// Status channel reported the tunnel down (may come back up).
    Down,
    /// Termination requested, waiting for the process to exit.
    Killing,
    /// Process exited, cleanup in progress.
    ProcessDead,
    /// Route released, supervisor finished for good.
    Closed,
}

impl TunnelState {
    /// All states, in declaration order.
    pub fn all() -> &'static [TunnelState] {
        &[
            TunnelState::Stopped,
            TunnelState::Starting,
            TunnelState::ProcessRunning,
            TunnelState::Up,
            TunnelState::Down,
            TunnelState::Killing,
            TunnelState::ProcessDead,
            TunnelState::Closed,
        ]
    }

    /// States from which `target` may be entered.
    pub fn legal_sources(target: TunnelState) -> &'static [TunnelState] {
        use TunnelState::*;
        match target {
            Stopped => &[Starting, ProcessRunning, Up, Down, Killing, ProcessDead],
            Starting => &[Stopped],
            ProcessRunning => &[Starting],
            Up => &[ProcessRunning, Down],
            Down => &[Up, ProcessRunning],
            Killing => &[Starting, ProcessRunning, Up, Down],
            ProcessDead => &[Starting, ProcessRunning, Up, Down, Killing],
            Closed => &[Stopped],
        }
    }

    /// Check whether moving from `self` to `target` is allowed.
    pub fn can_transition_to(&self, target: TunnelState) -> bool {
        Self::legal_sources(target).contains(self)
    }

    /// Validate a move to `target`, returning the new state.
    pub fn transition(self, target: TunnelState) -> Result<TunnelState, TransitionError> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(TransitionError::Illegal { from: self, to: target })
        }
    }

    /// A client process exists or is being created/torn down.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TunnelState::Starting
                | TunnelState::ProcessRunning
                | TunnelState::Up
                | TunnelState::Down
                | TunnelState::Killing
                | TunnelState::ProcessDead
        )
    }

    /// Check if the tunnel is carrying traffic.
    pub fn is_up(&self) -> bool {
        matches!(self, TunnelState::Up)
    }

    /// Stopped or closed: eligible for eviction once idle long enough.
    pub fn is_idle(&self) -> bool {
        matches!(self, TunnelState::Stopped | TunnelState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Stopped => "stopped",
            TunnelState::Starting => "starting",
            TunnelState::ProcessRunning => "process_running",
            TunnelState::Up => "up",
            TunnelState::Down => "down",
            TunnelState::Killing => "killing",
            TunnelState::ProcessDead => "process_dead",
            TunnelState::Closed => "closed",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal tunnel transition: {from} -> {to}")]
    Illegal { from: TunnelState, to: TunnelState },
}
