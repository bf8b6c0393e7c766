//! Keep-alive monitor
//!
//! A tunnel can be process-alive but traffic-dead. While a tunnel is up the
//! supervisor runs a ping probe bound to its interface and counts consecutive
//! unanswered probes; reaching the threshold fires the dead callback once
//! and the monitor stops its own probe.
//!
//! Probe output (iputils `ping -O`):
//!
//! ```text
//! PING 1.1.1.1 (1.1.1.1) from 10.8.0.6 tun0: 56(84) bytes of data.
//! 64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=12.3 ms
//! no answer yet for icmp_seq=2
//! ```

use crate::config::KeepAliveDefaults;
use crate::process::{ProcessError, ProcessRunner};
use crate::profile::KeepAliveSettings;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

static HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PING\s+\S+").expect("probe header pattern is valid"));

static REPLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+ bytes from .*icmp_seq=(\d+).*?(?:time=([\d.]+) ms)?$")
        .expect("probe reply pattern is valid")
});

static NO_REPLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:no answer yet for icmp_seq=(\d+)|From \S+ icmp_seq=(\d+) .*)$")
        .expect("probe no-reply pattern is valid")
});

/// One recognized probe output line.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeLine {
    Header,
    Reply { seq: u32, time_ms: Option<f64> },
    NoReply { seq: u32 },
}

/// Probe output that matches none of the known shapes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized probe output: {0:?}")]
pub struct ProbeParseError(pub String);

/// Classify one line of probe output.
pub fn parse_probe_line(line: &str) -> Result<ProbeLine, ProbeParseError> {
    let line = line.trim();
    if HEADER.is_match(line) {
        return Ok(ProbeLine::Header);
    }
    if let Some(caps) = REPLY.captures(line) {
        let seq = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let time_ms = caps.get(2).and_then(|m| m.as_str().parse().ok());
        return Ok(ProbeLine::Reply { seq, time_ms });
    }
    if let Some(caps) = NO_REPLY.captures(line) {
        let seq = caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        return Ok(ProbeLine::NoReply { seq });
    }
    Err(ProbeParseError(line.to_string()))
}

/// Resolved probe settings for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    pub interface: String,
    pub target: String,
    pub interval: Duration,
    pub threshold: u32,
    pub ping_command: String,
    pub kill_command: String,
}

impl KeepAliveConfig {
    /// Merge profile overrides over the daemon defaults.
    pub fn resolve(
        defaults: &KeepAliveDefaults,
        profile: &KeepAliveSettings,
        interface: &str,
        kill_command: &str,
    ) -> Self {
        Self {
            interface: interface.to_string(),
            target: profile
                .target
                .clone()
                .unwrap_or_else(|| defaults.default_target.clone()),
            interval: Duration::from_secs(
                profile.interval_secs.unwrap_or(defaults.interval_secs).max(1),
            ),
            threshold: profile.threshold.unwrap_or(defaults.threshold).max(1),
            ping_command: defaults.ping_command.clone(),
            kill_command: kill_command.to_string(),
        }
    }

    fn probe_args(&self) -> Vec<String> {
        vec![
            "-n".to_string(),
            "-O".to_string(),
            "-I".to_string(),
            self.interface.clone(),
            "-i".to_string(),
            self.interval.as_secs().to_string(),
            self.target.clone(),
        ]
    }
}

/// State shared between the monitor handle and its reader thread.
struct ProbeShared {
    pid: u32,
    interface: String,
    kill_command: String,
    runner: Arc<dyn ProcessRunner>,
    failures: AtomicU32,
    dead: AtomicBool,
    stopped: AtomicBool,
    on_dead: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ProbeShared {
    /// Kill the probe unless it is already stopped or gone.
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Stopping keep-alive probe {} on {}", self.pid, self.interface);
        if let Err(e) = self
            .runner
            .run(&self.kill_command, &[self.pid.to_string()])
        {
            warn!("Failed to stop keep-alive probe {} on {}: {}", self.pid, self.interface, e);
        }
    }

    fn fire_dead(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(
            "Tunnel {} unresponsive after {} unanswered probes",
            self.interface,
            self.failures.load(Ordering::SeqCst)
        );
        let callback = self
            .on_dead
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback();
        }
        self.stop();
    }
}

/// A running probe session over one tunnel interface.
pub struct KeepAliveMonitor {
    target: String,
    threshold: u32,
    shared: Arc<ProbeShared>,
}

impl KeepAliveMonitor {
    /// Start probing; `on_dead` runs at most once, on the probe reader thread.
    pub fn start(
        config: KeepAliveConfig,
        runner: Arc<dyn ProcessRunner>,
        on_dead: impl FnOnce() + Send + 'static,
    ) -> Result<Self, ProcessError> {
        let process = runner.start(&config.ping_command, &config.probe_args())?;

        let shared = Arc::new(ProbeShared {
            pid: process.pid,
            interface: config.interface.clone(),
            kill_command: config.kill_command.clone(),
            runner,
            failures: AtomicU32::new(0),
            dead: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            on_dead: Mutex::new(Some(Box::new(on_dead))),
        });

        let reader = shared.clone();
        let threshold = config.threshold;
        let spawned = thread::Builder::new()
            .name(format!("keepalive-{}", config.interface))
            .spawn(move || {
                for line in process.stdout.iter() {
                    match parse_probe_line(&line) {
                        Ok(ProbeLine::Header) => {}
                        Ok(ProbeLine::Reply { .. }) => {
                            // Any answer resets the streak
                            reader.failures.store(0, Ordering::SeqCst);
                        }
                        Ok(ProbeLine::NoReply { seq }) => {
                            let failures = reader.failures.fetch_add(1, Ordering::SeqCst) + 1;
                            debug!("No reply on {} (seq {}, {} in a row)", reader.interface, seq, failures);
                            if failures >= threshold {
                                reader.fire_dead();
                                break;
                            }
                        }
                        Err(e) => debug!("{} on {}", e, reader.interface),
                    }
                }

                // Reap ping once it exits or is killed
                let status = process.wait();
                debug!("Keep-alive probe {} on {} exited: {:?}", reader.pid, reader.interface, status);
                // The pid may be reused from here on.
                reader.stopped.store(true, Ordering::SeqCst);
            });

        if let Err(e) = spawned {
            shared.stop();
            return Err(ProcessError::IoError(format!("keep-alive reader: {e}")));
        }

        info!(
            "Keep-alive started on {} -> {} (every {:?}, threshold {})",
            config.interface, config.target, config.interval, config.threshold
        );
        Ok(Self {
            target: config.target,
            threshold,
            shared,
        })
    }

    pub fn interface(&self) -> &str {
        &self.shared.interface
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.failures.load(Ordering::SeqCst)
    }

    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Kill the probe if still running; idempotent.
    pub fn stop(&self) {
        self.shared.stop();
    }
}

impl Drop for KeepAliveMonitor {
    fn drop(&mut self) {
        self.shared.stop();
    }
}
