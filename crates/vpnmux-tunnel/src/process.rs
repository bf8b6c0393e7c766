//! Process runner
//!
//! Supervisors and keep-alive monitors never touch `std::process` directly;
//! they go through a [`ProcessRunner`] so the launch mechanism can be
//! swapped (and faked in tests).

use crossbeam_channel::{unbounded, Receiver};
use std::io::{self, BufRead, BufReader};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, warn};

/// Blocks until the process exits, yielding its exit code (`None` if killed
/// by a signal).
pub type ExitWaiter = Box<dyn FnOnce() -> Result<Option<i32>, ProcessError> + Send>;

/// A started child process.
pub struct SpawnedProcess {
    pub pid: u32,
    /// Stdout, one line per message; disconnects when the process closes it.
    pub stdout: Receiver<String>,
    waiter: ExitWaiter,
}

impl SpawnedProcess {
    pub fn new(pid: u32, stdout: Receiver<String>, waiter: ExitWaiter) -> Self {
        Self { pid, stdout, waiter }
    }

    /// Stop collecting stdout. The reader keeps draining the pipe, so the
    /// child never blocks, but lines are no longer buffered.
    pub fn discard_output(&mut self) {
        self.stdout = crossbeam_channel::never();
    }

    /// Wait for the process to exit.
    pub fn wait(self) -> Result<Option<i32>, ProcessError> {
        (self.waiter)()
    }
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess").field("pid", &self.pid).finish()
    }
}

/// Launches external commands.
pub trait ProcessRunner: Send + Sync {
    /// Start a long-running command.
    fn start(&self, command: &str, args: &[String]) -> Result<SpawnedProcess, ProcessError>;

    /// Run a command to completion; non-zero exit is an error.
    fn run(&self, command: &str, args: &[String]) -> Result<(), ProcessError>;
}

/// Process errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {command}: {message}")]
    Spawn { command: String, message: String },

    #[error("{command} exited with status {code:?}")]
    Failed { command: String, code: Option<i32> },

    #[error("{command} was interrupted")]
    Interrupted { command: String },

    #[error("IO error: {0}")]
    IoError(String),
}

impl ProcessError {
    fn from_io(command: &str, err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::Interrupted {
            ProcessError::Interrupted {
                command: command.to_string(),
            }
        } else {
            ProcessError::IoError(format!("{command}: {err}"))
        }
    }
}

/// Runner backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessRunner;

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessRunner for SystemProcessRunner {
    fn start(&self, command: &str, args: &[String]) -> Result<SpawnedProcess, ProcessError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        let pid = child.id();
        let (tx, rx) = unbounded();

        if let Some(stdout) = child.stdout.take() {
            let name = command.to_string();
            let reader = thread::Builder::new()
                .name(format!("stdout-{pid}"))
                .spawn(move || {
                    for line in BufReader::new(stdout).lines() {
                        match line {
                            // Keep draining after the receiver is gone so the
                            // child never blocks on a full pipe.
                            Ok(line) => {
                                let _ = tx.send(line);
                            }
                            Err(e) => {
                                debug!("{} ({}) stdout closed: {}", name, pid, e);
                                break;
                            }
                        }
                    }
                });
            if let Err(e) = reader {
                warn!("Failed to spawn stdout reader for {} ({}): {}", command, pid, e);
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProcessError::from_io(command, &e));
            }
        }

        debug!("Started {} (pid {})", command, pid);
        let name = command.to_string();
        Ok(SpawnedProcess::new(
            pid,
            rx,
            Box::new(move || {
                child
                    .wait()
                    .map(|status| status.code())
                    .map_err(|e| ProcessError::from_io(&name, &e))
            }),
        ))
    }

    fn run(&self, command: &str, args: &[String]) -> Result<(), ProcessError> {
        let status = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| ProcessError::from_io(command, &e))?;

        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::Failed {
                command: command.to_string(),
                code: status.code(),
            })
        }
    }
}
