//! Serial task queue
//!
//! Every tunnel owns one worker thread. Callers, the exit watcher, the
//! status channel and the keep-alive probe all mutate the tunnel by
//! submitting named tasks; the worker runs them strictly in submission
//! order, so the state they touch is only ever seen by one thread.
//!
//! ```text
//!  caller ──┐
//!  exit ────┼──► [ task | task | task ] ──► worker (owns S)
//!  status ──┤                                 │ catch_unwind per task
//!  probe ───┘                                 └─► Completion
//! ```
//!
//! A task failure or panic is logged at the task boundary and handed to the
//! submitter's [`Completion`], which may be waited on or simply dropped.

use crate::supervisor::SupervisorError;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// State owned by a queue worker.
pub trait QueueState: Send + 'static {
    /// Prefix for log lines.
    fn label(&self) -> String;

    /// Runs after every task, including failed and panicked ones.
    fn after_task(&mut self) {}
}

type Task<S> = Box<dyn FnOnce(&mut S) -> Result<(), SupervisorError> + Send>;

enum QueueMessage<S> {
    Run {
        name: String,
        task: Task<S>,
        done: Sender<Result<(), SupervisorError>>,
    },
    Shutdown,
}

/// Receipt for a submitted task.
#[derive(Debug)]
#[must_use = "dropping a Completion makes the task fire-and-forget"]
pub struct Completion {
    name: String,
    rx: Receiver<Result<(), SupervisorError>>,
}

impl Completion {
    /// Block until the task has run; `QueueClosed` if it never will.
    pub fn wait(self) -> Result<(), SupervisorError> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(SupervisorError::QueueClosed(self.name)))
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Option<Result<(), SupervisorError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(SupervisorError::QueueClosed(self.name))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Submission side of a queue.
pub struct TaskSender<S> {
    tx: Sender<QueueMessage<S>>,
}

impl<S> Clone for TaskSender<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: QueueState> TaskSender<S> {
    /// Enqueue a task under `name`.
    pub fn submit<F>(&self, name: &str, task: F) -> Completion
    where
        F: FnOnce(&mut S) -> Result<(), SupervisorError> + Send + 'static,
    {
        let (done, rx) = bounded(1);
        let message = QueueMessage::Run {
            name: name.to_string(),
            task: Box::new(task),
            done,
        };
        if self.tx.send(message).is_err() {
            debug!("Dropping task {}: queue closed", name);
        }
        Completion {
            name: name.to_string(),
            rx,
        }
    }
}

/// A worker thread and its queue.
pub struct TaskQueue<S> {
    sender: TaskSender<S>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: QueueState> TaskQueue<S> {
    /// Build the state (which may keep a sender to its own queue) and start
    /// the worker.
    pub fn spawn<E>(
        thread_name: String,
        build: impl FnOnce(TaskSender<S>) -> Result<S, E>,
    ) -> Result<Self, E>
    where
        E: From<std::io::Error>,
    {
        let (tx, rx) = unbounded();
        let sender = TaskSender { tx };
        let state = build(sender.clone())?;

        let worker = thread::Builder::new().name(thread_name).spawn(move || {
            let label = state.label();
            debug!("{} worker started", label);
            run_queue_loop(&label, rx, state);
            debug!("{} worker stopped", label);
        })?;

        Ok(Self {
            sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn sender(&self) -> &TaskSender<S> {
        &self.sender
    }

    pub fn submit<F>(&self, name: &str, task: F) -> Completion
    where
        F: FnOnce(&mut S) -> Result<(), SupervisorError> + Send + 'static,
    {
        self.sender.submit(name, task)
    }

    /// Wait until every task submitted before this call has run.
    pub fn flush(&self) -> Result<(), SupervisorError> {
        self.submit("flush", |_| Ok(())).wait()
    }

    /// Stop the worker after the tasks already queued and join it.
    pub fn shutdown(&self) {
        let _ = self.sender.tx.send(QueueMessage::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!("Queue worker terminated abnormally");
            }
        }
    }
}

impl<S> Drop for TaskQueue<S> {
    fn drop(&mut self) {
        let _ = self.sender.tx.send(QueueMessage::Shutdown);
    }
}

fn run_queue_loop<S: QueueState>(label: &str, rx: Receiver<QueueMessage<S>>, mut state: S) {
    loop {
        let (name, task, done) = match rx.recv() {
            Ok(QueueMessage::Run { name, task, done }) => (name, task, done),
            Ok(QueueMessage::Shutdown) => {
                debug!("{} queue received shutdown", label);
                break;
            }
            Err(_) => {
                debug!("{} queue closed", label);
                break;
            }
        };

        // Run the task, turning a panic into a task error
        debug!("{}: {}", label, name);
        let result = match panic::catch_unwind(AssertUnwindSafe(|| task(&mut state))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("{}: task {} failed: {}", label, name, e);
                Err(e)
            }
            Err(panic_info) => {
                let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!("{}: task {} panicked: {}", label, name, message);
                Err(SupervisorError::TaskPanicked {
                    task: name.clone(),
                    message,
                })
            }
        };

        // Publish state before the caller is woken
        if panic::catch_unwind(AssertUnwindSafe(|| state.after_task())).is_err() {
            error!("{}: post-task hook panicked after {}", label, name);
        }
        let _ = done.send(result);
    }
}
