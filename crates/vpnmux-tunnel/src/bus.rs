//! Publish/subscribe transport
//!
//! Status channels ride on a [`PubSubTransport`]. Subscription and
//! unsubscription are asynchronous: the transport confirms them later via
//! [`SubscriptionHandler::on_subscribed`] / [`SubscriptionHandler::on_unsubscribed`].
//!
//! [`LocalBus`] is the in-process implementation used by the daemon. All
//! commands go through a single dispatcher thread, so confirmations and
//! deliveries for one subscriber happen in the order they were requested.

use crate::status_channel::ChannelError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Subscription identifier handed out by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Receives channel traffic and lifecycle confirmations.
pub trait SubscriptionHandler: Send + Sync {
    fn on_message(&self, channel: &str, message: &str);

    fn on_subscribed(&self, channel: &str);

    fn on_unsubscribed(&self, channel: &str);
}

/// Asynchronous pub/sub transport.
pub trait PubSubTransport: Send + Sync {
    /// Request a subscription; confirmation arrives via `on_subscribed`.
    fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionId, ChannelError>;

    /// Request removal; confirmation arrives via `on_unsubscribed`.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ChannelError>;
}

enum BusCommand {
    Subscribe {
        id: SubscriptionId,
        channel: String,
        handler: Arc<dyn SubscriptionHandler>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Publish {
        channel: String,
        message: String,
    },
    Shutdown,
}

/// In-process pub/sub bus with a dispatcher thread.
pub struct LocalBus {
    tx: Sender<BusCommand>,
    next_id: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBus {
    /// Create the bus and start its dispatcher thread.
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = unbounded();
        let dispatcher = thread::Builder::new()
            .name("pubsub-dispatch".to_string())
            .spawn(move || {
                debug!("Pub/sub dispatcher started");
                run_dispatch_loop(rx);
                debug!("Pub/sub dispatcher stopped");
            })?;

        Ok(Self {
            tx,
            next_id: AtomicU64::new(1),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Publish a message to every subscriber of `channel`.
    pub fn publish(&self, channel: &str, message: &str) -> Result<(), ChannelError> {
        self.tx
            .send(BusCommand::Publish {
                channel: channel.to_string(),
                message: message.to_string(),
            })
            .map_err(|_| ChannelError::TransportClosed)
    }

    /// Stop the dispatcher; pending commands are processed first.
    pub fn shutdown(&self) {
        let _ = self.tx.send(BusCommand::Shutdown);
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        info!("Pub/sub bus stopped");
    }
}

impl PubSubTransport for LocalBus {
    fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionId, ChannelError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tx
            .send(BusCommand::Subscribe {
                id,
                channel: channel.to_string(),
                handler,
            })
            .map_err(|_| ChannelError::TransportClosed)?;
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ChannelError> {
        self.tx
            .send(BusCommand::Unsubscribe { id })
            .map_err(|_| ChannelError::TransportClosed)
    }
}

impl Drop for LocalBus {
    fn drop(&mut self) {
        let _ = self.tx.send(BusCommand::Shutdown);
    }
}

fn run_dispatch_loop(rx: Receiver<BusCommand>) {
    let mut subscriptions: HashMap<SubscriptionId, (String, Arc<dyn SubscriptionHandler>)> =
        HashMap::new();

    while let Ok(command) = rx.recv() {
        match command {
            BusCommand::Subscribe { id, channel, handler } => {
                debug!("{} subscribed to {}", id, channel);
                deliver(&channel, || handler.on_subscribed(&channel));
                subscriptions.insert(id, (channel, handler));
            }
            BusCommand::Unsubscribe { id } => match subscriptions.remove(&id) {
                Some((channel, handler)) => {
                    debug!("{} unsubscribed from {}", id, channel);
                    deliver(&channel, || handler.on_unsubscribed(&channel));
                }
                None => warn!("Unsubscribe for unknown {}", id),
            },
            BusCommand::Publish { channel, message } => {
                // Fan out to every subscriber of this channel
                for (subscribed, handler) in subscriptions.values() {
                    if *subscribed == channel {
                        deliver(&channel, || handler.on_message(&channel, &message));
                    }
                }
            }
            BusCommand::Shutdown => break,
        }
    }
}

/// Run a handler callback without letting a panic take the dispatcher down.
fn deliver(channel: &str, callback: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("Subscriber on {} panicked", channel);
    }
}
