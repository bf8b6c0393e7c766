//! Periodic eviction of idle tunnels.

use crate::registry::TunnelRegistry;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Background thread that runs [`TunnelRegistry::evict`] on an interval.
pub struct EvictionTimer {
    stop_tx: Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EvictionTimer {
    /// Spawn the evictor thread.
    pub fn start(registry: Arc<TunnelRegistry>, interval: Duration) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let worker = thread::Builder::new()
            .name("tunnel-evictor".to_string())
            .spawn(move || {
                debug!("Evictor started ({:?})", interval);
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let evicted = registry.evict();
                            if !evicted.is_empty() {
                                info!("Evicted {} idle tunnels", evicted.len());
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                debug!("Evictor stopped");
            })?;

        Ok(Self {
            stop_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop the thread and wait for an in-flight pass to finish.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for EvictionTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
