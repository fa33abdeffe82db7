//! Topology-driven cleanup of in-flight supply streams.
//!
//! A demander that leaves, fails, or cancels its rebalance never resumes its
//! streams, so the contexts it left behind must be evicted eagerly: each one
//! pins a partition reservation and possibly an overflow listener. The
//! watcher subscribes to membership events and evicts every worker slot of
//! the affected node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::SupplyContextStore;
use super::traits::ClusterMembership;

/// Background subscriber that evicts supply contexts on node departure.
pub struct TopologyWatcher {
    membership: Arc<dyn ClusterMembership>,
    contexts: Arc<SupplyContextStore>,
    worker_slots: usize,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TopologyWatcher {
    pub fn new(
        membership: Arc<dyn ClusterMembership>,
        contexts: Arc<SupplyContextStore>,
        worker_slots: usize,
    ) -> Self {
        Self {
            membership,
            contexts,
            worker_slots,
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Subscribe and start the eviction loop on `runtime`. Starting an
    /// already-running watcher is a no-op.
    pub fn start(&self, runtime: Handle) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut events = self.membership.subscribe();
        let contexts = Arc::clone(&self.contexts);
        let worker_slots = self.worker_slots;

        let task = runtime.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        debug!(
                            node = %event.node,
                            kind = ?event.kind,
                            "membership event, evicting supply contexts"
                        );
                        for slot in 0..worker_slots {
                            contexts.evict((event.node, slot));
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // Contexts for events we missed are reclaimed by the
                        // stale-topology check on the next demand.
                        warn!(missed, "membership event stream lagged");
                    }
                    Err(RecvError::Closed) => {
                        info!("membership event stream closed, stopping topology watcher");
                        break;
                    }
                }
            }
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Stop the eviction loop. Stopping a stopped watcher is a no-op.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
