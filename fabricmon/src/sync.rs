//! Entity synchronizer.
//!
//! Consumes delta batches from the config store and applies them to the
//! topology under lock: one bootstrap prefix read, then a long-lived watch
//! from the bootstrap revision. This worker is the only writer to the
//! entity store.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::kv::KvStore;
use crate::store::{DeltaBatch, Topology};
use crate::worker::{WorkerStatus, status_channel};

pub struct Synchronizer {
    topo: Arc<Topology>,
    store: KvStore,
}

impl Synchronizer {
    pub fn new(topo: Arc<Topology>, store: KvStore) -> Self {
        Synchronizer { topo, store }
    }

    /// One-shot sync: read the whole root prefix and apply it as a single
    /// addition batch. Returns the store revision the read was served at.
    /// This is all a short-lived tool (the trace CLI) needs.
    pub async fn bootstrap(&self) -> Result<i64> {
        let root = self.store.root().to_string();
        let (pairs, revision) = self.store.read_prefix(&root).await?;
        let count = pairs.len();
        let batch = DeltaBatch {
            additions: pairs,
            removals: Vec::new(),
        };
        self.topo.apply_delta(&batch);
        info!(keys = count, revision, "bootstrapped entity view");
        Ok(revision)
    }

    /// Spawn the watch-consumption worker: bootstrap, then follow the
    /// watch until the stream ends or the store fails. Termination is
    /// signalled through the returned status receiver, never silent.
    pub fn spawn(self) -> (JoinHandle<()>, watch::Receiver<WorkerStatus>) {
        let (status_tx, status_rx) = status_channel();
        let handle = tokio::spawn(async move {
            let reason = match self.run().await {
                Ok(()) => "watch stream ended".to_string(),
                Err(e) => {
                    error!(error = %e, "entity synchronizer failed");
                    e.to_string()
                }
            };
            info!(reason = %reason, "entity synchronizer stopped");
            let _ = status_tx.send(WorkerStatus::Stopped { reason });
        });
        (handle, status_rx)
    }

    async fn run(&self) -> Result<()> {
        let revision = self.bootstrap().await?;
        let root = self.store.root().to_string();
        let mut watch = self.store.watch_prefix(&root, revision).await?;
        while let Some(batch) = watch.next_delta().await? {
            if batch.is_empty() {
                continue;
            }
            debug!(
                additions = batch.additions.len(),
                removals = batch.removals.len(),
                "applying delta batch"
            );
            self.topo.apply_delta(&batch);
        }
        Ok(())
    }
}
