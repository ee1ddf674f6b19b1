//! Observable lifecycle for long-lived background workers.
//!
//! A worker that dies must be visible to its supervisor: each worker owns
//! a watch sender and flips it to `Stopped` with a reason on the way out,
//! so the daemon can log, alert, or exit instead of running blind.

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Stopped { reason: String },
}

impl WorkerStatus {
    /// The stop reason, once the worker has stopped.
    pub fn stop_reason(&self) -> Option<&str> {
        match self {
            WorkerStatus::Running => None,
            WorkerStatus::Stopped { reason } => Some(reason),
        }
    }
}

pub fn status_channel() -> (watch::Sender<WorkerStatus>, watch::Receiver<WorkerStatus>) {
    watch::channel(WorkerStatus::Running)
}
