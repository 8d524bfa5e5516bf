//! Engine worker pool.
//!
//! Holds the fixed set of media engine workers started at boot. Rooms are
//! placed with strict round-robin; the pool never grows or shrinks.
//!
//! Worker death is fatal for the whole process: every room routed by that
//! worker has lost its routing context. [`WorkerPool::spawn_death_monitors`]
//! turns each worker's `died()` future into a [`WorkerDeath`] event for the
//! binary to act on.

use crate::engine::EngineWorker;
use crate::errors::SessionError;
use crate::observability::metrics::record_worker_death;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A worker reported its own death.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDeath {
    pub worker_id: String,
    pub pid: u32,
    pub reason: String,
}

/// Fixed-size round-robin pool of engine workers.
pub struct WorkerPool {
    workers: Vec<Arc<dyn EngineWorker>>,
    next: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_ids())
            .field("next", &self.next)
            .finish()
    }
}

impl WorkerPool {
    /// Build a pool from already started workers.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Config` if `workers` is empty.
    pub fn new(workers: Vec<Arc<dyn EngineWorker>>) -> Result<Self, SessionError> {
        if workers.is_empty() {
            return Err(SessionError::Config(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        info!(target: "sc.workers", count = workers.len(), "Worker pool created");
        Ok(Self { workers, next: 0 })
    }

    /// Next worker in round-robin order.
    #[expect(
        clippy::indexing_slicing,
        reason = "pool is non-empty by construction and next is always reduced modulo len"
    )]
    pub fn acquire(&mut self) -> Arc<dyn EngineWorker> {
        let worker = Arc::clone(&self.workers[self.next]);
        self.next = (self.next + 1) % self.workers.len();
        worker
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[must_use]
    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.id().to_string()).collect()
    }

    /// Spawn one monitor task per worker. Each sends a [`WorkerDeath`] on
    /// `deaths` when its worker dies, or exits quietly on cancellation.
    pub fn spawn_death_monitors(
        &self,
        deaths: mpsc::Sender<WorkerDeath>,
        cancel_token: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.workers
            .iter()
            .map(|worker| {
                let worker = Arc::clone(worker);
                let deaths = deaths.clone();
                let cancel_token = cancel_token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        () = cancel_token.cancelled() => {}
                        reason = worker.died() => {
                            error!(
                                target: "sc.workers",
                                worker_id = %worker.id(),
                                pid = worker.pid(),
                                reason = %reason,
                                "Media worker died"
                            );
                            record_worker_death();
                            let _ = deaths
                                .send(WorkerDeath {
                                    worker_id: worker.id().to_string(),
                                    pid: worker.pid(),
                                    reason,
                                })
                                .await;
                        }
                    }
                })
            })
            .collect()
    }
}
