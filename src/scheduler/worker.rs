//! Worker task: honor a claim until completion or cancellation, then restore
//! store invariants and free scheduler capacity.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::models::{Lease, Task, TaskStatus};
use crate::store::Store;

use super::{PoolState, WorkerInfo};

/// Capacity reservation for one worker.
///
/// Registration increments the pool counters; dropping the guard decrements
/// them and removes the `WorkerInfo`, on every exit path including a panic in
/// the worker body.
pub(super) struct WorkerGuard {
    pool: Arc<Mutex<PoolState>>,
    worker_id: String,
    connector_name: String,
}

impl WorkerGuard {
    pub(super) fn register(pool: Arc<Mutex<PoolState>>, info: WorkerInfo) -> Self {
        let guard = Self {
            pool,
            worker_id: info.worker_id.clone(),
            connector_name: info.connector_name.clone(),
        };
        let mut state = guard.pool.lock().expect("scheduler pool mutex poisoned");
        state.active_workers += 1;
        *state
            .connector_counts
            .entry(info.connector_name.clone())
            .or_insert(0) += 1;
        state.workers.insert(info.worker_id.clone(), info);
        drop(state);
        guard
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut state = self.pool.lock().expect("scheduler pool mutex poisoned");
        // Counters first, then the info entry
        state.active_workers = state.active_workers.saturating_sub(1);
        if let Some(count) = state.connector_counts.get_mut(&self.connector_name) {
            *count = count.saturating_sub(1);
        }
        state.workers.remove(&self.worker_id);
    }
}

/// Hold the claim for `worker_duration` or until cancellation, then either
/// complete the task or return it to pending, and always delete the lease.
pub(super) async fn run(
    store: Arc<Store>,
    cancel: CancellationToken,
    worker_duration: Duration,
    task: Task,
    lease: Lease,
    worker_id: String,
    _guard: WorkerGuard,
) {
    debug!(worker = %worker_id, task = %task.id, title = %task.title, "Worker holding task");

    let mut released = false;
    tokio::select! {
        _ = cancel.cancelled() => {
            info!(worker = %worker_id, task = %task.id, "Worker interrupted, releasing task");
            released = true;
        }
        _ = tokio::time::sleep(worker_duration) => {
            match store.update_task_status(task.id, TaskStatus::Completed) {
                Ok(()) => info!(worker = %worker_id, task = %task.id, "Worker completed task"),
                Err(e) => {
                    error!(worker = %worker_id, task = %task.id, error = %e, "Error completing task");
                    released = true;
                }
            }
        }
    }

    // Release the task before deleting the lease: an observer sees either
    // (claimed, live lease) or (pending, no lease), never (claimed, no lease).
    if released {
        if let Err(e) = store.release_task(task.id) {
            error!(worker = %worker_id, task = %task.id, error = %e, "Error releasing task");
        }
    }
    if let Err(e) = store.delete_lease(lease.id) {
        error!(worker = %worker_id, lease = %lease.id, error = %e, "Error deleting lease");
    }

    // _guard drops here: counters decremented, WorkerInfo removed
}
