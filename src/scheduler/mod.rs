//! Scheduler — polls the store for pending tasks and dispatches each claim to
//! an independent worker under global and per-connector concurrency caps.
//!
//! The poll loop is the only producer of worker spawns; external claims
//! through the control-plane service never consume scheduler capacity.

mod config;
mod worker;

pub use config::SchedulerConfig;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::PdrWriter;
use crate::connectors::Connector;
use crate::error::SchedulerError;
use crate::models::Outcome;
use crate::store::Store;

use worker::WorkerGuard;

/// Details about one live worker. Snapshots returned by
/// [`Scheduler::get_stats`] are deep copies, safe to serialize outside any
/// lock.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub task_id: Uuid,
    pub task_title: String,
    pub lease_id: Uuid,
    pub lease_expires: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub connector_name: String,
}

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub active_workers: usize,
    pub global_max: usize,
    pub connector_counts: HashMap<String, usize>,
    pub workers: Vec<WorkerInfo>,
}

/// Worker-pool bookkeeping, guarded by one mutex. The lock is never held
/// across a store call.
#[derive(Default)]
struct PoolState {
    active_workers: usize,
    connector_counts: HashMap<String, usize>,
    workers: HashMap<String, WorkerInfo>,
}

/// Start/stop lifecycle. Restart after stop is not supported, so worker
/// lifetimes never span two loop generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Shared pieces the poll loop and dispatch path need; cheap to clone into
/// the loop task.
#[derive(Clone)]
struct Core {
    store: Arc<Store>,
    pdr: PdrWriter,
    connector: Arc<dyn Connector>,
    config: SchedulerConfig,
    pool: Arc<Mutex<PoolState>>,
    cancel: CancellationToken,
}

/// Inputs hashed into the dispatch audit record.
#[derive(Serialize)]
struct DispatchInputs<'a> {
    task_id: Uuid,
    worker_id: &'a str,
    connector: &'a str,
}

/// Manages the poll loop and the bag of live workers.
pub struct Scheduler {
    core: Core,
    lifecycle: Mutex<Lifecycle>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler. Nothing runs until [`Scheduler::start`].
    pub fn new(
        store: Arc<Store>,
        pdr: PdrWriter,
        connector: Arc<dyn Connector>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            core: Core {
                store,
                pdr,
                connector,
                config,
                pool: Arc::new(Mutex::new(PoolState::default())),
                cancel: CancellationToken::new(),
            },
            lifecycle: Mutex::new(Lifecycle::Idle),
            loop_handle: Mutex::new(None),
        }
    }

    /// Begin the poll loop. Errors if already running or previously stopped.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock().expect("scheduler lifecycle poisoned");
        match *lifecycle {
            Lifecycle::Idle => *lifecycle = Lifecycle::Running,
            Lifecycle::Running => return Err(SchedulerError::AlreadyRunning),
            Lifecycle::Stopped => return Err(SchedulerError::Stopped),
        }
        drop(lifecycle);

        let core = self.core.clone();
        let handle = tokio::spawn(run_loop(core));
        *self.loop_handle.lock().expect("scheduler handle poisoned") = Some(handle);
        info!("Scheduler started");
        Ok(())
    }

    /// Stop the poll loop, propagate cancellation to every live worker, and
    /// wait for all of them to return. The scheduler cannot be restarted.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        {
            let mut lifecycle = self.lifecycle.lock().expect("scheduler lifecycle poisoned");
            match *lifecycle {
                Lifecycle::Running => *lifecycle = Lifecycle::Stopped,
                Lifecycle::Idle => return Err(SchedulerError::NotRunning),
                Lifecycle::Stopped => return Err(SchedulerError::Stopped),
            }
        }

        self.core.cancel.cancel();
        let handle = self
            .loop_handle
            .lock()
            .expect("scheduler handle poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler loop task failed");
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }

    /// Deep-copied view of the worker pool.
    pub fn get_stats(&self) -> SchedulerStats {
        let state = self.core.pool.lock().expect("scheduler pool mutex poisoned");
        SchedulerStats {
            active_workers: state.active_workers,
            global_max: self.core.config.global_max,
            connector_counts: state.connector_counts.clone(),
            workers: state.workers.values().cloned().collect(),
        }
    }

    /// Snapshot of all live workers.
    pub fn get_workers(&self) -> Vec<WorkerInfo> {
        let state = self.core.pool.lock().expect("scheduler pool mutex poisoned");
        state.workers.values().cloned().collect()
    }
}

/// Poll loop body: tick, dispatch, reap; on cancellation drain every worker
/// before returning so `stop()` observes a quiesced pool.
async fn run_loop(core: Core) {
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut ticker = tokio::time::interval(core.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = core.cancel.cancelled() => break,
            _ = ticker.tick() => {
                poll_and_dispatch(&core, &mut workers);
                // Reap workers that have already finished
                while workers.try_join_next().is_some() {}
            }
        }
    }

    while workers.join_next().await.is_some() {}
}

/// One scheduling attempt: admission control, atomic claim, audit, spawn.
fn poll_and_dispatch(core: &Core, workers: &mut JoinSet<()>) {
    let connector_name = core.connector.name().to_string();
    {
        let state = core.pool.lock().expect("scheduler pool mutex poisoned");
        if state.active_workers >= core.config.global_max {
            return;
        }
        let connector_count = state
            .connector_counts
            .get(&connector_name)
            .copied()
            .unwrap_or(0);
        if connector_count >= core.config.connector_limit(&connector_name) {
            return;
        }
    }

    let worker_id = Uuid::new_v4().to_string();
    let claimed = match core
        .store
        .atomic_claim_any_pending(&worker_id, core.config.claim_ttl_seconds)
    {
        Ok(Some(claimed)) => claimed,
        Ok(None) => return, // no pending tasks
        Err(e) => {
            warn!(error = %e, "Error claiming task");
            return;
        }
    };
    let (task, lease) = claimed;

    let dispatch = DispatchInputs {
        task_id: task.id,
        worker_id: &worker_id,
        connector: &connector_name,
    };
    if let Err(e) = core.pdr.record(
        "task.dispatch",
        &dispatch,
        Outcome::Success,
        Some(task.id),
        Some(&format!("Dispatched to worker {worker_id}")),
    ) {
        warn!(task = %task.id, error = %e, "Failed to write dispatch audit record");
    }

    info!(task = %task.id, title = %task.title, worker = %worker_id, "Dispatched task");

    let guard = WorkerGuard::register(
        Arc::clone(&core.pool),
        WorkerInfo {
            worker_id: worker_id.clone(),
            task_id: task.id,
            task_title: task.title.clone(),
            lease_id: lease.id,
            lease_expires: lease.expires_at,
            started_at: Utc::now(),
            connector_name,
        },
    );

    workers.spawn(worker::run(
        Arc::clone(&core.store),
        core.cancel.clone(),
        core.config.worker_duration,
        task,
        lease,
        worker_id,
        guard,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::LocalExec;

    fn scheduler() -> Scheduler {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let pdr = PdrWriter::new(Arc::clone(&store));
        Scheduler::new(store, pdr, Arc::new(LocalExec::new()), SchedulerConfig::default())
    }

    #[tokio::test]
    async fn start_is_not_idempotent() {
        let sch = scheduler();
        sch.start().unwrap();
        assert!(matches!(sch.start(), Err(SchedulerError::AlreadyRunning)));
        sch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_before_start_is_an_error() {
        let sch = scheduler();
        assert!(matches!(sch.stop().await, Err(SchedulerError::NotRunning)));
    }

    #[tokio::test]
    async fn restart_after_stop_is_rejected() {
        let sch = scheduler();
        sch.start().unwrap();
        sch.stop().await.unwrap();
        assert!(matches!(sch.start(), Err(SchedulerError::Stopped)));
        assert!(matches!(sch.stop().await, Err(SchedulerError::Stopped)));
    }

    #[tokio::test]
    async fn stats_start_empty() {
        let sch = scheduler();
        let stats = sch.get_stats();
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.global_max, 10);
        assert!(stats.workers.is_empty());
        assert!(sch.get_workers().is_empty());
    }
}
