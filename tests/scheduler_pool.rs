//! Scheduler integration tests: parallel dispatch, concurrency budgets, and
//! stop-drain behavior. Assertions poll for expected state with a deadline
//! instead of assuming scheduling latency.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use neona::audit::PdrWriter;
use neona::connectors::{Connector, ExecResult};
use neona::error::ConnectorError;
use neona::models::TaskStatus;
use neona::scheduler::{Scheduler, SchedulerConfig};
use neona::store::Store;

/// Permissive connector for scheduler tests.
struct MockConnector {
    name: &'static str,
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &str {
        self.name
    }

    fn is_allowed(&self, _command: &str, _args: &[String]) -> bool {
        true
    }

    async fn execute(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<ExecResult, ConnectorError> {
        Ok(ExecResult {
            command: command.to_string(),
            args: args.to_vec(),
            exit_code: 0,
            stdout: "mock output".to_string(),
            stderr: String::new(),
        })
    }
}

fn setup(config: SchedulerConfig) -> (Arc<Store>, Scheduler) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let pdr = PdrWriter::new(Arc::clone(&store));
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        pdr,
        Arc::new(MockConnector { name: "test" }),
        config,
    );
    (store, scheduler)
}

/// Poll `check` every 50 ms until it returns true or the deadline passes.
async fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_workers_hold_ten_tasks_in_parallel() {
    let (store, scheduler) = setup(SchedulerConfig {
        global_max: 10,
        per_connector_max: HashMap::from([("test".to_string(), 10)]),
        poll_interval: Duration::from_millis(50),
        claim_ttl_seconds: 300,
        // Long enough to keep all 10 tasks claimed simultaneously
        worker_duration: Duration::from_secs(15),
    });

    for _ in 0..10 {
        store.create_task("Parallel Task", "Description").unwrap();
    }

    scheduler.start().unwrap();

    let saturated = wait_for(Duration::from_secs(30), || {
        scheduler.get_stats().active_workers == 10
    })
    .await;
    assert!(saturated, "timed out waiting for 10 active workers");

    let stats = scheduler.get_stats();
    assert_eq!(stats.active_workers, 10);
    assert_eq!(stats.workers.len(), 10);
    assert_eq!(stats.connector_counts["test"], 10);

    // Every task is claimed by a distinct holder, each with an active lease
    let tasks = store.list_tasks(None).unwrap();
    let mut holders = HashSet::new();
    for task in &tasks {
        assert_eq!(task.status, TaskStatus::Claimed, "task {} not claimed", task.id);
        let holder = task.claimed_by.clone().expect("claimed task has a holder");
        assert!(holders.insert(holder), "holder claimed two tasks");

        let lease = store
            .get_active_lease(task.id)
            .unwrap()
            .expect("claimed task has an active lease");
        assert_eq!(Some(lease.holder_id), task.claimed_by);
    }
    assert_eq!(holders.len(), 10);

    scheduler.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_cap_is_never_exceeded() {
    let (store, scheduler) = setup(SchedulerConfig {
        global_max: 3,
        per_connector_max: HashMap::from([("test".to_string(), 10)]),
        poll_interval: Duration::from_millis(20),
        claim_ttl_seconds: 300,
        worker_duration: Duration::from_millis(100),
    });

    for _ in 0..10 {
        store.create_task("Task", "Description").unwrap();
    }

    scheduler.start().unwrap();

    // Sample for a while under churn: the cap must hold at every observation
    let start = Instant::now();
    let mut saw_workers = false;
    while start.elapsed() < Duration::from_secs(3) {
        let stats = scheduler.get_stats();
        assert!(
            stats.active_workers <= 3,
            "active workers {} exceeded global max",
            stats.active_workers
        );
        assert_eq!(stats.active_workers, stats.workers.len());
        saw_workers |= stats.active_workers > 0;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saw_workers, "scheduler never dispatched anything");

    scheduler.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_connector_cap_overrides_global_headroom() {
    let (store, scheduler) = setup(SchedulerConfig {
        global_max: 10,
        per_connector_max: HashMap::from([("test".to_string(), 2)]),
        poll_interval: Duration::from_millis(20),
        claim_ttl_seconds: 300,
        worker_duration: Duration::from_secs(10),
    });

    for _ in 0..6 {
        store.create_task("Task", "Description").unwrap();
    }

    scheduler.start().unwrap();

    let reached = wait_for(Duration::from_secs(10), || {
        scheduler.get_stats().active_workers == 2
    })
    .await;
    assert!(reached, "never reached the per-connector cap");

    // Hold for a few more polls: the count must stay pinned at the cap
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = scheduler.get_stats();
    assert_eq!(stats.active_workers, 2);
    assert_eq!(stats.connector_counts["test"], 2);

    scheduler.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_interrupts_workers_and_restores_pending() {
    let (store, scheduler) = setup(SchedulerConfig {
        global_max: 5,
        per_connector_max: HashMap::from([("test".to_string(), 5)]),
        poll_interval: Duration::from_millis(20),
        claim_ttl_seconds: 300,
        worker_duration: Duration::from_secs(60),
    });

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(store.create_task("Task", "Description").unwrap().id);
    }

    scheduler.start().unwrap();
    let dispatched = wait_for(Duration::from_secs(10), || {
        scheduler.get_stats().active_workers == 3
    })
    .await;
    assert!(dispatched, "workers never started");

    // Stop waits for every worker's release path to finish
    scheduler.stop().await.unwrap();

    let stats = scheduler.get_stats();
    assert_eq!(stats.active_workers, 0);
    assert!(stats.workers.is_empty());

    for id in ids {
        let task = store.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.claimed_by.is_none());
        assert!(store.get_active_lease(id).unwrap().is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_complete_tasks_and_free_capacity() {
    let (store, scheduler) = setup(SchedulerConfig {
        global_max: 5,
        per_connector_max: HashMap::from([("test".to_string(), 5)]),
        poll_interval: Duration::from_millis(20),
        claim_ttl_seconds: 300,
        worker_duration: Duration::from_millis(100),
    });

    let a = store.create_task("A", "").unwrap().id;
    let b = store.create_task("B", "").unwrap().id;

    scheduler.start().unwrap();

    let done = wait_for(Duration::from_secs(10), || {
        [a, b].iter().all(|id| {
            store.get_task(*id).unwrap().unwrap().status == TaskStatus::Completed
        })
    })
    .await;
    assert!(done, "tasks never completed");

    // Leases are gone and the pool drains back to zero
    assert!(store.get_active_lease(a).unwrap().is_none());
    assert!(store.get_active_lease(b).unwrap().is_none());
    let drained = wait_for(Duration::from_secs(5), || {
        scheduler.get_stats().active_workers == 0
    })
    .await;
    assert!(drained, "worker counters leaked");

    // Every dispatch left an audit record with a non-empty hash
    for id in [a, b] {
        let records = store.get_pdrs_for_task(id).unwrap();
        let dispatch = records
            .iter()
            .find(|r| r.action == "task.dispatch")
            .expect("dispatch audit record");
        assert!(!dispatch.inputs_hash.is_empty());
        assert_eq!(dispatch.task_id, Some(id));
    }

    scheduler.stop().await.unwrap();
}
