//! Scheduler configuration.

use std::collections::HashMap;
use std::time::Duration;

/// Concurrency bounds and timing for the poll-and-dispatch loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hard cap on concurrent workers across all connectors.
    pub global_max: usize,
    /// Per-connector concurrency caps. Unknown connectors default to 1.
    pub per_connector_max: HashMap<String, usize>,
    /// How often the loop polls for pending tasks.
    pub poll_interval: Duration,
    /// TTL of the lease created when the scheduler claims a task.
    pub claim_ttl_seconds: i64,
    /// How long a worker holds a claim with no external command. Injection
    /// point for real execution.
    pub worker_duration: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_max: 10,
            per_connector_max: HashMap::from([("localexec".to_string(), 5)]),
            poll_interval: Duration::from_secs(1),
            claim_ttl_seconds: 300,
            worker_duration: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// The concurrency cap for a connector (1 if unconfigured).
    pub fn connector_limit(&self, name: &str) -> usize {
        self.per_connector_max.get(name).copied().unwrap_or(1)
    }
}
