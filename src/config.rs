//! Daemon configuration. Values come from the environment with documented
//! defaults; the scheduler's own knobs live in [`crate::scheduler::SchedulerConfig`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::SchedulerConfig;

/// Top-level daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Scheduler concurrency and timing.
    pub scheduler: SchedulerConfig,
    /// Allowlist for the default local connector: `command → allowed first args`.
    pub allowlist: HashMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            scheduler: SchedulerConfig::default(),
            allowlist: default_allowlist(),
        }
    }
}

impl Config {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(path) = std::env::var_os("NEONA_DB") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(value) = env_parse::<usize>("NEONA_GLOBAL_MAX") {
            config.scheduler.global_max = value;
        }
        if let Some(value) = env_parse::<u64>("NEONA_POLL_INTERVAL_MS") {
            config.scheduler.poll_interval = Duration::from_millis(value);
        }
        if let Some(value) = env_parse::<i64>("NEONA_CLAIM_TTL") {
            config.scheduler.claim_ttl_seconds = value;
        }
        if let Some(value) = env_parse::<u64>("NEONA_WORKER_DURATION_MS") {
            config.scheduler.worker_duration = Duration::from_millis(value);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// `${HOME}/.neona/neona.db`, or a relative fallback when HOME is unset.
pub fn default_db_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".neona")
        .join("neona.db")
}

fn default_allowlist() -> HashMap<String, Vec<String>> {
    HashMap::from([
        ("go".to_string(), vec!["test".to_string()]),
        (
            "git".to_string(),
            vec!["diff".to_string(), "status".to_string()],
        ),
    ])
}
