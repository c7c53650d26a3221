//! Error types for the control plane.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable-store errors. The first three are precondition/conflict sentinels
/// surfaced verbatim to callers; the rest are storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task missing, or not in `pending`, or lost the compare-and-set race.
    #[error("task not found or not claimable")]
    TaskNotClaimable,

    /// An active lease already references the task.
    #[error("task already has an active lease")]
    TaskAlreadyLeased,

    /// A non-expired lock exists for the resource.
    #[error("resource already locked")]
    ResourceLocked,

    #[error("create db directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialize stored value: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("decode stored row: {0}")]
    Decode(String),
}

/// Control-plane verb errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("task already claimed")]
    AlreadyClaimed,

    #[error("no active lease")]
    NoLease,

    #[error("not the lease owner")]
    NotOwner,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Connector execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("command not allowed: {command}")]
    NotAllowed { command: String },

    #[error("spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

/// Scheduler lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler already running")]
    AlreadyRunning,

    #[error("scheduler is not running")]
    NotRunning,

    #[error("scheduler was stopped and cannot be restarted")]
    Stopped,
}

/// Result type alias for the control plane.
pub type Result<T> = std::result::Result<T, Error>;
