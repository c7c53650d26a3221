//! Connector contract — pluggable, allowlist-checked command execution.

pub mod localexec;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

pub use localexec::LocalExec;

/// Result of a command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub command: String,
    pub args: Vec<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Executes commands on behalf of a task holder.
///
/// Implementations must gate `execute` on `is_allowed` and reject with
/// [`ConnectorError::NotAllowed`] before spawning anything.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connector identifier used for per-connector concurrency accounting.
    fn name(&self) -> &str;

    /// Whether the command (with its arguments) may be executed.
    fn is_allowed(&self, command: &str, args: &[String]) -> bool;

    /// Run a command and capture its output. Cancellation follows the tokio
    /// norm: dropping the returned future kills the child.
    async fn execute(&self, command: &str, args: &[String])
        -> Result<ExecResult, ConnectorError>;
}
