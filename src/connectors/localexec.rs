//! Local command connector with a strict `(command, first-arg)` allowlist.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::ConnectorError;

use super::{Connector, ExecResult};

/// Connector that runs allowlisted commands as local subprocesses.
pub struct LocalExec {
    /// `command → allowed first arguments`. Anything not listed is rejected.
    allowlist: HashMap<String, Vec<String>>,
    /// Working directory for spawned commands (if None, uses cwd).
    work_dir: Option<PathBuf>,
}

impl LocalExec {
    /// Create a connector with the default allowlist:
    /// `go test`, `git diff`, `git status`.
    pub fn new() -> Self {
        let mut allowlist = HashMap::new();
        allowlist.insert("go".to_string(), vec!["test".to_string()]);
        allowlist.insert(
            "git".to_string(),
            vec!["diff".to_string(), "status".to_string()],
        );
        Self {
            allowlist,
            work_dir: None,
        }
    }

    /// Replace the allowlist entirely.
    pub fn with_allowlist(mut self, allowlist: HashMap<String, Vec<String>>) -> Self {
        self.allowlist = allowlist;
        self
    }

    /// Set the working directory for spawned commands.
    pub fn with_work_dir(mut self, dir: PathBuf) -> Self {
        self.work_dir = Some(dir);
        self
    }
}

impl Default for LocalExec {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for LocalExec {
    fn name(&self) -> &str {
        "localexec"
    }

    fn is_allowed(&self, command: &str, args: &[String]) -> bool {
        let Some(allowed_subcmds) = self.allowlist.get(command) else {
            return false;
        };
        let Some(first) = args.first() else {
            return false;
        };
        allowed_subcmds.iter().any(|allowed| allowed == first)
    }

    async fn execute(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<ExecResult, ConnectorError> {
        if !self.is_allowed(command, args) {
            return Err(ConnectorError::NotAllowed {
                command: format!("{command} {}", args.join(" ")),
            });
        }

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }

        debug!(command, ?args, "Executing allowlisted command");
        let output = cmd.output().await.map_err(|e| ConnectorError::Spawn {
            command: command.to_string(),
            source: e,
        })?;

        Ok(ExecResult {
            command: command.to_string(),
            args: args.to_vec(),
            // Killed-by-signal has no code; report -1 like an exec error
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
