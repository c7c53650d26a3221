//! Control-plane service — orchestrates the store, audit writer, and
//! connector for externally driven verbs. Each state-changing verb writes one
//! audit record, including failed precondition attempts.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::audit::PdrWriter;
use crate::connectors::Connector;
use crate::error::{ServiceError, StoreError};
use crate::models::{Lease, Lock, MemoryItem, Outcome, Run, Task, TaskStatus};
use crate::store::Store;

#[derive(Serialize)]
struct CreateInputs<'a> {
    title: &'a str,
}

#[derive(Serialize)]
struct ClaimInputs<'a> {
    task_id: Uuid,
    holder_id: &'a str,
    ttl: i64,
}

#[derive(Serialize)]
struct ReleaseInputs<'a> {
    task_id: Uuid,
    holder_id: &'a str,
}

#[derive(Serialize)]
struct RunInputs<'a> {
    task_id: Uuid,
    command: &'a str,
    args: &'a [String],
}

#[derive(Serialize)]
struct MemoryInputs {
    task_id: Option<Uuid>,
    content_len: usize,
}

#[derive(Serialize)]
struct LockInputs<'a> {
    resource_id: &'a str,
    holder_id: &'a str,
}

#[derive(Serialize)]
struct UnlockInputs {
    lock_id: Uuid,
}

/// The in-process contract consumed by external adapters (HTTP, CLI, TUI).
pub struct Service {
    store: Arc<Store>,
    pdr: PdrWriter,
    connector: Arc<dyn Connector>,
}

impl Service {
    pub fn new(store: Arc<Store>, pdr: PdrWriter, connector: Arc<dyn Connector>) -> Self {
        Self {
            store,
            pdr,
            connector,
        }
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// Create a new task.
    pub fn create_task(&self, title: &str, description: &str) -> Result<Task, ServiceError> {
        let task = self.store.create_task(title, description)?;
        self.audit(
            "task.create",
            &CreateInputs { title },
            Outcome::Success,
            Some(task.id),
            None,
        );
        Ok(task)
    }

    /// Get a task by id.
    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>, ServiceError> {
        Ok(self.store.get_task(id)?)
    }

    /// List tasks, optionally filtered by status.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, ServiceError> {
        Ok(self.store.list_tasks(status)?)
    }

    /// Claim a task with a lease on behalf of an external holder.
    pub fn claim_task(
        &self,
        task_id: Uuid,
        holder_id: &str,
        ttl_seconds: i64,
    ) -> Result<Lease, ServiceError> {
        let inputs = ClaimInputs {
            task_id,
            holder_id,
            ttl: ttl_seconds,
        };

        if self.store.get_active_lease(task_id)?.is_some() {
            self.audit("task.claim", &inputs, Outcome::Failed, Some(task_id), None);
            return Err(ServiceError::AlreadyClaimed);
        }

        match self.store.claim_task_with_lease(task_id, holder_id, ttl_seconds) {
            Ok((_, lease)) => {
                self.audit("task.claim", &inputs, Outcome::Success, Some(task_id), None);
                Ok(lease)
            }
            Err(e) => {
                self.audit("task.claim", &inputs, Outcome::Failed, Some(task_id), None);
                // A lease that appeared since the pre-check is the same
                // conflict at the verb level
                match e {
                    StoreError::TaskAlreadyLeased => Err(ServiceError::AlreadyClaimed),
                    other => Err(other.into()),
                }
            }
        }
    }

    /// Release a claim. The caller must be the active lease holder.
    pub fn release_task(&self, task_id: Uuid, holder_id: &str) -> Result<(), ServiceError> {
        let inputs = ReleaseInputs { task_id, holder_id };

        let lease = match self.store.get_active_lease(task_id)? {
            Some(lease) => lease,
            None => {
                self.audit("task.release", &inputs, Outcome::Failed, Some(task_id), None);
                return Err(ServiceError::NoLease);
            }
        };
        if lease.holder_id != holder_id {
            self.audit("task.release", &inputs, Outcome::Failed, Some(task_id), None);
            return Err(ServiceError::NotOwner);
        }

        // Pending-before-leaseless, same ordering as the worker exit path
        self.store.release_task(task_id)?;
        self.store.delete_lease(lease.id)?;

        self.audit("task.release", &inputs, Outcome::Success, Some(task_id), None);
        Ok(())
    }

    /// Renew the caller's lease (heartbeat).
    pub fn renew_lease(
        &self,
        task_id: Uuid,
        holder_id: &str,
        ttl_seconds: i64,
    ) -> Result<(), ServiceError> {
        let lease = self
            .store
            .get_active_lease(task_id)?
            .ok_or(ServiceError::NotOwner)?;
        if lease.holder_id != holder_id {
            return Err(ServiceError::NotOwner);
        }
        Ok(self.store.renew_lease(lease.id, ttl_seconds)?)
    }

    /// Execute a command for a claimed task through the connector.
    ///
    /// Classification: exec error → `error`/exit −1; exit 0 → `success`;
    /// nonzero exit → `failed`. The task ends `completed` on success and
    /// `failed` otherwise.
    pub async fn run_task(
        &self,
        task_id: Uuid,
        holder_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<Run, ServiceError> {
        let inputs = RunInputs {
            task_id,
            command,
            args,
        };

        match self.store.get_active_lease(task_id)? {
            Some(lease) if lease.holder_id == holder_id => {}
            _ => {
                self.audit("task.run", &inputs, Outcome::Failed, Some(task_id), None);
                return Err(ServiceError::NotOwner);
            }
        }

        self.store.update_task_status(task_id, TaskStatus::Running)?;
        let mut run = self.store.create_run(task_id, command, args)?;

        let (outcome, exit_code, stdout, stderr) =
            match self.connector.execute(command, args).await {
                Ok(result) => {
                    let outcome = if result.exit_code == 0 {
                        Outcome::Success
                    } else {
                        Outcome::Failed
                    };
                    (outcome, result.exit_code, result.stdout, result.stderr)
                }
                Err(e) => (Outcome::Error, -1, String::new(), e.to_string()),
            };

        self.store.update_run(run.id, exit_code, &stdout, &stderr)?;

        let final_status = if outcome == Outcome::Success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.store.update_task_status(task_id, final_status)?;

        self.audit("task.run", &inputs, outcome, Some(task_id), None);

        // Best-effort memory note summarizing the run
        let note = format!("Run: {command} {}\nOutput: {stdout}", args.join(" "));
        if let Err(e) = self.store.add_memory(Some(task_id), &note, "run,log") {
            warn!(task = %task_id, error = %e, "Failed to append run memory note");
        }

        run.exit_code = Some(exit_code);
        run.stdout = Some(stdout);
        run.stderr = Some(stderr);
        Ok(run)
    }

    /// Run history for a task, newest first.
    pub fn get_task_logs(&self, task_id: Uuid) -> Result<Vec<Run>, ServiceError> {
        Ok(self.store.get_runs_for_task(task_id)?)
    }

    // ── Memory ──────────────────────────────────────────────────────

    /// Append a memory item.
    pub fn add_memory(
        &self,
        task_id: Option<Uuid>,
        content: &str,
        tags: &str,
    ) -> Result<MemoryItem, ServiceError> {
        let item = self.store.add_memory(task_id, content, tags)?;
        self.audit(
            "memory.add",
            &MemoryInputs {
                task_id,
                content_len: content.len(),
            },
            Outcome::Success,
            task_id,
            None,
        );
        Ok(item)
    }

    /// Substring search over memory content.
    pub fn query_memory(&self, term: &str) -> Result<Vec<MemoryItem>, ServiceError> {
        Ok(self.store.query_memory(term)?)
    }

    /// Memory items attached to a task.
    pub fn get_task_memory(&self, task_id: Uuid) -> Result<Vec<MemoryItem>, ServiceError> {
        Ok(self.store.get_memory_for_task(task_id)?)
    }

    // ── Locks ───────────────────────────────────────────────────────

    /// Acquire a named resource lock.
    pub fn acquire_lock(
        &self,
        resource_id: &str,
        holder_id: &str,
        lock_type: &str,
        ttl_seconds: i64,
    ) -> Result<Lock, ServiceError> {
        let inputs = LockInputs {
            resource_id,
            holder_id,
        };
        match self
            .store
            .acquire_lock(resource_id, holder_id, lock_type, ttl_seconds)
        {
            Ok(lock) => {
                self.audit("lock.acquire", &inputs, Outcome::Success, None, None);
                Ok(lock)
            }
            Err(e) => {
                self.audit("lock.acquire", &inputs, Outcome::Failed, None, None);
                Err(e.into())
            }
        }
    }

    /// Release a lock by id.
    pub fn release_lock(&self, lock_id: Uuid) -> Result<(), ServiceError> {
        self.store.release_lock(lock_id)?;
        self.audit(
            "lock.release",
            &UnlockInputs { lock_id },
            Outcome::Success,
            None,
            None,
        );
        Ok(())
    }

    // ── Health ──────────────────────────────────────────────────────

    /// Store health probe.
    pub fn ping(&self) -> Result<(), ServiceError> {
        Ok(self.store.ping()?)
    }

    /// Write an audit record, logging rather than masking a failed write.
    fn audit<T: Serialize>(
        &self,
        action: &str,
        inputs: &T,
        outcome: Outcome,
        task_id: Option<Uuid>,
        details: Option<&str>,
    ) {
        if let Err(e) = self.pdr.record(action, inputs, outcome, task_id, details) {
            warn!(action, error = %e, "Failed to write audit record");
        }
    }
}
