//! Task persistence: CRUD, the transactional claim paths, and release.

use chrono::Duration;
use rusqlite::{params, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Lease, Task, TaskStatus};

use super::{fmt_ts, now, parse_id, parse_ts, Store};

const TASK_COLUMNS: &str =
    "id, title, description, status, claimed_by, claimed_at, created_at, updated_at";

/// Raw row image; decoded into a [`Task`] after the query closure returns.
struct TaskRow {
    id: String,
    title: String,
    description: String,
    status: String,
    claimed_by: Option<String>,
    claimed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            status: row.get(3)?,
            claimed_by: row.get(4)?,
            claimed_at: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<Task, StoreError> {
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Decode(format!("task status {:?}", self.status)))?;
        Ok(Task {
            id: parse_id(&self.id)?,
            title: self.title,
            description: self.description,
            status,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

impl Store {
    /// Insert a new task in `pending`.
    pub fn create_task(&self, title: &str, description: &str) -> Result<Task, StoreError> {
        let created = now();
        let task = Task {
            id: Uuid::new_v4(),
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            created_at: created,
            updated_at: created,
        };

        let conn = self.conn();
        conn.execute(
            "INSERT INTO tasks (id, title, description, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task.id.to_string(),
                task.title,
                task.description,
                task.status.as_str(),
                fmt_ts(created),
                fmt_ts(created),
            ],
        )?;
        Ok(task)
    }

    /// Get a task by id.
    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                TaskRow::from_row,
            )
            .optional()?;
        row.map(TaskRow::decode).transpose()
    }

    /// List tasks, optionally filtered by status, newest first.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn();
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at DESC"
                ))?;
                let rows = stmt.query_map(params![status.as_str()], TaskRow::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC"
                ))?;
                let rows = stmt.query_map([], TaskRow::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        rows.into_iter().map(TaskRow::decode).collect()
    }

    /// Overwrite a task's status and bump `updated_at`. Idempotent.
    pub fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), fmt_ts(now()), id.to_string()],
        )?;
        Ok(())
    }

    /// Atomically claim a specific task and create its lease.
    ///
    /// Within one transaction: verifies the task exists and is `pending`,
    /// verifies no active lease exists, conditionally flips the row to
    /// `claimed` only if it is still `pending`, and inserts the lease. On any
    /// error nothing is persisted.
    pub fn claim_task_with_lease(
        &self,
        task_id: Uuid,
        holder_id: &str,
        ttl_seconds: i64,
    ) -> Result<(Task, Lease), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let claimed = claim_in_tx(&tx, task_id, holder_id, ttl_seconds)?;
        tx.commit()?;
        Ok(claimed)
    }

    /// Claim any pending task (oldest first) with the same transactional
    /// guarantees as [`Store::claim_task_with_lease`]. Returns `Ok(None)`
    /// when no pending task exists.
    pub fn atomic_claim_any_pending(
        &self,
        holder_id: &str,
        ttl_seconds: i64,
    ) -> Result<Option<(Task, Lease)>, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM tasks WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(candidate) = candidate else {
            return Ok(None);
        };

        let claimed = claim_in_tx(&tx, parse_id(&candidate)?, holder_id, ttl_seconds)?;
        tx.commit()?;
        Ok(Some(claimed))
    }

    /// Return a task to `pending`, clearing claim fields. A no-op on a task
    /// that is already pending.
    pub fn release_task(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE tasks SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
                    updated_at = ?1
             WHERE id = ?2",
            params![fmt_ts(now()), id.to_string()],
        )?;
        Ok(())
    }
}

/// Shared claim body for both claim paths. Runs entirely inside `tx`.
fn claim_in_tx(
    tx: &Transaction<'_>,
    task_id: Uuid,
    holder_id: &str,
    ttl_seconds: i64,
) -> Result<(Task, Lease), StoreError> {
    let claim_time = now();

    let row = tx
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id.to_string()],
            TaskRow::from_row,
        )
        .optional()?;
    let Some(row) = row else {
        return Err(StoreError::TaskNotClaimable);
    };
    let mut task = row.decode()?;
    if task.status != TaskStatus::Pending {
        return Err(StoreError::TaskNotClaimable);
    }

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM leases WHERE task_id = ?1 AND expires_at > ?2",
            params![task_id.to_string(), fmt_ts(claim_time)],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(StoreError::TaskAlreadyLeased);
    }

    // Compare-and-set: zero rows affected means another writer got here first.
    let updated = tx.execute(
        "UPDATE tasks SET status = 'claimed', claimed_by = ?1, claimed_at = ?2, updated_at = ?3
         WHERE id = ?4 AND status = 'pending'",
        params![
            holder_id,
            fmt_ts(claim_time),
            fmt_ts(claim_time),
            task_id.to_string(),
        ],
    )?;
    if updated == 0 {
        return Err(StoreError::TaskNotClaimable);
    }

    let lease = Lease {
        id: Uuid::new_v4(),
        task_id,
        holder_id: holder_id.to_string(),
        ttl_seconds,
        expires_at: claim_time + Duration::seconds(ttl_seconds),
        created_at: claim_time,
    };
    tx.execute(
        "INSERT INTO leases (id, task_id, holder_id, ttl_seconds, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            lease.id.to_string(),
            lease.task_id.to_string(),
            lease.holder_id,
            lease.ttl_seconds,
            fmt_ts(lease.expires_at),
            fmt_ts(lease.created_at),
        ],
    )?;

    task.status = TaskStatus::Claimed;
    task.claimed_by = Some(holder_id.to_string());
    task.claimed_at = Some(claim_time);
    task.updated_at = claim_time;
    Ok((task, lease))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_list_update() {
        let store = Store::open_in_memory().unwrap();

        let task = store.create_task("Test Task", "Test Description").unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.claimed_by.is_none());

        let got = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(got.title, "Test Task");
        assert_eq!(got.created_at, task.created_at);

        assert_eq!(store.list_tasks(None).unwrap().len(), 1);
        assert_eq!(store.list_tasks(Some(TaskStatus::Pending)).unwrap().len(), 1);
        assert_eq!(
            store.list_tasks(Some(TaskStatus::Completed)).unwrap().len(),
            0
        );

        store
            .update_task_status(task.id, TaskStatus::Completed)
            .unwrap();
        let got = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Completed);
        assert!(got.updated_at >= got.created_at);
    }

    #[test]
    fn get_missing_task_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_task(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn list_orders_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let first = store.create_task("first", "").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store.create_task("second", "").unwrap();

        let tasks = store.list_tasks(None).unwrap();
        assert_eq!(tasks[0].id, second.id);
        assert_eq!(tasks[1].id, first.id);
    }

    #[test]
    fn claim_with_lease_is_atomic() {
        let store = Store::open_in_memory().unwrap();
        let task = store.create_task("Test", "").unwrap();

        let (claimed, lease) = store
            .claim_task_with_lease(task.id, "holder-1", 300)
            .unwrap();
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.claimed_by.as_deref(), Some("holder-1"));
        assert_eq!(lease.holder_id, "holder-1");
        assert_eq!(lease.expires_at, lease.created_at + Duration::seconds(300));

        // Persisted state matches the returned values
        let got = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Claimed);
        let active = store.get_active_lease(task.id).unwrap().unwrap();
        assert_eq!(active.id, lease.id);
    }

    #[test]
    fn claim_missing_task_not_claimable() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .claim_task_with_lease(Uuid::new_v4(), "holder-1", 300)
            .unwrap_err();
        assert!(matches!(err, StoreError::TaskNotClaimable));
    }

    #[test]
    fn second_claim_fails_and_changes_nothing() {
        let store = Store::open_in_memory().unwrap();
        let task = store.create_task("Test", "").unwrap();

        store
            .claim_task_with_lease(task.id, "holder-1", 300)
            .unwrap();
        let err = store
            .claim_task_with_lease(task.id, "holder-2", 300)
            .unwrap_err();
        assert!(matches!(err, StoreError::TaskNotClaimable));

        let got = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(got.claimed_by.as_deref(), Some("holder-1"));
    }

    #[test]
    fn claim_rejects_non_pending_status() {
        let store = Store::open_in_memory().unwrap();
        let task = store.create_task("Test", "").unwrap();
        store
            .update_task_status(task.id, TaskStatus::Running)
            .unwrap();

        let err = store
            .claim_task_with_lease(task.id, "holder-1", 300)
            .unwrap_err();
        assert!(matches!(err, StoreError::TaskNotClaimable));

        let got = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Running);
    }

    #[test]
    fn terminal_tasks_cannot_be_reclaimed() {
        let store = Store::open_in_memory().unwrap();
        for status in [TaskStatus::Completed, TaskStatus::Failed] {
            let task = store.create_task("Test", "").unwrap();
            store.update_task_status(task.id, status).unwrap();
            let err = store
                .claim_task_with_lease(task.id, "holder-1", 300)
                .unwrap_err();
            assert!(matches!(err, StoreError::TaskNotClaimable));
        }
    }

    #[test]
    fn atomic_claim_takes_oldest_pending() {
        let store = Store::open_in_memory().unwrap();
        let oldest = store.create_task("oldest", "").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.create_task("newer", "").unwrap();

        let (task, lease) = store.atomic_claim_any_pending("worker-1", 300).unwrap().unwrap();
        assert_eq!(task.id, oldest.id);
        assert_eq!(lease.task_id, oldest.id);
    }

    #[test]
    fn atomic_claim_returns_none_when_drained() {
        let store = Store::open_in_memory().unwrap();
        for _ in 0..3 {
            store.create_task("Task", "Description").unwrap();
        }

        let mut claimed = Vec::new();
        while let Some((task, _)) = store.atomic_claim_any_pending("worker", 300).unwrap() {
            claimed.push(task.id);
        }
        assert_eq!(claimed.len(), 3);
        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), 3, "no task claimed twice");
    }

    #[test]
    fn concurrent_claims_each_win_exactly_one_task() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let store = Arc::new(Store::open_in_memory().unwrap());
        let task_count = 5;
        for _ in 0..task_count {
            store.create_task("Task", "Description").unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..10 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store
                    .atomic_claim_any_pending(&format!("worker-{worker}"), 300)
                    .unwrap()
                    .map(|(task, _)| task.id)
            }));
        }

        let claimed: Vec<Uuid> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        let distinct: HashSet<Uuid> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), task_count, "exactly min(N, M) claims succeed");
        assert_eq!(distinct.len(), task_count, "no double-claim");
    }

    #[test]
    fn release_returns_to_pending_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let task = store.create_task("Test", "").unwrap();

        let (_, lease) = store
            .claim_task_with_lease(task.id, "holder-1", 300)
            .unwrap();
        store.release_task(task.id).unwrap();
        store.delete_lease(lease.id).unwrap();

        let got = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Pending);
        assert!(got.claimed_by.is_none());
        assert!(got.claimed_at.is_none());
        assert!(store.get_active_lease(task.id).unwrap().is_none());
    }

    #[test]
    fn release_on_pending_task_is_a_noop() {
        let store = Store::open_in_memory().unwrap();
        let task = store.create_task("Test", "").unwrap();
        store.release_task(task.id).unwrap();
        let got = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Pending);
        assert!(got.claimed_by.is_none());
    }
}
