//! Run rows: one per command execution attempt, finalized with outputs.

use rusqlite::{params, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::Run;

use super::{fmt_ts, now, parse_id, parse_ts, Store};

struct RunRow {
    id: String,
    task_id: String,
    command: String,
    args: Option<String>,
    exit_code: Option<i32>,
    stdout: Option<String>,
    stderr: Option<String>,
    started_at: String,
    ended_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            command: row.get(2)?,
            args: row.get(3)?,
            exit_code: row.get(4)?,
            stdout: row.get(5)?,
            stderr: row.get(6)?,
            started_at: row.get(7)?,
            ended_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<Run, StoreError> {
        let args = match self.args.as_deref() {
            Some(json) if !json.is_empty() => serde_json::from_str(json)?,
            _ => Vec::new(),
        };
        Ok(Run {
            id: parse_id(&self.id)?,
            task_id: parse_id(&self.task_id)?,
            command: self.command,
            args,
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
            started_at: parse_ts(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

impl Store {
    /// Insert a run row for a command about to execute.
    pub fn create_run(
        &self,
        task_id: Uuid,
        command: &str,
        args: &[String],
    ) -> Result<Run, StoreError> {
        let started = now();
        let run = Run {
            id: Uuid::new_v4(),
            task_id,
            command: command.to_string(),
            args: args.to_vec(),
            exit_code: None,
            stdout: None,
            stderr: None,
            started_at: started,
            ended_at: None,
        };

        let args_json = serde_json::to_string(&run.args)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO runs (id, task_id, command, args, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.id.to_string(),
                run.task_id.to_string(),
                run.command,
                args_json,
                fmt_ts(started),
            ],
        )?;
        Ok(run)
    }

    /// Finalize a run with its exit code and captured output.
    pub fn update_run(
        &self,
        id: Uuid,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE runs SET exit_code = ?1, stdout = ?2, stderr = ?3, ended_at = ?4
             WHERE id = ?5",
            params![exit_code, stdout, stderr, fmt_ts(now()), id.to_string()],
        )?;
        Ok(())
    }

    /// All runs for a task, newest first.
    pub fn get_runs_for_task(&self, task_id: Uuid) -> Result<Vec<Run>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, command, args, exit_code, stdout, stderr, started_at, ended_at
             FROM runs WHERE task_id = ?1 ORDER BY started_at DESC",
        )?;
        let rows = stmt
            .query_map(params![task_id.to_string()], RunRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RunRow::decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_update_and_list() {
        let store = Store::open_in_memory().unwrap();
        let task = store.create_task("Test", "").unwrap();

        let run = store
            .create_run(task.id, "git", &["status".to_string()])
            .unwrap();
        assert!(run.exit_code.is_none());

        store.update_run(run.id, 0, "stdout content", "").unwrap();

        let runs = store.get_runs_for_task(task.id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].command, "git");
        assert_eq!(runs[0].args, vec!["status".to_string()]);
        assert_eq!(runs[0].exit_code, Some(0));
        assert_eq!(runs[0].stdout.as_deref(), Some("stdout content"));
        assert!(runs[0].ended_at.is_some());
    }

    #[test]
    fn runs_for_other_tasks_are_excluded() {
        let store = Store::open_in_memory().unwrap();
        let a = store.create_task("a", "").unwrap();
        let b = store.create_task("b", "").unwrap();
        store.create_run(a.id, "go", &["test".to_string()]).unwrap();

        assert_eq!(store.get_runs_for_task(a.id).unwrap().len(), 1);
        assert!(store.get_runs_for_task(b.id).unwrap().is_empty());
    }
}
