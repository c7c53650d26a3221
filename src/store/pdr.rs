//! Append-only Process Decision Records. Inserted, never updated or deleted.

use rusqlite::{params, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{AuditRecord, Outcome};

use super::{fmt_ts, now, parse_id, parse_ts, Store};

struct PdrRow {
    id: String,
    action: String,
    inputs_hash: String,
    outcome: String,
    task_id: Option<String>,
    details: Option<String>,
    timestamp: String,
}

impl PdrRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            action: row.get(1)?,
            inputs_hash: row.get(2)?,
            outcome: row.get(3)?,
            task_id: row.get(4)?,
            details: row.get(5)?,
            timestamp: row.get(6)?,
        })
    }

    fn decode(self) -> Result<AuditRecord, StoreError> {
        let outcome = match self.outcome.as_str() {
            "success" => Outcome::Success,
            "failed" => Outcome::Failed,
            "error" => Outcome::Error,
            other => return Err(StoreError::Decode(format!("pdr outcome {other:?}"))),
        };
        Ok(AuditRecord {
            id: parse_id(&self.id)?,
            action: self.action,
            inputs_hash: self.inputs_hash,
            outcome,
            task_id: self.task_id.as_deref().map(parse_id).transpose()?,
            details: self.details,
            timestamp: parse_ts(&self.timestamp)?,
        })
    }
}

impl Store {
    /// Append an audit record.
    pub fn write_pdr(
        &self,
        action: &str,
        inputs_hash: &str,
        outcome: Outcome,
        task_id: Option<Uuid>,
        details: Option<&str>,
    ) -> Result<AuditRecord, StoreError> {
        let timestamp = now();
        let record = AuditRecord {
            id: Uuid::new_v4(),
            action: action.to_string(),
            inputs_hash: inputs_hash.to_string(),
            outcome,
            task_id,
            details: details.map(str::to_string),
            timestamp,
        };

        let conn = self.conn();
        conn.execute(
            "INSERT INTO pdr (id, action, inputs_hash, outcome, task_id, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.to_string(),
                record.action,
                record.inputs_hash,
                record.outcome.as_str(),
                record.task_id.map(|id| id.to_string()),
                record.details,
                fmt_ts(timestamp),
            ],
        )?;
        Ok(record)
    }

    /// Audit records for a task, oldest first.
    pub fn get_pdrs_for_task(&self, task_id: Uuid) -> Result<Vec<AuditRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, inputs_hash, outcome, task_id, details, timestamp
             FROM pdr WHERE task_id = ?1 ORDER BY timestamp ASC",
        )?;
        let rows = stmt
            .query_map(params![task_id.to_string()], PdrRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(PdrRow::decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_back() {
        let store = Store::open_in_memory().unwrap();
        let task = store.create_task("Test", "").unwrap();

        let record = store
            .write_pdr(
                "task.claim",
                "abc123",
                Outcome::Success,
                Some(task.id),
                Some("details"),
            )
            .unwrap();
        assert_eq!(record.action, "task.claim");

        let records = store.get_pdrs_for_task(task.id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].inputs_hash, "abc123");
        assert_eq!(records[0].outcome, Outcome::Success);
        assert_eq!(records[0].details.as_deref(), Some("details"));
    }

    #[test]
    fn records_without_task_are_allowed() {
        let store = Store::open_in_memory().unwrap();
        let record = store
            .write_pdr("lock.acquire", "def456", Outcome::Failed, None, None)
            .unwrap();
        assert!(record.task_id.is_none());
    }
}
