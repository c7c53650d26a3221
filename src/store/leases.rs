//! Lease lifecycle: active lookup, heartbeat renewal, deletion.
//!
//! Leases are only ever created inside the transactional claim paths in
//! `tasks.rs`; there is deliberately no standalone insert.

use chrono::Duration;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::Lease;

use super::{fmt_ts, now, parse_id, parse_ts, Store};

struct LeaseRow {
    id: String,
    task_id: String,
    holder_id: String,
    ttl_seconds: i64,
    expires_at: String,
    created_at: String,
}

impl LeaseRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            holder_id: row.get(2)?,
            ttl_seconds: row.get(3)?,
            expires_at: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<Lease, StoreError> {
        Ok(Lease {
            id: parse_id(&self.id)?,
            task_id: parse_id(&self.task_id)?,
            holder_id: self.holder_id,
            ttl_seconds: self.ttl_seconds,
            expires_at: parse_ts(&self.expires_at)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

impl Store {
    /// The newest lease for a task with `expires_at > now`, if any.
    pub fn get_active_lease(&self, task_id: Uuid) -> Result<Option<Lease>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, task_id, holder_id, ttl_seconds, expires_at, created_at
                 FROM leases WHERE task_id = ?1 AND expires_at > ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![task_id.to_string(), fmt_ts(now())],
                LeaseRow::from_row,
            )
            .optional()?;
        row.map(LeaseRow::decode).transpose()
    }

    /// Heartbeat: extend a lease's expiry to `now + ttl_seconds`.
    pub fn renew_lease(&self, lease_id: Uuid, ttl_seconds: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE leases SET expires_at = ?1 WHERE id = ?2",
            params![
                fmt_ts(now() + Duration::seconds(ttl_seconds)),
                lease_id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Remove a lease.
    pub fn delete_lease(&self, lease_id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM leases WHERE id = ?1",
            params![lease_id.to_string()],
        )?;
        Ok(())
    }
}
