//! Named resource locks: transactional acquisition with inline expiry reclaim.

use chrono::Duration;
use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::Lock;

use super::{fmt_ts, now, parse_id, parse_ts, Store};

struct LockRow {
    id: String,
    resource_id: String,
    holder_id: String,
    lock_type: String,
    created_at: String,
    expires_at: String,
}

impl LockRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            resource_id: row.get(1)?,
            holder_id: row.get(2)?,
            lock_type: row.get(3)?,
            created_at: row.get(4)?,
            expires_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<Lock, StoreError> {
        Ok(Lock {
            id: parse_id(&self.id)?,
            resource_id: self.resource_id,
            holder_id: self.holder_id,
            lock_type: self.lock_type,
            created_at: parse_ts(&self.created_at)?,
            expires_at: parse_ts(&self.expires_at)?,
        })
    }
}

impl Store {
    /// Acquire an exclusive lock on a resource.
    ///
    /// Within one transaction: deletes expired rows for the resource, checks
    /// for an active conflict, then inserts. A UNIQUE violation at insert time
    /// indicates a concurrent winner and is reported as `ResourceLocked`.
    pub fn acquire_lock(
        &self,
        resource_id: &str,
        holder_id: &str,
        lock_type: &str,
        ttl_seconds: i64,
    ) -> Result<Lock, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let acquire_time = now();

        tx.execute(
            "DELETE FROM locks WHERE resource_id = ?1 AND expires_at <= ?2",
            params![resource_id, fmt_ts(acquire_time)],
        )?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT holder_id FROM locks WHERE resource_id = ?1 AND expires_at > ?2",
                params![resource_id, fmt_ts(acquire_time)],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::ResourceLocked);
        }

        let lock = Lock {
            id: Uuid::new_v4(),
            resource_id: resource_id.to_string(),
            holder_id: holder_id.to_string(),
            lock_type: lock_type.to_string(),
            created_at: acquire_time,
            expires_at: acquire_time + Duration::seconds(ttl_seconds),
        };
        let inserted = tx.execute(
            "INSERT INTO locks (id, resource_id, holder_id, lock_type, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                lock.id.to_string(),
                lock.resource_id,
                lock.holder_id,
                lock.lock_type,
                fmt_ts(lock.created_at),
                fmt_ts(lock.expires_at),
            ],
        );
        if let Err(err) = inserted {
            // A concurrent writer won the UNIQUE(resource_id) race.
            if let rusqlite::Error::SqliteFailure(inner, _) = &err {
                if inner.code == ErrorCode::ConstraintViolation {
                    return Err(StoreError::ResourceLocked);
                }
            }
            return Err(err.into());
        }

        tx.commit()?;
        Ok(lock)
    }

    /// The non-expired lock on a resource, if any.
    pub fn get_lock(&self, resource_id: &str) -> Result<Option<Lock>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, resource_id, holder_id, lock_type, created_at, expires_at
                 FROM locks WHERE resource_id = ?1 AND expires_at > ?2",
                params![resource_id, fmt_ts(now())],
                LockRow::from_row,
            )
            .optional()?;
        row.map(LockRow::decode).transpose()
    }

    /// Release a lock by id.
    pub fn release_lock(&self, lock_id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM locks WHERE id = ?1",
            params![lock_id.to_string()],
        )?;
        Ok(())
    }
}
