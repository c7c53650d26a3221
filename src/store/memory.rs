//! Memory items: append-only knowledge snippets with substring recall.

use rusqlite::{params, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::MemoryItem;

use super::{fmt_ts, now, parse_id, parse_ts, Store};

/// Cap on substring-query results.
const QUERY_LIMIT: i64 = 50;

struct MemoryRow {
    id: String,
    task_id: Option<String>,
    content: String,
    tags: String,
    created_at: String,
}

impl MemoryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            content: row.get(2)?,
            tags: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn decode(self) -> Result<MemoryItem, StoreError> {
        Ok(MemoryItem {
            id: parse_id(&self.id)?,
            task_id: self.task_id.as_deref().map(parse_id).transpose()?,
            content: self.content,
            tags: self.tags,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

impl Store {
    /// Append a memory item, optionally attached to a task.
    pub fn add_memory(
        &self,
        task_id: Option<Uuid>,
        content: &str,
        tags: &str,
    ) -> Result<MemoryItem, StoreError> {
        let created = now();
        let item = MemoryItem {
            id: Uuid::new_v4(),
            task_id,
            content: content.to_string(),
            tags: tags.to_string(),
            created_at: created,
        };

        let conn = self.conn();
        conn.execute(
            "INSERT INTO memory_items (id, task_id, content, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                item.id.to_string(),
                item.task_id.map(|id| id.to_string()),
                item.content,
                item.tags,
                fmt_ts(created),
            ],
        )?;
        Ok(item)
    }

    /// Substring search over content (`LIKE %term%`), newest first, capped.
    pub fn query_memory(&self, term: &str) -> Result<Vec<MemoryItem>, StoreError> {
        let pattern = format!("%{}%", term.trim());
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, content, tags, created_at
             FROM memory_items WHERE content LIKE ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![pattern, QUERY_LIMIT], MemoryRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(MemoryRow::decode).collect()
    }

    /// All memory items attached to a task, newest first.
    pub fn get_memory_for_task(&self, task_id: Uuid) -> Result<Vec<MemoryItem>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, content, tags, created_at
             FROM memory_items WHERE task_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![task_id.to_string()], MemoryRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(MemoryRow::decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_query_and_fetch_by_task() {
        let store = Store::open_in_memory().unwrap();
        let task = store.create_task("Test", "").unwrap();

        let item = store
            .add_memory(Some(task.id), "Test memory content", "tag1,tag2")
            .unwrap();
        assert_eq!(item.tags, "tag1,tag2");

        let found = store.query_memory("memory").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, item.id);

        let for_task = store.get_memory_for_task(task.id).unwrap();
        assert_eq!(for_task.len(), 1);

        assert!(store.query_memory("absent").unwrap().is_empty());
    }

    #[test]
    fn unattached_items_have_no_task() {
        let store = Store::open_in_memory().unwrap();
        let item = store.add_memory(None, "global note", "").unwrap();
        assert!(item.task_id.is_none());

        let found = store.query_memory("global").unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].task_id.is_none());
    }

    #[test]
    fn query_is_capped_and_newest_first() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..60 {
            store.add_memory(None, &format!("note {i}"), "").unwrap();
        }
        let found = store.query_memory("note").unwrap();
        assert_eq!(found.len(), 50);
        assert!(found[0].created_at >= found[49].created_at);
    }
}
