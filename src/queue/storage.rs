//! Pending-write storage trait and its SQLite / in-memory implementations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

use crate::db::Database;

use super::types::{EntityKind, PendingRecord};

/// Durable per-entity queue of writes awaiting delivery.
///
/// Each entity type is an independent queue keyed by record id. Every method is a
/// single atomic operation.
pub trait PendingStore: Send + Sync {
  /// Store a record, overwriting any record with the same id.
  fn enqueue(&self, kind: EntityKind, record: &PendingRecord) -> Result<()>;

  /// All records for `kind`, in first-insertion order. Unreadable records are skipped.
  fn list(&self, kind: EntityKind) -> Result<Vec<PendingRecord>>;

  fn get(&self, kind: EntityKind, id: &str) -> Result<Option<PendingRecord>>;

  /// Remove a record. Returns false if it was not queued.
  fn remove(&self, kind: EntityKind, id: &str) -> Result<bool>;

  fn count(&self, kind: EntityKind) -> Result<usize> {
    Ok(self.list(kind)?.len())
  }
}

/// Queue kept in the worker database.
#[derive(Clone)]
pub struct SqliteQueue {
  db: Database,
}

impl SqliteQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

impl PendingStore for SqliteQueue {
  fn enqueue(&self, kind: EntityKind, record: &PendingRecord) -> Result<()> {
    let conn = self.db.conn()?;
    let payload = serde_json::to_string(&record.payload)
      .map_err(|e| eyre!("Failed to serialize {} {}: {}", kind, record.id, e))?;

    // Upsert keeps the original position of an overwritten record
    conn
      .execute(
        "INSERT INTO pending_records (entity, record_id, payload, enqueued_at)
         VALUES (?, ?, ?, datetime('now'))
         ON CONFLICT (entity, record_id) DO UPDATE SET payload = excluded.payload",
        params![kind.as_str(), record.id, payload],
      )
      .map_err(|e| eyre!("Failed to enqueue {} {}: {}", kind, record.id, e))?;

    Ok(())
  }

  fn list(&self, kind: EntityKind) -> Result<Vec<PendingRecord>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT record_id, payload FROM pending_records WHERE entity = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String)> = stmt
      .query_map(params![kind.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query pending {} records: {}", kind, e))?
      .filter_map(|r| r.ok())
      .collect();

    let records = rows
      .into_iter()
      .filter_map(|(id, payload)| match serde_json::from_str(&payload) {
        Ok(payload) => Some(PendingRecord { id, payload }),
        Err(e) => {
          warn!(entity = %kind, id = %id, error = %e, "Skipping unreadable pending record");
          None
        }
      })
      .collect();

    Ok(records)
  }

  fn get(&self, kind: EntityKind, id: &str) -> Result<Option<PendingRecord>> {
    let conn = self.db.conn()?;

    let payload: Option<String> = conn
      .query_row(
        "SELECT payload FROM pending_records WHERE entity = ? AND record_id = ?",
        params![kind.as_str(), id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} {}: {}", kind, id, e))?;

    match payload {
      Some(payload) => {
        let payload = serde_json::from_str(&payload)
          .map_err(|e| eyre!("Failed to parse {} {}: {}", kind, id, e))?;
        Ok(Some(PendingRecord {
          id: id.to_string(),
          payload,
        }))
      }
      None => Ok(None),
    }
  }

  fn remove(&self, kind: EntityKind, id: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM pending_records WHERE entity = ? AND record_id = ?",
        params![kind.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to remove {} {}: {}", kind, id, e))?;
    Ok(removed > 0)
  }

  fn count(&self, kind: EntityKind) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM pending_records WHERE entity = ?",
        params![kind.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count pending {} records: {}", kind, e))?;
    Ok(count as usize)
  }
}

/// Process-local queue, for `--ephemeral` runs and tests.
#[derive(Default)]
pub struct MemoryQueue {
  records: Mutex<HashMap<EntityKind, Vec<PendingRecord>>>,
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }
}

impl PendingStore for MemoryQueue {
  fn enqueue(&self, kind: EntityKind, record: &PendingRecord) -> Result<()> {
    let mut records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let queue = records.entry(kind).or_default();
    match queue.iter_mut().find(|r| r.id == record.id) {
      Some(existing) => *existing = record.clone(),
      None => queue.push(record.clone()),
    }
    Ok(())
  }

  fn list(&self, kind: EntityKind) -> Result<Vec<PendingRecord>> {
    let records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(records.get(&kind).cloned().unwrap_or_default())
  }

  fn get(&self, kind: EntityKind, id: &str) -> Result<Option<PendingRecord>> {
    let records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      records
        .get(&kind)
        .and_then(|queue| queue.iter().find(|r| r.id == id))
        .cloned(),
    )
  }

  fn remove(&self, kind: EntityKind, id: &str) -> Result<bool> {
    let mut records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let Some(queue) = records.get_mut(&kind) else {
      return Ok(false);
    };
    let before = queue.len();
    queue.retain(|r| r.id != id);
    Ok(queue.len() != before)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record(value: serde_json::Value) -> PendingRecord {
    PendingRecord::from_value(value).unwrap()
  }

  fn stores() -> Vec<Box<dyn PendingStore>> {
    vec![
      Box::new(SqliteQueue::new(Database::open_in_memory().unwrap())),
      Box::new(MemoryQueue::new()),
    ]
  }

  #[test]
  fn test_same_id_overwrites() {
    for store in stores() {
      store
        .enqueue(EntityKind::Sale, &record(json!({"id": "s_1", "total": 100})))
        .unwrap();
      store
        .enqueue(EntityKind::Sale, &record(json!({"id": "s_1", "total": 200})))
        .unwrap();

      let records = store.list(EntityKind::Sale).unwrap();
      assert_eq!(records.len(), 1);
      assert_eq!(records[0].payload["total"], 200);
      assert_eq!(store.count(EntityKind::Sale).unwrap(), 1);
    }
  }

  #[test]
  fn test_insertion_order_survives_overwrite() {
    for store in stores() {
      for id in ["a", "b", "c"] {
        store
          .enqueue(EntityKind::Customer, &record(json!({"id": id})))
          .unwrap();
      }
      store
        .enqueue(EntityKind::Customer, &record(json!({"id": "a", "firstName": "Sara"})))
        .unwrap();

      let ids: Vec<String> = store
        .list(EntityKind::Customer)
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
      assert_eq!(ids, vec!["a", "b", "c"]);
    }
  }

  #[test]
  fn test_queues_are_independent_per_entity() {
    for store in stores() {
      store
        .enqueue(EntityKind::Sale, &record(json!({"id": "x"})))
        .unwrap();
      store
        .enqueue(EntityKind::Reminder, &record(json!({"id": "x"})))
        .unwrap();

      assert!(store.remove(EntityKind::Sale, "x").unwrap());
      assert!(!store.remove(EntityKind::Sale, "x").unwrap());
      assert!(store.get(EntityKind::Reminder, "x").unwrap().is_some());
      assert!(store.get(EntityKind::Sale, "x").unwrap().is_none());
    }
  }

  #[test]
  fn test_unreadable_record_is_skipped() {
    let db = Database::open_in_memory().unwrap();
    let store = SqliteQueue::new(db.clone());
    store
      .enqueue(EntityKind::Sale, &record(json!({"id": "good"})))
      .unwrap();
    db.conn()
      .unwrap()
      .execute(
        "INSERT INTO pending_records (entity, record_id, payload) VALUES ('sale', 'bad', '{not json')",
        [],
      )
      .unwrap();

    let records = store.list(EntityKind::Sale).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "good");
  }

  #[test]
  fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.db");

    {
      let store = SqliteQueue::new(Database::open(Some(&path)).unwrap());
      store
        .enqueue(EntityKind::Sale, &record(json!({"id": "s_1001"})))
        .unwrap();
    }

    let store = SqliteQueue::new(Database::open(Some(&path)).unwrap());
    assert!(store.get(EntityKind::Sale, "s_1001").unwrap().is_some());
  }
}
