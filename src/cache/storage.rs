//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::db::Database;

use super::traits::{CachedResponse, RequestKey};

/// Trait for response cache backends.
///
/// Storage is split into named partitions. Every write is a single atomic
/// operation; a later `put` for the same key overwrites the earlier one.
pub trait ResponseStore: Send + Sync {
  /// Look up a key in one partition.
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Look up a key across all partitions, oldest partition first.
  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a response, creating the partition if needed.
  fn put(&self, partition: &str, key: &RequestKey, response: &CachedResponse) -> Result<()>;

  /// Store a batch in one transaction: either every entry lands or none does.
  fn put_all(&self, partition: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()>;

  /// Keys stored in a partition.
  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>>;

  /// Partition names in creation order.
  fn partitions(&self) -> Result<Vec<String>>;

  fn has_partition(&self, partition: &str) -> Result<bool> {
    Ok(self.partitions()?.iter().any(|p| p == partition))
  }

  /// Drop a partition and everything in it. Returns false if it did not exist.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Drop every partition not named in `keep`, returning the deleted names.
  fn delete_partitions_except(&self, keep: &[&str]) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.partitions()? {
      if !keep.contains(&name.as_str()) && self.delete_partition(&name)? {
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Version whose activation last completed, if any.
  fn activated_version(&self) -> Result<Option<u32>>;

  fn set_activated_version(&self, version: u32) -> Result<()>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

const ACTIVATED_VERSION_KEY: &str = "activated_version";

type ResponseRow = (u16, String, String, Vec<u8>, String);

fn row_to_response(row: ResponseRow) -> Result<CachedResponse> {
  let (status, status_text, headers, body, cached_at) = row;
  let headers: Vec<(String, String)> =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to parse cached headers: {}", e))?;
  CachedResponse::from_parts(status, status_text, headers, body, parse_datetime(&cached_at)?)
}

fn insert_response(
  conn: &rusqlite::Connection,
  partition: &str,
  key: &RequestKey,
  response: &CachedResponse,
) -> Result<()> {
  let headers = serde_json::to_string(response.headers())
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cached_responses
         (partition, key_hash, request_key, status, status_text, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        key.cache_hash(),
        key.url().as_str(),
        response.status(),
        response.status_text(),
        headers,
        response.body(),
        response.cached_at().format(DATETIME_FORMAT).to_string(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

  Ok(())
}

impl ResponseStore for SqliteStorage {
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;

    let row: Option<ResponseRow> = conn
      .query_row(
        "SELECT status, status_text, headers, body, cached_at FROM cached_responses
         WHERE partition = ? AND key_hash = ?",
        params![partition, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))?;

    row.map(row_to_response).transpose()
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;

    let row: Option<ResponseRow> = conn
      .query_row(
        "SELECT r.status, r.status_text, r.headers, r.body, r.cached_at
         FROM cached_responses r
         INNER JOIN cache_partitions p ON p.name = r.partition
         WHERE r.key_hash = ?
         ORDER BY p.rowid
         LIMIT 1",
        params![key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {}: {}", key, e))?;

    row.map(row_to_response).transpose()
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    let conn = self.db.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    insert_response(&tx, partition, key, response)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()> {
    let conn = self.db.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    for (key, response) in entries {
      // Dropping `tx` on error rolls everything back
      insert_response(&tx, partition, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    debug!(partition, entries = entries.len(), "Stored batch");
    Ok(())
  }

  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT request_key FROM cached_responses WHERE partition = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", partition, e))?
      .filter_map(|r| r.ok())
      .filter_map(|url| RequestKey::parse(&url).ok())
      .collect();

    Ok(keys)
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cached_responses WHERE partition = ?",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;
    let removed = tx
      .execute("DELETE FROM cache_partitions WHERE name = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }

  fn activated_version(&self) -> Result<Option<u32>> {
    let conn = self.db.conn()?;
    let value: Option<String> = conn
      .query_row(
        "SELECT value FROM worker_meta WHERE key = ?",
        params![ACTIVATED_VERSION_KEY],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read activated version: {}", e))?;

    value
      .map(|v| {
        v.parse()
          .map_err(|e| eyre!("Invalid activated version '{}': {}", v, e))
      })
      .transpose()
  }

  fn set_activated_version(&self, version: u32) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO worker_meta (key, value) VALUES (?, ?)",
        params![ACTIVATED_VERSION_KEY, version.to_string()],
      )
      .map_err(|e| eyre!("Failed to record activated version: {}", e))?;
    Ok(())
  }
}

/// Process-local storage, for `--ephemeral` runs and tests.
#[derive(Default)]
pub struct MemoryStorage {
  inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
  /// Partitions in creation order
  partitions: Vec<(String, HashMap<RequestKey, CachedResponse>)>,
  /// Insertion order of keys per partition
  order: HashMap<String, Vec<RequestKey>>,
  activated_version: Option<u32>,
}

impl MemoryState {
  fn partition_mut(&mut self, name: &str) -> &mut HashMap<RequestKey, CachedResponse> {
    let idx = match self.partitions.iter().position(|(n, _)| n == name) {
      Some(idx) => idx,
      None => {
        self.partitions.push((name.to_string(), HashMap::new()));
        self.partitions.len() - 1
      }
    };
    &mut self.partitions[idx].1
  }

  fn insert(&mut self, partition: &str, key: &RequestKey, response: &CachedResponse) {
    if self
      .partition_mut(partition)
      .insert(key.clone(), response.clone())
      .is_none()
    {
      self
        .order
        .entry(partition.to_string())
        .or_default()
        .push(key.clone());
    }
  }
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
    self.inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl ResponseStore for MemoryStorage {
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let state = self.state()?;
    Ok(
      state
        .partitions
        .iter()
        .find(|(name, _)| name == partition)
        .and_then(|(_, entries)| entries.get(key))
        .cloned(),
    )
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let state = self.state()?;
    Ok(
      state
        .partitions
        .iter()
        .find_map(|(_, entries)| entries.get(key))
        .cloned(),
    )
  }

  fn put(&self, partition: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    self.state()?.insert(partition, key, response);
    Ok(())
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()> {
    let mut state = self.state()?;
    state.partition_mut(partition);
    for (key, response) in entries {
      state.insert(partition, key, response);
    }
    Ok(())
  }

  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    Ok(self.state()?.order.get(partition).cloned().unwrap_or_default())
  }

  fn partitions(&self) -> Result<Vec<String>> {
    Ok(
      self
        .state()?
        .partitions
        .iter()
        .map(|(name, _)| name.clone())
        .collect(),
    )
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let mut state = self.state()?;
    let before = state.partitions.len();
    state.partitions.retain(|(name, _)| name != partition);
    state.order.remove(partition);
    Ok(state.partitions.len() != before)
  }

  fn activated_version(&self) -> Result<Option<u32>> {
    Ok(self.state()?.activated_version)
  }

  fn set_activated_version(&self, version: u32) -> Result<()> {
    self.state()?.activated_version = Some(version);
    Ok(())
  }
}

/// SQLite datetime format, UTC
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  chrono::NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::Response;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    RequestKey::new(Url::parse("https://crm.example.ir/").unwrap().join(path).unwrap())
  }

  fn cached(body: &str) -> CachedResponse {
    CachedResponse::from_response(&Response::new(200, "OK").with_body(body.as_bytes())).unwrap()
  }

  fn stores() -> Vec<Box<dyn ResponseStore>> {
    vec![
      Box::new(SqliteStorage::new(Database::open_in_memory().unwrap())),
      Box::new(MemoryStorage::new()),
    ]
  }

  #[test]
  fn test_put_overwrites() {
    for store in stores() {
      store.put("dynamic-v1", &key("/a.js"), &cached("one")).unwrap();
      store.put("dynamic-v1", &key("/a.js"), &cached("two")).unwrap();

      let hit = store.get("dynamic-v1", &key("/a.js")).unwrap().unwrap();
      assert_eq!(hit.body(), b"two");
      assert_eq!(store.keys("dynamic-v1").unwrap(), vec![key("/a.js")]);
      assert!(store.get("static-v1", &key("/a.js")).unwrap().is_none());
    }
  }

  #[test]
  fn test_match_any_prefers_oldest_partition() {
    for store in stores() {
      store.put("static-v1", &key("/index.html"), &cached("static")).unwrap();
      store.put("dynamic-v1", &key("/index.html"), &cached("dynamic")).unwrap();
      store.put("dynamic-v1", &key("/other.html"), &cached("other")).unwrap();

      let hit = store.match_any(&key("/index.html")).unwrap().unwrap();
      assert_eq!(hit.body(), b"static");
      let hit = store.match_any(&key("/other.html")).unwrap().unwrap();
      assert_eq!(hit.body(), b"other");
      assert!(store.match_any(&key("/missing")).unwrap().is_none());
    }
  }

  #[test]
  fn test_delete_partitions_except() {
    for store in stores() {
      store.put("static-v1", &key("/"), &cached("old")).unwrap();
      store.put("dynamic-v1", &key("/api"), &cached("old")).unwrap();
      store.put_all("static-v2", &[(key("/"), cached("new"))]).unwrap();
      store.put("dynamic-v2", &key("/x"), &cached("new")).unwrap();

      let mut deleted = store
        .delete_partitions_except(&["static-v2", "dynamic-v2"])
        .unwrap();
      deleted.sort();
      assert_eq!(deleted, vec!["dynamic-v1", "static-v1"]);
      assert_eq!(store.partitions().unwrap(), vec!["static-v2", "dynamic-v2"]);
      assert!(store.match_any(&key("/api")).unwrap().is_none());
      assert_eq!(store.match_any(&key("/")).unwrap().unwrap().body(), b"new");
    }
  }

  #[test]
  fn test_activated_version() {
    for store in stores() {
      assert_eq!(store.activated_version().unwrap(), None);
      store.set_activated_version(3).unwrap();
      assert_eq!(store.activated_version().unwrap(), Some(3));
    }
  }

  #[test]
  fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.db");

    {
      let store = SqliteStorage::new(Database::open(Some(&path)).unwrap());
      store.put("dynamic-v1", &key("/reminder-7"), &cached("{}")).unwrap();
    }

    let store = SqliteStorage::new(Database::open(Some(&path)).unwrap());
    let hit = store.get("dynamic-v1", &key("/reminder-7")).unwrap().unwrap();
    assert_eq!(hit.status(), 200);
    assert!(store.has_partition("dynamic-v1").unwrap());
  }
}
