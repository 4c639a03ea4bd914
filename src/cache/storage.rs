//! SQLite implementation of the partitioned cache store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::entry::{CacheEntry, EntryMeta, RequestKey};
use super::traits::CacheStore;
use crate::clock::{Clock, SystemClock};

/// SQLite-based cache storage implementation.
///
/// Write stamps later than the store's clock are clamped to it.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  clock: Arc<dyn Clock>,
}

impl SqliteStore {
  /// Create a new SQLite store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open or create the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// A store that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
      clock: Arc::new(SystemClock),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Use `clock` as "now" when clamping write stamps.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offgrid").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

-- One row per cached response; key_hash is the sha256 of "METHOD url"
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    payload BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (partition, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_stored_at
    ON entries(partition, stored_at);
"#;

#[async_trait]
impl CacheStore for SqliteStore {
  async fn open_partition(&self, name: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?, ?)",
        params![name, Utc::now().timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", name, e))?;
    Ok(())
  }

  async fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT status, headers, payload, stored_at FROM entries
         WHERE partition = ? AND key_hash = ?",
        params![partition, key.digest()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    match row {
      Some((status, headers, payload, stored_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        Ok(Some(CacheEntry {
          key: key.clone(),
          status,
          headers,
          payload,
          stored_at: parse_millis(stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  async fn put(&self, partition: &str, entry: &CacheEntry) -> Result<()> {
    let conn = self.conn()?;
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let stored_at = entry.stored_at.min(self.clock.now());

    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?, ?)",
        params![partition, Utc::now().timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entries
           (partition, key_hash, method, url, status, headers, payload, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          partition,
          entry.key.digest(),
          entry.key.method(),
          entry.key.url(),
          entry.status,
          headers,
          entry.payload,
          stored_at.timestamp_millis(),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.key, e))?;

    Ok(())
  }

  async fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM entries WHERE partition = ? AND key_hash = ?",
        params![partition, key.digest()],
      )
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;
    Ok(removed > 0)
  }

  async fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE partition = ? ORDER BY stored_at")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| {
        Ok(RequestKey::from_parts(row.get(0)?, row.get(1)?))
      })
      .map_err(|e| eyre!("Failed to list keys of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read key of {}: {}", partition, e))?;

    Ok(keys)
  }

  async fn stored_at(&self, partition: &str, key: &RequestKey) -> Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = self
      .conn()?
      .query_row(
        "SELECT stored_at FROM entries WHERE partition = ? AND key_hash = ?",
        params![partition, key.digest()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read timestamp of {}: {}", key, e))?;

    millis.map(parse_millis).transpose()
  }

  async fn entries(&self, partition: &str) -> Result<Vec<EntryMeta>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT method, url, stored_at, LENGTH(payload) FROM entries
         WHERE partition = ? ORDER BY stored_at",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows = stmt
      .query_map(params![partition], |row| {
        Ok((
          RequestKey::from_parts(row.get(0)?, row.get(1)?),
          row.get::<_, i64>(2)?,
          row.get::<_, i64>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry of {}: {}", partition, e))?;

    rows
      .into_iter()
      .map(|(key, stored_at, size)| -> Result<EntryMeta> {
        Ok(EntryMeta {
          key,
          stored_at: parse_millis(stored_at)?,
          size: size.max(0) as u64,
        })
      })
      .collect()
  }

  async fn partition_bytes(&self, partition: &str) -> Result<u64> {
    let bytes: i64 = self
      .conn()?
      .query_row(
        "SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to size partition {}: {}", partition, e))?;
    Ok(bytes.max(0) as u64)
  }

  async fn list_partitions(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare partition query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  async fn delete_partition(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  async fn total_bytes(&self) -> Result<u64> {
    let bytes: i64 = self
      .conn()?
      .query_row(
        "SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM entries",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to size cache: {}", e))?;
    Ok(bytes.max(0) as u64)
  }
}

/// Parse a stored millisecond timestamp.
fn parse_millis(millis: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(millis)
    .ok_or_else(|| eyre!("Invalid stored timestamp '{}'", millis))
}
