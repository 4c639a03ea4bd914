//! Core traits and types for the partitioned cache store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::sync::Arc;

use super::entry::{CacheEntry, EntryMeta, RequestKey};

/// Key/value storage of cached responses, organized into named partitions.
///
/// Every operation is atomic for a single key; there are no multi-key
/// transactions. A miss is `Ok(None)`, never an error.
#[async_trait]
pub trait CacheStore: Send + Sync {
  /// Create the partition if it does not exist yet.
  async fn open_partition(&self, name: &str) -> Result<()>;

  /// Get a single entry.
  async fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Store an entry, replacing any previous entry with the same key.
  async fn put(&self, partition: &str, entry: &CacheEntry) -> Result<()>;

  /// Delete an entry. Returns whether anything was removed.
  async fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool>;

  /// All keys currently stored in a partition.
  async fn keys(&self, partition: &str) -> Result<Vec<RequestKey>>;

  /// When an entry was stored, without loading its payload.
  async fn stored_at(&self, partition: &str, key: &RequestKey) -> Result<Option<DateTime<Utc>>>;

  /// Sum of payload sizes in one partition.
  async fn partition_bytes(&self, partition: &str) -> Result<u64>;

  /// Metadata of every entry in a partition, oldest first.
  async fn entries(&self, partition: &str) -> Result<Vec<EntryMeta>> {
    let mut entries = Vec::new();
    for key in self.keys(partition).await? {
      if let Some(entry) = self.get(partition, &key).await? {
        entries.push(entry.meta());
      }
    }
    entries.sort_by_key(|e| e.stored_at);
    Ok(entries)
  }

  /// Names of every partition.
  async fn list_partitions(&self) -> Result<Vec<String>>;

  /// Delete a partition and all its entries. Returns whether it existed.
  async fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Sum of payload sizes across all partitions.
  async fn total_bytes(&self) -> Result<u64> {
    let mut total = 0;
    for name in self.list_partitions().await? {
      total += self.partition_bytes(&name).await?;
    }
    Ok(total)
  }
}

/// Handle to one named partition of a [`CacheStore`].
#[derive(Clone)]
pub struct Partition {
  store: Arc<dyn CacheStore>,
  name: String,
}

impl Partition {
  /// Open (creating if needed) the partition `name`.
  pub async fn open(store: Arc<dyn CacheStore>, name: &str) -> Result<Self> {
    store.open_partition(name).await?;
    Ok(Self {
      store,
      name: name.to_string(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub async fn get(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
    self.store.get(&self.name, key).await
  }

  pub async fn put(&self, entry: &CacheEntry) -> Result<()> {
    self.store.put(&self.name, entry).await
  }

  pub async fn delete(&self, key: &RequestKey) -> Result<bool> {
    self.store.delete(&self.name, key).await
  }

  pub async fn keys(&self) -> Result<Vec<RequestKey>> {
    self.store.keys(&self.name).await
  }

  pub async fn entries(&self) -> Result<Vec<EntryMeta>> {
    self.store.entries(&self.name).await
  }

  pub async fn bytes(&self) -> Result<u64> {
    self.store.partition_bytes(&self.name).await
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Create a result generated locally because nothing better was available.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache without touching the network
  Cache,
  /// Network failed, serving the last cached copy
  Offline,
  /// Network failed and nothing was cached; response was generated locally
  Fallback,
}
