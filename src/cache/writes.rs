//! How concurrent writes to the same cache key are ordered.
//!
//! The default is last-writer-wins with no locking: two interceptions that
//! fetch the same key race, and whichever `put` lands last is what stays.
//! [`PerKeyLock`] serializes writers per key for callers that need it; it
//! does not change which write survives, only that writes never interleave.

use async_trait::async_trait;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::entry::CacheEntry;
use super::traits::CacheStore;

/// Strategy for committing an entry to a store.
#[async_trait]
pub trait WritePolicy: Send + Sync {
  async fn write(&self, store: &dyn CacheStore, partition: &str, entry: CacheEntry) -> Result<()>;
}

/// Write straight through; the last `put` wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

#[async_trait]
impl WritePolicy for LastWriteWins {
  async fn write(&self, store: &dyn CacheStore, partition: &str, entry: CacheEntry) -> Result<()> {
    store.put(partition, &entry).await
  }
}

/// Hold a per-key async mutex around each write.
#[derive(Default)]
pub struct PerKeyLock {
  locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl PerKeyLock {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock_for(&self, partition: &str, digest: String) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    locks
      .entry((partition.to_string(), digest))
      .or_default()
      .clone()
  }

  /// Drop locks nobody is holding or waiting on.
  fn prune(&self) {
    let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
  }

  /// Number of keys with a live lock.
  pub fn tracked_keys(&self) -> usize {
    self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
  }
}

#[async_trait]
impl WritePolicy for PerKeyLock {
  async fn write(&self, store: &dyn CacheStore, partition: &str, entry: CacheEntry) -> Result<()> {
    let lock = self.lock_for(partition, entry.key.digest());
    let result = {
      let _guard = lock.lock().await;
      store.put(partition, &entry).await
    };
    drop(lock);
    self.prune();
    result
  }
}
