//! Bounded, time-limited cache of query results.
//!
//! Keys are normalized (trimmed, lowercased) queries. Entries expire a fixed
//! TTL after insertion and are removed lazily: an expired entry is dropped
//! when it is looked up, or when an insert pushes the cache over capacity.
//! There is no background timer.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ResultCacheConfig;

/// One cached result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultCacheEntry<T> {
  pub normalized_query: String,
  pub results: Vec<T>,
  pub inserted_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  /// Tie-breaker for entries inserted within the same instant
  #[serde(default)]
  seq: u64,
}

impl<T> ResultCacheEntry<T> {
  fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

/// Counts reported by [`ResultCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCacheStats {
  pub total: usize,
  pub valid: usize,
  pub expired: usize,
  /// Approximate size of the serialized cache in bytes
  pub approx_bytes: usize,
}

struct State<T> {
  entries: HashMap<String, ResultCacheEntry<T>>,
  next_seq: u64,
}

/// Map from normalized query to results with a TTL and an entry cap.
pub struct ResultCache<T> {
  state: Mutex<State<T>>,
  ttl: Duration,
  max_entries: usize,
  clock: Arc<dyn Clock>,
}

/// Normalize a query for use as a cache key.
pub fn normalize_query(query: &str) -> String {
  query.trim().to_lowercase()
}

impl<T: Clone> ResultCache<T> {
  /// Create a cache with the default TTL (5 minutes) and capacity (50).
  pub fn new() -> Self {
    Self::with_limits(Duration::minutes(5), 50)
  }

  pub fn with_limits(ttl: Duration, max_entries: usize) -> Self {
    Self {
      state: Mutex::new(State {
        entries: HashMap::new(),
        next_seq: 0,
      }),
      ttl,
      max_entries,
      clock: Arc::new(SystemClock),
    }
  }

  pub fn from_config(config: &ResultCacheConfig) -> Self {
    Self::with_limits(
      config.ttl(),
      config.max_entries,
    )
  }

  /// Use a different clock for expiry decisions.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  fn state(&self) -> MutexGuard<'_, State<T>> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Results for `query`, or `None` when missing or expired.
  pub fn lookup(&self, query: &str) -> Option<Vec<T>> {
    let key = normalize_query(query);
    let now = self.clock.now();
    let mut state = self.state();

    let expired = match state.entries.get(&key) {
      Some(entry) if !entry.is_expired(now) => return Some(entry.results.clone()),
      Some(_) => true,
      None => false,
    };

    if expired {
      debug!("Result cache entry for '{}' expired", key);
      state.entries.remove(&key);
    }
    None
  }

  /// Cache `results` for `query`, evicting the oldest insertions when over capacity.
  pub fn store(&self, query: &str, results: Vec<T>) {
    let key = normalize_query(query);
    let now = self.clock.now();
    let mut state = self.state();

    let seq = state.next_seq;
    state.next_seq += 1;
    state.entries.insert(
      key.clone(),
      ResultCacheEntry {
        normalized_query: key,
        results,
        inserted_at: now,
        expires_at: now
          .checked_add_signed(self.ttl)
          .unwrap_or(DateTime::<Utc>::MAX_UTC),
        seq,
      },
    );

    if state.entries.len() > self.max_entries {
      Self::evict(&mut state, self.max_entries, now);
    }
  }

  fn evict(state: &mut State<T>, max_entries: usize, now: DateTime<Utc>) {
    // Expired entries go first
    state.entries.retain(|_, entry| !entry.is_expired(now));
    if state.entries.len() <= max_entries {
      return;
    }

    let mut by_age: Vec<(DateTime<Utc>, u64, String)> = state
      .entries
      .values()
      .map(|e| (e.inserted_at, e.seq, e.normalized_query.clone()))
      .collect();
    by_age.sort();

    let excess = state.entries.len() - max_entries;
    for (_, _, key) in by_age.into_iter().take(excess) {
      debug!("Evicting result cache entry '{}'", key);
      state.entries.remove(&key);
    }
  }

  /// Remove every entry.
  pub fn clear(&self) {
    self.state().entries.clear();
  }

  pub fn len(&self) -> usize {
    self.state().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<T: Clone> Default for ResultCache<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone + Serialize + DeserializeOwned> ResultCache<T> {
  pub fn stats(&self) -> ResultCacheStats {
    let now = self.clock.now();
    let state = self.state();
    let total = state.entries.len();
    let valid = state
      .entries
      .values()
      .filter(|e| !e.is_expired(now))
      .count();
    let approx_bytes = serde_json::to_vec(&state.entries)
      .map(|v| v.len())
      .unwrap_or(0);

    ResultCacheStats {
      total,
      valid,
      expired: total - valid,
      approx_bytes,
    }
  }

  /// Write the cache to `path` as JSON.
  pub fn save_to(&self, path: &Path) -> Result<()> {
    let json = {
      let state = self.state();
      let mut entries: Vec<&ResultCacheEntry<T>> = state.entries.values().collect();
      entries.sort_by_key(|e| (e.inserted_at, e.seq));
      serde_json::to_vec(&entries).map_err(|e| eyre!("Failed to serialize result cache: {}", e))?
    };

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create result cache directory: {}", e))?;
    }
    std::fs::write(path, json)
      .map_err(|e| eyre!("Failed to write result cache {}: {}", path.display(), e))?;
    Ok(())
  }

  /// Replace the contents with the entries saved at `path`, dropping expired ones.
  ///
  /// A missing file leaves the cache empty. An unreadable one is logged and
  /// ignored so a corrupt snapshot never blocks startup.
  pub fn load_from(&self, path: &Path) -> Result<usize> {
    if !path.exists() {
      return Ok(0);
    }
    let contents = std::fs::read(path)
      .map_err(|e| eyre!("Failed to read result cache {}: {}", path.display(), e))?;

    let saved: Vec<ResultCacheEntry<T>> = match serde_json::from_slice(&contents) {
      Ok(saved) => saved,
      Err(e) => {
        warn!("Ignoring unreadable result cache {}: {}", path.display(), e);
        return Ok(0);
      }
    };

    let now = self.clock.now();
    let mut state = self.state();
    state.entries.clear();
    state.next_seq = 0;
    for mut entry in saved.into_iter().filter(|e| !e.is_expired(now)) {
      entry.seq = state.next_seq;
      state.next_seq += 1;
      state.entries.insert(entry.normalized_query.clone(), entry);
    }
    if state.entries.len() > self.max_entries {
      Self::evict(&mut state, self.max_entries, now);
    }

    Ok(state.entries.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  fn cache_with_clock(ttl: Duration, max: usize) -> (ResultCache<String>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let cache = ResultCache::with_limits(ttl, max).with_clock(clock.clone());
    (cache, clock)
  }

  #[test]
  fn test_lookup_normalizes_query() {
    let (cache, _) = cache_with_clock(Duration::minutes(5), 50);
    cache.store("  Tanks ", vec!["a".to_string()]);

    assert_eq!(cache.lookup("tanks"), Some(vec!["a".to_string()]));
    assert_eq!(cache.lookup("TANKS  "), Some(vec!["a".to_string()]));
    assert_eq!(cache.lookup("drones"), None);
  }

  #[test]
  fn test_entry_absent_one_millisecond_after_ttl() {
    let (cache, clock) = cache_with_clock(Duration::minutes(5), 50);
    cache.store("q", vec!["r".to_string()]);

    clock.advance(Duration::minutes(5) - Duration::milliseconds(1));
    assert!(cache.lookup("q").is_some());

    clock.advance(Duration::milliseconds(2));
    assert!(cache.lookup("q").is_none());
    // Lazily removed on that lookup
    assert!(cache.is_empty());
  }

  #[test]
  fn test_huge_ttl_never_expires() {
    let config = ResultCacheConfig {
      ttl_secs: 10_000_000_000_000,
      max_entries: 5,
    };
    let clock = Arc::new(ManualClock::starting_now());
    let cache = ResultCache::<String>::from_config(&config).with_clock(clock.clone());
    cache.store("q", vec!["r".to_string()]);

    clock.advance(Duration::days(365 * 1000));
    assert_eq!(cache.lookup("q"), Some(vec!["r".to_string()]));
  }

  #[test]
  fn test_capacity_evicts_oldest_inserted() {
    let max = 50;
    let (cache, clock) = cache_with_clock(Duration::minutes(5), max);

    for i in 0..max + 5 {
      cache.store(&format!("query {}", i), vec![i.to_string()]);
      clock.advance(Duration::milliseconds(10));
    }

    assert_eq!(cache.len(), max);
    for i in 0..5 {
      assert!(cache.lookup(&format!("query {}", i)).is_none());
    }
    for i in 5..max + 5 {
      assert!(cache.lookup(&format!("query {}", i)).is_some());
    }
  }

  #[test]
  fn test_capacity_uses_insertion_order_within_same_instant() {
    let (cache, _) = cache_with_clock(Duration::minutes(5), 2);
    cache.store("a", vec![]);
    cache.store("b", vec![]);
    cache.store("c", vec![]);

    assert!(cache.lookup("a").is_none());
    assert!(cache.lookup("b").is_some());
    assert!(cache.lookup("c").is_some());
  }

  #[test]
  fn test_restore_refreshes_insertion_time() {
    let (cache, clock) = cache_with_clock(Duration::minutes(5), 2);
    cache.store("a", vec![]);
    clock.advance(Duration::seconds(1));
    cache.store("b", vec![]);
    clock.advance(Duration::seconds(1));
    cache.store("a", vec!["again".to_string()]);
    clock.advance(Duration::seconds(1));
    cache.store("c", vec![]);

    assert!(cache.lookup("b").is_none());
    assert_eq!(cache.lookup("a"), Some(vec!["again".to_string()]));
  }

  #[test]
  fn test_stats_counts_expired() {
    let (cache, clock) = cache_with_clock(Duration::minutes(5), 50);
    cache.store("old", vec!["x".to_string()]);
    clock.advance(Duration::minutes(6));
    cache.store("new", vec!["y".to_string()]);

    let stats = cache.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.valid, 1);
    assert_eq!(stats.expired, 1);
    assert!(stats.approx_bytes > 0);
  }

  #[test]
  fn test_save_and_load_drops_expired() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.json");

    let (cache, clock) = cache_with_clock(Duration::minutes(5), 50);
    cache.store("early", vec!["1".to_string()]);
    clock.advance(Duration::minutes(3));
    cache.store("late", vec!["2".to_string()]);
    cache.save_to(&path).unwrap();

    clock.advance(Duration::minutes(3));
    let restored: ResultCache<String> =
      ResultCache::with_limits(Duration::minutes(5), 50).with_clock(clock.clone());
    assert_eq!(restored.load_from(&path).unwrap(), 1);
    assert!(restored.lookup("early").is_none());
    assert_eq!(restored.lookup("late"), Some(vec!["2".to_string()]));
  }

  #[test]
  fn test_load_ignores_corrupt_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.json");
    std::fs::write(&path, b"not json").unwrap();

    let cache: ResultCache<String> = ResultCache::new();
    assert_eq!(cache.load_from(&path).unwrap(), 0);
    assert_eq!(cache.load_from(&dir.path().join("missing.json")).unwrap(), 0);
  }
}
