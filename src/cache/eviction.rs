//! Age and size bounds for the partitioned cache store.
//!
//! The size bound is deliberately coarse: when the store grows past its byte
//! budget the engine runs the age sweep early. There is no per-access
//! bookkeeping, so it cannot evict by recency.

use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::traits::CacheStore;
use crate::clock::Clock;
use crate::config::EvictionConfig;

/// Limits enforced by the [`EvictionEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
  /// Entries older than this are removed by the age sweep
  pub max_age: Duration,
  /// Byte budget across all partitions before the age sweep is forced
  pub max_bytes: u64,
}

impl Default for EvictionPolicy {
  fn default() -> Self {
    Self {
      max_age: Duration::hours(24),
      max_bytes: 50 * 1024 * 1024,
    }
  }
}

impl From<&EvictionConfig> for EvictionPolicy {
  fn from(config: &EvictionConfig) -> Self {
    Self {
      max_age: config.max_age(),
      max_bytes: config.max_bytes,
    }
  }
}

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
  /// Partitions visited
  pub partitions: usize,
  /// Entries whose age was checked
  pub scanned: usize,
  /// Entries deleted
  pub evicted: usize,
  /// Storage failures that were logged and skipped
  pub failures: usize,
  /// Total payload bytes measured before the sweep (size sweeps only)
  pub bytes_before: Option<u64>,
}

/// Applies an [`EvictionPolicy`] to a store.
#[derive(Clone)]
pub struct EvictionEngine {
  store: Arc<dyn CacheStore>,
  policy: EvictionPolicy,
  clock: Arc<dyn Clock>,
}

impl EvictionEngine {
  pub fn new(store: Arc<dyn CacheStore>, policy: EvictionPolicy, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      policy,
      clock,
    }
  }

  pub fn policy(&self) -> &EvictionPolicy {
    &self.policy
  }

  /// Delete every entry in every partition older than `max_age`.
  ///
  /// Never fails as a whole: a partition that cannot be listed or an entry
  /// that cannot be read or deleted is logged and skipped.
  pub async fn age_sweep(&self) -> SweepReport {
    let mut report = SweepReport::default();
    let now = self.clock.now();

    let partitions = match self.store.list_partitions().await {
      Ok(names) => names,
      Err(e) => {
        warn!("Eviction sweep could not list partitions: {}", e);
        report.failures += 1;
        return report;
      }
    };

    for partition in partitions {
      report.partitions += 1;

      let keys = match self.store.keys(&partition).await {
        Ok(keys) => keys,
        Err(e) => {
          warn!("Eviction sweep skipping partition {}: {}", partition, e);
          report.failures += 1;
          continue;
        }
      };

      for key in keys {
        report.scanned += 1;

        let stored_at = match self.store.stored_at(&partition, &key).await {
          Ok(Some(stored_at)) => stored_at,
          // Removed concurrently
          Ok(None) => continue,
          Err(e) => {
            warn!("Eviction sweep skipping {} in {}: {}", key, partition, e);
            report.failures += 1;
            continue;
          }
        };

        if now - stored_at <= self.policy.max_age {
          continue;
        }

        match self.store.delete(&partition, &key).await {
          Ok(_) => {
            debug!("Evicted {} from {}", key, partition);
            report.evicted += 1;
          }
          Err(e) => {
            warn!("Eviction sweep failed to delete {} in {}: {}", key, partition, e);
            report.failures += 1;
          }
        }
      }
    }

    if report.evicted > 0 {
      info!(
        "Age sweep evicted {} of {} entries across {} partitions",
        report.evicted, report.scanned, report.partitions
      );
    }
    report
  }

  /// Measure the store and run the age sweep when it is over budget.
  pub async fn size_sweep(&self) -> SweepReport {
    let total = match self.store.total_bytes().await {
      Ok(total) => total,
      Err(e) => {
        warn!("Size sweep could not measure cache: {}", e);
        return SweepReport {
          failures: 1,
          ..SweepReport::default()
        };
      }
    };

    if total <= self.policy.max_bytes {
      debug!("Cache holds {} bytes, within budget of {}", total, self.policy.max_bytes);
      return SweepReport {
        bytes_before: Some(total),
        ..SweepReport::default()
      };
    }

    info!(
      "Cache holds {} bytes, over budget of {}; sweeping by age",
      total, self.policy.max_bytes
    );
    SweepReport {
      bytes_before: Some(total),
      ..self.age_sweep().await
    }
  }
}

/// Background task that runs the age sweep on a fixed interval.
///
/// The task stops when the scheduler is dropped.
pub struct EvictionScheduler {
  handle: JoinHandle<()>,
}

impl EvictionScheduler {
  pub fn spawn(engine: EvictionEngine, interval: std::time::Duration) -> Self {
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;

      loop {
        ticker.tick().await;
        let report = engine.age_sweep().await;
        debug!("Scheduled eviction sweep finished: {:?}", report);
      }
    });

    Self { handle }
  }
}

impl Drop for EvictionScheduler {
  fn drop(&mut self) {
    self.handle.abort();
  }
}
