use std::time::Duration;

use crate::config::ClientConfig;

/// Exponential backoff between attempts of one logical request.
///
/// The delay before retry `k` (0-based) is `base_delay * factor^k`, capped at
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
  /// Retries after the first attempt
  pub retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub factor: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      retries: 3,
      base_delay: Duration::from_millis(1_000),
      max_delay: Duration::from_millis(10_000),
      factor: 2.0,
    }
  }
}

impl From<&ClientConfig> for RetryPolicy {
  fn from(config: &ClientConfig) -> Self {
    Self {
      retries: config.retries,
      base_delay: Duration::from_millis(config.base_delay_ms),
      max_delay: Duration::from_millis(config.max_delay_ms),
      factor: config.backoff_factor,
    }
  }
}

impl RetryPolicy {
  pub fn with_retries(mut self, retries: u32) -> Self {
    self.retries = retries;
    self
  }

  /// Attempts including the first one.
  pub fn max_attempts(&self) -> u32 {
    self.retries.saturating_add(1)
  }

  /// Delay to wait before retry number `retry`.
  pub fn delay_for(&self, retry: u32) -> Duration {
    let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
    let secs = self.base_delay.as_secs_f64() * self.factor.powi(exponent);

    if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
      return self.max_delay;
    }
    Duration::from_secs_f64(secs)
  }
}
