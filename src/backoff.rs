//! Exponential backoff with jitter, shared by every retry path.

use std::time::Duration;

use serde::Deserialize;

/// Fraction of the computed delay that jitter may add or remove.
const JITTER_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Backoff {
  #[serde(with = "millis")]
  pub base: Duration,
  #[serde(with = "millis")]
  pub max: Duration,
  pub jitter: bool,
}

impl Default for Backoff {
  fn default() -> Self {
    Self {
      base: Duration::from_millis(1000),
      max: Duration::from_secs(30),
      jitter: true,
    }
  }
}

impl Backoff {
  pub fn new(base: Duration, max: Duration) -> Self {
    Self {
      base,
      max,
      jitter: true,
    }
  }

  /// Deterministic variant for tests and tight loops.
  pub fn without_jitter(mut self) -> Self {
    self.jitter = false;
    self
  }

  /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
  /// jittered, capped at `max`.
  pub fn delay(&self, attempt: u32) -> Duration {
    if self.base.is_zero() {
      return Duration::ZERO;
    }

    let exp = attempt.saturating_sub(1).min(31);
    let raw = self.base.as_secs_f64() * 2f64.powi(exp as i32);
    let secs = if self.jitter {
      let offset = raw * JITTER_FACTOR / 2.0;
      raw + (raw * JITTER_FACTOR).mul_add(fastrand::f64(), -offset)
    } else {
      raw
    };

    let delay = Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(self.max);
    delay.min(self.max)
  }
}

mod millis {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exponential_growth() {
    let b = Backoff::new(Duration::from_millis(100), Duration::from_secs(10)).without_jitter();
    assert_eq!(b.delay(1), Duration::from_millis(100));
    assert_eq!(b.delay(2), Duration::from_millis(200));
    assert_eq!(b.delay(4), Duration::from_millis(800));
  }

  #[test]
  fn test_capped_at_max() {
    let b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1)).without_jitter();
    assert_eq!(b.delay(20), Duration::from_secs(1));
    assert_eq!(b.delay(u32::MAX), Duration::from_secs(1));
  }

  #[test]
  fn test_jitter_stays_in_band() {
    let b = Backoff::new(Duration::from_millis(1000), Duration::from_secs(60));
    for _ in 0..100 {
      let d = b.delay(1).as_millis();
      assert!((750..=1250).contains(&d), "delay {} out of band", d);
    }
  }

  #[test]
  fn test_zero_base() {
    let b = Backoff::new(Duration::ZERO, Duration::from_secs(1));
    assert_eq!(b.delay(3), Duration::ZERO);
  }
}
