//! Circuit breaker guarding an outbound request channel.
//!
//! ```text
//! Closed --(threshold reached)--> Open --(reset timeout)--> HalfOpen
//!   ^                                ^                          |
//!   |                                +------(any failure)-------+
//!   +-------------------(N consecutive successes)---------------+
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
  /// Failures (consecutive, or within the monitoring window) that open the circuit.
  pub failure_threshold: u32,
  #[serde(with = "secs")]
  pub reset_timeout: Duration,
  /// Sliding window for counting recent failures.
  #[serde(with = "secs")]
  pub monitoring_period: Duration,
  /// Consecutive half-open successes needed to close.
  pub success_threshold: u32,
  /// Trial calls allowed in flight while half-open.
  pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      reset_timeout: Duration::from_secs(60),
      monitoring_period: Duration::from_secs(120),
      success_threshold: 3,
      half_open_max_calls: 3,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
  Closed,
  Open,
  HalfOpen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BreakerMetrics {
  pub requests: u64,
  pub successes: u64,
  pub failures: u64,
  pub rejections: u64,
  pub average_latency_ms: f64,
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
  pub state: CircuitState,
  pub failure_count: u32,
  pub recent_failures: usize,
  pub metrics: BreakerMetrics,
}

#[derive(Debug)]
enum State {
  Closed,
  Open { open_until: Instant },
  HalfOpen { successes: u32, in_flight: u32 },
}

#[derive(Debug)]
struct Inner {
  state: State,
  failure_count: u32,
  window: VecDeque<Instant>,
  last_failure: Option<Instant>,
  metrics: BreakerMetrics,
}

impl Inner {
  fn new() -> Self {
    Self {
      state: State::Closed,
      failure_count: 0,
      window: VecDeque::new(),
      last_failure: None,
      metrics: BreakerMetrics::default(),
    }
  }

  fn prune(&mut self, now: Instant, period: Duration) {
    while let Some(front) = self.window.front() {
      if now.saturating_duration_since(*front) > period {
        self.window.pop_front();
      } else {
        break;
      }
    }
  }

  fn open(&mut self, now: Instant, config: &BreakerConfig) {
    self.state = State::Open {
      open_until: now + config.reset_timeout,
    };
  }
}

#[derive(Debug)]
pub struct CircuitBreaker {
  name: String,
  config: BreakerConfig,
  inner: Mutex<Inner>,
}

impl CircuitBreaker {
  pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
    Self {
      name: name.into(),
      config,
      inner: Mutex::new(Inner::new()),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Run `operation` through the breaker. While open, rejects with
  /// [`Error::CircuitOpen`] without invoking it.
  ///
  /// Only transient errors count as failures; a validation error from the
  /// wrapped call says nothing about the health of the channel.
  pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.enter()?;
    let mut admission = Admission {
      breaker: self,
      settled: false,
    };
    let started = Instant::now();
    let result = operation().await;
    let latency = started.elapsed();
    admission.settled = true;

    match &result {
      Err(e) if e.is_transient() => self.on_failure(latency),
      _ => self.on_success(latency),
    }
    result
  }

  fn enter(&self) -> Result<()> {
    let now = Instant::now();
    let mut guard = self.inner.lock();
    let inner = &mut *guard;
    inner.metrics.requests += 1;

    match inner.state {
      State::Closed => Ok(()),
      State::Open { open_until } if now < open_until => {
        inner.metrics.rejections += 1;
        Err(Error::CircuitOpen)
      }
      State::Open { .. } => {
        info!(breaker = %self.name, "Circuit half-open, allowing trial calls");
        inner.state = State::HalfOpen {
          successes: 0,
          in_flight: 1,
        };
        Ok(())
      }
      State::HalfOpen {
        ref mut in_flight, ..
      } => {
        if *in_flight >= self.config.half_open_max_calls {
          inner.metrics.rejections += 1;
          Err(Error::CircuitOpen)
        } else {
          *in_flight += 1;
          Ok(())
        }
      }
    }
  }

  /// Return a half-open slot taken by a call that never finished.
  fn abandon(&self) {
    let mut inner = self.inner.lock();
    if let State::HalfOpen {
      ref mut in_flight, ..
    } = inner.state
    {
      *in_flight = in_flight.saturating_sub(1);
    }
  }

  fn record_latency(metrics: &mut BreakerMetrics, latency: Duration) {
    let completed = (metrics.successes + metrics.failures) as f64;
    let ms = latency.as_secs_f64() * 1000.0;
    metrics.average_latency_ms += (ms - metrics.average_latency_ms) / completed.max(1.0);
  }

  fn on_success(&self, latency: Duration) {
    let mut guard = self.inner.lock();
    let inner = &mut *guard;
    inner.metrics.successes += 1;
    Self::record_latency(&mut inner.metrics, latency);

    match inner.state {
      State::Closed => inner.failure_count = 0,
      State::HalfOpen {
        ref mut successes,
        ref mut in_flight,
      } => {
        *successes += 1;
        *in_flight = in_flight.saturating_sub(1);
        if *successes >= self.config.success_threshold {
          info!(breaker = %self.name, "Circuit closed");
          inner.state = State::Closed;
          inner.failure_count = 0;
          inner.window.clear();
        }
      }
      // Result of a call admitted before the circuit opened.
      State::Open { .. } => {}
    }
  }

  fn on_failure(&self, latency: Duration) {
    let now = Instant::now();
    let mut guard = self.inner.lock();
    let inner = &mut *guard;
    inner.metrics.failures += 1;
    Self::record_latency(&mut inner.metrics, latency);

    inner.failure_count += 1;
    inner.last_failure = Some(now);
    inner.window.push_back(now);
    inner.prune(now, self.config.monitoring_period);

    match inner.state {
      State::HalfOpen { .. } => {
        warn!(breaker = %self.name, "Trial call failed, circuit re-opened");
        inner.open(now, &self.config);
      }
      State::Closed => {
        let threshold = self.config.failure_threshold;
        if inner.failure_count >= threshold || inner.window.len() >= threshold as usize {
          warn!(
            breaker = %self.name,
            failures = inner.failure_count,
            recent = inner.window.len(),
            "Circuit opened"
          );
          inner.open(now, &self.config);
        }
      }
      State::Open { .. } => {}
    }
  }

  pub fn state(&self) -> CircuitState {
    let now = Instant::now();
    match self.inner.lock().state {
      State::Closed => CircuitState::Closed,
      // Reported as half-open once the next call would be admitted.
      State::Open { open_until } if now >= open_until => CircuitState::HalfOpen,
      State::Open { .. } => CircuitState::Open,
      State::HalfOpen { .. } => CircuitState::HalfOpen,
    }
  }

  pub fn snapshot(&self) -> BreakerSnapshot {
    let state = self.state();
    let now = Instant::now();
    let mut inner = self.inner.lock();
    inner.prune(now, self.config.monitoring_period);
    BreakerSnapshot {
      state,
      failure_count: inner.failure_count,
      recent_failures: inner.window.len(),
      metrics: inner.metrics,
    }
  }

  /// Force the breaker closed and forget failure history. Metrics are kept.
  pub fn reset(&self) {
    let mut inner = self.inner.lock();
    inner.state = State::Closed;
    inner.failure_count = 0;
    inner.window.clear();
    inner.last_failure = None;
    info!(breaker = %self.name, "Circuit reset");
  }

  pub fn last_failure(&self) -> Option<Instant> {
    self.inner.lock().last_failure
  }
}

/// Held across a wrapped call. Dropped unsettled when the caller's future
/// is dropped mid-call.
struct Admission<'a> {
  breaker: &'a CircuitBreaker,
  settled: bool,
}

impl Drop for Admission<'_> {
  fn drop(&mut self) {
    if !self.settled {
      self.breaker.abandon();
    }
  }
}

mod secs {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    Ok(Duration::from_secs(u64::deserialize(deserializer)?))
  }
}
