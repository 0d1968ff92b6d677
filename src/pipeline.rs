//! Request middleware composed in a fixed order:
//! retry -> circuit breaker -> dedup -> execute.
//!
//! Each stage is usable on its own; [`Pipeline`] wires them together for the
//! data layer's network calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::backoff::Backoff;
use crate::breaker::CircuitBreaker;
use crate::error::{Error, Result};

/// Retries retryable failures with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryStage {
  max_retries: u32,
  backoff: Backoff,
}

impl RetryStage {
  pub fn new(max_retries: u32, backoff: Backoff) -> Self {
    Self {
      max_retries,
      backoff,
    }
  }

  pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let mut retries = 0;
    loop {
      match attempt().await {
        Ok(value) => return Ok(value),
        Err(e) if e.is_retryable() && retries < self.max_retries => {
          retries += 1;
          let delay = self.backoff.delay(retries);
          debug!(retries, ?delay, error = %e, "Retrying after failure");
          tokio::time::sleep(delay).await;
        }
        Err(e) if e.is_retryable() && retries > 0 => return Err(Error::exhausted(retries + 1, e)),
        Err(e) => return Err(e),
      }
    }
  }
}

/// Routes calls through a shared [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct BreakerStage {
  breaker: Arc<CircuitBreaker>,
}

impl BreakerStage {
  pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
    Self { breaker }
  }

  pub async fn run<T, F, Fut>(&self, call: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.breaker.execute(call).await
  }
}

type SharedCall<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Collapses concurrent calls with the same key into one execution; every
/// caller receives a clone of the single result.
pub struct DedupStage<T: Clone> {
  inflight: Arc<Mutex<HashMap<String, (u64, SharedCall<T>)>>>,
  generation: AtomicU64,
}

impl<T: Clone> Default for DedupStage<T> {
  fn default() -> Self {
    Self {
      inflight: Arc::new(Mutex::new(HashMap::new())),
      generation: AtomicU64::new(0),
    }
  }
}

impl<T: Clone> std::fmt::Debug for DedupStage<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DedupStage")
      .field("inflight", &self.inflight.lock().len())
      .finish()
  }
}

impl<T: Clone + Send + Sync + 'static> DedupStage<T> {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn run<F, Fut>(&self, key: &str, call: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (generation, shared) = {
      let mut inflight = self.inflight.lock();
      match inflight.get(key) {
        Some((generation, shared)) => {
          debug!(key, "Joining in-flight call");
          (*generation, shared.clone())
        }
        None => {
          let generation = self.generation.fetch_add(1, Ordering::Relaxed);
          let shared = call().boxed().shared();
          inflight.insert(key.to_string(), (generation, shared.clone()));
          (generation, shared)
        }
      }
    };

    let result = shared.await;

    let mut inflight = self.inflight.lock();
    if inflight.get(key).is_some_and(|(g, _)| *g == generation) {
      inflight.remove(key);
    }
    result
  }

  pub fn in_flight(&self) -> usize {
    self.inflight.lock().len()
  }
}

/// retry -> breaker -> dedup -> execute.
#[derive(Debug)]
pub struct Pipeline {
  retry: RetryStage,
  breaker: BreakerStage,
  dedup: DedupStage<Value>,
}

impl Pipeline {
  pub fn new(retry: RetryStage, breaker: BreakerStage) -> Self {
    Self {
      retry,
      breaker,
      dedup: DedupStage::new(),
    }
  }

  /// Execute `op`. With a `dedup_key`, concurrent calls sharing the key run
  /// `op` once per attempt.
  pub async fn call<F, Fut>(&self, dedup_key: Option<&str>, op: F) -> Result<Value>
  where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let op = &op;
    let dedup = &self.dedup;
    let breaker = &self.breaker;
    self
      .retry
      .run(|| {
        breaker.run(move || async move {
          match dedup_key {
            Some(key) => dedup.run(key, op).await,
            None => op().await,
          }
        })
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::breaker::{BreakerConfig, CircuitState};
  use serde_json::json;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  fn backoff() -> Backoff {
    Backoff::new(Duration::from_millis(10), Duration::from_millis(100)).without_jitter()
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_until_success() {
    let retry = RetryStage::new(3, backoff());
    let calls = AtomicU32::new(0);
    let result = retry
      .run(|| async {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
          Err(Error::Network("flaky".into()))
        } else {
          Ok(7)
        }
      })
      .await;
    assert_eq!(result, Ok(7));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_exhausted() {
    let retry = RetryStage::new(2, backoff());
    let calls = AtomicU32::new(0);
    let result: Result<()> = retry
      .run(|| async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Network("down".into()))
      })
      .await;
    assert_eq!(result, Err(Error::exhausted(3, Error::Network("down".into()))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_validation_is_not_retried() {
    let retry = RetryStage::new(5, backoff());
    let calls = AtomicU32::new(0);
    let result: Result<()> = retry
      .run(|| async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Validation("bad".into()))
      })
      .await;
    assert_eq!(result, Err(Error::Validation("bad".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_dedup_shares_one_execution() {
    let dedup: DedupStage<u32> = DedupStage::new();
    let calls = Arc::new(AtomicU32::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let rx = rx.shared();

    let make = || {
      let calls = calls.clone();
      let rx = rx.clone();
      move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        rx.await.ok();
        Ok(99)
      }
    };

    let a = dedup.run("k", make());
    let b = dedup.run("k", make());
    let release = async {
      tokio::task::yield_now().await;
      tx.send(()).ok();
    };
    let (a, b, ()) = tokio::join!(a, b, release);
    assert_eq!(a, Ok(99));
    assert_eq!(b, Ok(99));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(dedup.in_flight(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_pipeline_stops_retrying_when_circuit_opens() {
    let breaker = Arc::new(CircuitBreaker::new(
      "pipeline",
      BreakerConfig {
        failure_threshold: 2,
        ..BreakerConfig::default()
      },
    ));
    let pipeline = Pipeline::new(RetryStage::new(5, backoff()), BreakerStage::new(breaker.clone()));
    let calls = Arc::new(AtomicU32::new(0));

    let result = pipeline
      .call(Some("k"), {
        let calls = calls.clone();
        move || {
          calls.fetch_add(1, Ordering::SeqCst);
          futures::future::ready(Err(Error::Network("down".into())))
        }
      })
      .await;

    assert_eq!(result, Err(Error::CircuitOpen));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.state(), CircuitState::Open);
  }

  #[tokio::test]
  async fn test_pipeline_success() {
    let breaker = Arc::new(CircuitBreaker::new("ok", BreakerConfig::default()));
    let pipeline = Pipeline::new(RetryStage::new(1, backoff()), BreakerStage::new(breaker));
    let result = pipeline
      .call(None, || futures::future::ready(Ok(json!({"ok": true}))))
      .await;
    assert_eq!(result, Ok(json!({"ok": true})));
  }
}
