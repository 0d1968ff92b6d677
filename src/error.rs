//! Error taxonomy shared by every layer of the data pipeline.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the cache, request pipeline and sync machinery.
///
/// `Clone` so that a single shared execution can hand the same failure to
/// every waiter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
  /// Malformed caller input. Never retried.
  #[error("invalid input: {0}")]
  Validation(String),

  /// Transport level failure (connection refused, 5xx, reset).
  #[error("network error: {0}")]
  Network(String),

  /// A single attempt exceeded its deadline.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// The circuit breaker refused the call without invoking it.
  #[error("circuit open - service unavailable")]
  CircuitOpen,

  /// Server and local state diverged and the policy did not settle it.
  #[error("conflict on {entity} {id}: {reason}")]
  Conflict {
    entity: String,
    id: String,
    reason: String,
  },

  /// Every attempt failed.
  #[error("retries exhausted after {attempts} attempts: {last}")]
  RetryExhausted { attempts: u32, last: Box<Error> },

  /// Queued offline for longer than allowed.
  #[error("operation {0} expired before it could be synchronized")]
  Expired(String),

  #[error("no cached data for {0}")]
  NoCachedData(String),

  #[error("cancelled: {0}")]
  Cancelled(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("storage error: {0}")]
  Storage(String),

  #[error("serialization error: {0}")]
  Serialization(String),
}

impl Error {
  /// Whether the failure is worth retrying and should count against a
  /// circuit breaker.
  pub fn is_transient(&self) -> bool {
    match self {
      Error::Network(_) | Error::Timeout(_) | Error::CircuitOpen => true,
      Error::RetryExhausted { last, .. } => last.is_transient(),
      _ => false,
    }
  }

  /// Whether another attempt may succeed. An open circuit is transient but
  /// not retried locally; the breaker decides when to let calls through.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Error::Network(_) | Error::Timeout(_))
  }

  /// Wrap the last error of a failed retry sequence.
  pub fn exhausted(attempts: u32, last: Error) -> Self {
    Error::RetryExhausted {
      attempts,
      last: Box::new(last),
    }
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::Serialization(e.to_string())
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::Storage(e.to_string())
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      Error::Timeout(Duration::ZERO)
    } else if e.is_decode() {
      Error::Serialization(e.to_string())
    } else {
      Error::Network(e.to_string())
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transient_classification() {
    assert!(Error::Network("reset".into()).is_transient());
    assert!(Error::Timeout(Duration::from_secs(1)).is_transient());
    assert!(Error::CircuitOpen.is_transient());
    assert!(!Error::Validation("bad".into()).is_transient());
    assert!(Error::exhausted(3, Error::Network("x".into())).is_transient());
    assert!(!Error::exhausted(3, Error::Validation("x".into())).is_transient());
    assert!(!Error::CircuitOpen.is_retryable());
    assert!(Error::Timeout(Duration::ZERO).is_retryable());
  }

  #[test]
  fn test_circuit_open_message() {
    assert_eq!(
      Error::CircuitOpen.to_string(),
      "circuit open - service unavailable"
    );
  }
}
