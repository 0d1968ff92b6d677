//! Resource requests, their completion handles and queue metrics.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::entity::Priority;
use crate::error::{Error, Result};

/// A factory that creates the future performing one attempt of a request.
/// Called once per attempt.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Box a closure into a [`Fetcher`].
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value>> + Send + 'static,
{
  Arc::new(move || Box::pin(f()))
}

/// An outbound request waiting for a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
  pub id: String,
  /// URL or opaque descriptor, used for logging.
  pub target: String,
  pub priority: Priority,
  pub tags: BTreeSet<String>,
  /// Ids of requests that must finish before this one starts.
  pub dependencies: Vec<String>,
  pub retry_count: u32,
  pub max_retries: u32,
  pub timeout: Duration,
  pub dedup_key: Option<String>,
}

impl ResourceRequest {
  pub fn new(target: impl Into<String>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      target: target.into(),
      priority: Priority::Normal,
      tags: BTreeSet::new(),
      dependencies: Vec::new(),
      retry_count: 0,
      max_retries: 3,
      timeout: Duration::from_secs(30),
      dedup_key: None,
    }
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = id.into();
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.insert(tag.into());
    self
  }

  pub fn depends_on(mut self, id: impl Into<String>) -> Self {
    self.dependencies.push(id.into());
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
    self.dedup_key = Some(key.into());
    self
  }

  pub(crate) fn validate(&self) -> Result<()> {
    if self.id.is_empty() {
      return Err(Error::Validation("request id must not be empty".into()));
    }
    if self.target.is_empty() {
      return Err(Error::Validation(format!("request {} has no target", self.id)));
    }
    if self.timeout.is_zero() {
      return Err(Error::Validation(format!("request {} has a zero timeout", self.id)));
    }
    Ok(())
  }
}

/// Resolves when the request completes, fails terminally or is cancelled.
#[derive(Debug)]
pub struct RequestHandle {
  id: String,
  rx: oneshot::Receiver<Result<Value>>,
}

impl RequestHandle {
  pub(crate) fn new(id: String, rx: oneshot::Receiver<Result<Value>>) -> Self {
    Self { id, rx }
  }

  /// Handle that is already settled, for requests rejected at admission.
  pub(crate) fn settled(id: String, result: Result<Value>) -> Self {
    let (tx, rx) = oneshot::channel();
    tx.send(result).ok();
    Self { id, rx }
  }

  pub fn id(&self) -> &str {
    &self.id
  }
}

impl Future for RequestHandle {
  type Output = Result<Value>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    Pin::new(&mut self.rx).poll(cx).map(|r| {
      r.unwrap_or_else(|_| Err(Error::Cancelled("request manager dropped".into())))
    })
  }
}

/// Snapshot of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceMetrics {
  pub active: usize,
  pub queued: usize,
  pub retrying: usize,
  pub completed: u64,
  pub failed: u64,
  pub cancelled: u64,
  pub retries: u64,
  /// Queued requests per tier.
  pub by_priority: BTreeMap<Priority, usize>,
  /// Rolling average over the most recent attempts.
  pub average_response_ms: f64,
  pub success_rate: f64,
}
