//! Priority request queue with bounded concurrency.
//!
//! Requests are dispatched strictly by tier (FIFO within a tier) while the
//! number of active requests is below the ceiling. A request whose
//! dependencies are still queued, active or waiting to retry stays in the
//! queue. Failed attempts are re-enqueued one tier lower after an
//! exponential backoff.

mod request;

pub use request::{fetcher, Fetcher, RequestHandle, ResourceMetrics, ResourceRequest};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::breaker::CircuitBreaker;
use crate::connectivity::{Connectivity, NetworkStatus};
use crate::entity::Priority;
use crate::error::{Error, Result};

/// Response times kept for the rolling average.
const RESPONSE_WINDOW: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
  pub max_concurrency: usize,
  pub dedup: bool,
  pub default_timeout_secs: u64,
  pub default_max_retries: u32,
  pub backoff: Backoff,
}

impl Default for ResourceConfig {
  fn default() -> Self {
    Self {
      max_concurrency: 6,
      dedup: true,
      default_timeout_secs: 30,
      default_max_retries: 3,
      backoff: Backoff::default(),
    }
  }
}

type Waiter = oneshot::Sender<Result<Value>>;

struct Job {
  request: ResourceRequest,
  fetch: Fetcher,
  waiters: Vec<Waiter>,
}

impl Job {
  fn settle(self, result: Result<Value>) {
    for waiter in self.waiters {
      waiter.send(result.clone()).ok();
    }
  }
}

struct ActiveJob {
  job: Job,
  abort: AbortHandle,
}

#[derive(Default)]
struct State {
  /// Sorted by priority, highest first; FIFO within a tier.
  queue: VecDeque<Job>,
  active: HashMap<String, ActiveJob>,
  /// Jobs waiting out a backoff delay before re-entering the queue.
  retrying: HashMap<String, Job>,
  /// dedup key -> request id
  dedup: HashMap<String, String>,
  completed: u64,
  failed: u64,
  cancelled: u64,
  retries: u64,
  response_times: VecDeque<Duration>,
}

impl State {
  fn enqueue(&mut self, job: Job) {
    let pos = self
      .queue
      .iter()
      .position(|queued| queued.request.priority < job.request.priority)
      .unwrap_or(self.queue.len());
    self.queue.insert(pos, job);
  }

  fn is_pending(&self, id: &str) -> bool {
    self.active.contains_key(id)
      || self.retrying.contains_key(id)
      || self.queue.iter().any(|j| j.request.id == id)
  }

  fn job_mut(&mut self, id: &str) -> Option<&mut Job> {
    if let Some(active) = self.active.get_mut(id) {
      return Some(&mut active.job);
    }
    if let Some(job) = self.retrying.get_mut(id) {
      return Some(job);
    }
    self.queue.iter_mut().find(|j| j.request.id == id)
  }

  fn deps_met(&self, request: &ResourceRequest) -> bool {
    request
      .dependencies
      .iter()
      .filter(|dep| **dep != request.id)
      .all(|dep| !self.is_pending(dep))
  }

  /// Index of the next job to start, if any.
  fn next_dispatchable(&self, slow: bool) -> Option<usize> {
    let defer_background = slow
      && self
        .queue
        .iter()
        .any(|j| j.request.priority != Priority::Background);
    // a background job something queued depends on is never deferred
    let deferred = |job: &Job| {
      defer_background
        && job.request.priority == Priority::Background
        && !self
          .queue
          .iter()
          .any(|other| other.request.dependencies.contains(&job.request.id))
    };

    if let Some(found) = self
      .queue
      .iter()
      .position(|job| !deferred(job) && self.deps_met(&job.request))
    {
      return Some(found);
    }
    if self.queue.is_empty() || !self.active.is_empty() || !self.retrying.is_empty() {
      return None;
    }

    // Nothing else can make progress: run a deferred job rather than stall.
    if let Some(ready) = self.queue.iter().position(|job| self.deps_met(&job.request)) {
      return Some(ready);
    }

    let member = self.cycle_member()?;
    warn!(
      id = %self.queue[member].request.id,
      "Dependency cycle in request queue, starting one of its members"
    );
    Some(member)
  }

  /// Follows unmet dependencies from the head of the queue until one repeats.
  /// Only meaningful when every queued job waits on another queued job.
  fn cycle_member(&self) -> Option<usize> {
    let mut seen = HashSet::new();
    let mut index = 0;
    loop {
      if !seen.insert(index) {
        return Some(index);
      }
      let request = &self.queue.get(index)?.request;
      let dep = request
        .dependencies
        .iter()
        .filter(|dep| **dep != request.id)
        .find(|dep| self.is_pending(dep))?;
      index = self.queue.iter().position(|j| j.request.id == *dep)?;
    }
  }

  fn forget_dedup(&mut self, request: &ResourceRequest) {
    if let Some(key) = &request.dedup_key {
      if self.dedup.get(key) == Some(&request.id) {
        self.dedup.remove(key);
      }
    }
  }

  fn record_response(&mut self, elapsed: Duration) {
    if self.response_times.len() == RESPONSE_WINDOW {
      self.response_times.pop_front();
    }
    self.response_times.push_back(elapsed);
  }
}

struct Shared {
  state: Mutex<State>,
  config: ResourceConfig,
  connectivity: Connectivity,
  breaker: Option<Arc<CircuitBreaker>>,
  paused: AtomicBool,
}

/// Process-wide request scheduler. Cheap to clone.
#[derive(Clone)]
pub struct ResourceManager {
  shared: Arc<Shared>,
}

impl std::fmt::Debug for ResourceManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ResourceManager")
      .field("config", &self.shared.config)
      .field("metrics", &self.metrics())
      .finish()
  }
}

impl ResourceManager {
  pub fn new(config: ResourceConfig, connectivity: Connectivity) -> Self {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State::default()),
        config,
        connectivity,
        breaker: None,
        paused: AtomicBool::new(false),
      }),
    }
  }

  /// Route every attempt through `breaker`.
  pub fn with_breaker(config: ResourceConfig, connectivity: Connectivity, breaker: Arc<CircuitBreaker>) -> Self {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State::default()),
        config,
        connectivity,
        breaker: Some(breaker),
        paused: AtomicBool::new(false),
      }),
    }
  }

  pub fn config(&self) -> &ResourceConfig {
    &self.shared.config
  }

  /// A request pre-filled with the configured timeout and retry budget.
  pub fn request(&self, target: impl Into<String>) -> ResourceRequest {
    ResourceRequest::new(target)
      .with_timeout(Duration::from_secs(self.shared.config.default_timeout_secs.max(1)))
      .with_max_retries(self.shared.config.default_max_retries)
  }

  /// Queue `request`. The returned handle resolves with the result of the
  /// request, or of the in-flight request it was deduplicated into.
  pub fn add_request(&self, request: ResourceRequest, fetch: Fetcher) -> RequestHandle {
    if let Err(e) = request.validate() {
      return RequestHandle::settled(request.id, Err(e));
    }

    let (tx, rx) = oneshot::channel();
    let mut state = self.shared.state.lock();

    if self.shared.config.dedup {
      if let Some(key) = &request.dedup_key {
        if let Some(existing) = state.dedup.get(key).cloned() {
          if let Some(job) = state.job_mut(&existing) {
            debug!(key = %key, id = %existing, "Joining in-flight request");
            job.waiters.push(tx);
            return RequestHandle::new(existing, rx);
          }
        }
      }
    }

    if state.is_pending(&request.id) {
      return RequestHandle::settled(
        request.id.clone(),
        Err(Error::Validation(format!("request {} is already queued", request.id))),
      );
    }

    if self.shared.config.dedup {
      if let Some(key) = &request.dedup_key {
        state.dedup.insert(key.clone(), request.id.clone());
      }
    }
    debug!(id = %request.id, target = %request.target, priority = ?request.priority, "Queued request");
    let id = request.id.clone();
    state.enqueue(Job {
      request,
      fetch,
      waiters: vec![tx],
    });
    drop(state);

    self.pump();
    RequestHandle::new(id, rx)
  }

  /// Stop dispatching new requests. Active requests run to completion.
  pub fn pause(&self) {
    self.shared.paused.store(true, Ordering::SeqCst);
  }

  pub fn resume(&self) {
    self.shared.paused.store(false, Ordering::SeqCst);
    self.pump();
  }

  fn concurrency_limit(&self, status: &NetworkStatus) -> usize {
    let max = self.shared.config.max_concurrency.max(1);
    if status.is_slow() {
      (max / 2).max(1)
    } else {
      max
    }
  }

  /// Start as many queued requests as the ceiling allows.
  fn pump(&self) {
    if self.shared.paused.load(Ordering::SeqCst) {
      return;
    }
    let status = self.shared.connectivity.status();
    if !status.online {
      return;
    }
    let limit = self.concurrency_limit(&status);

    let mut state = self.shared.state.lock();
    while state.active.len() < limit {
      let Some(index) = state.next_dispatchable(status.is_slow()) else {
        break;
      };
      let Some(job) = state.queue.remove(index) else {
        break;
      };
      let id = job.request.id.clone();
      let manager = self.clone();
      let attempt = job.fetch.clone();
      let timeout = job.request.timeout;
      debug!(id = %id, target = %job.request.target, "Dispatching request");

      let handle = tokio::spawn(async move {
        let started = Instant::now();
        let result = manager.attempt(attempt, timeout).await;
        manager.complete(&id, result, started.elapsed());
      });
      state.active.insert(
        job.request.id.clone(),
        ActiveJob {
          job,
          abort: handle.abort_handle(),
        },
      );
    }
  }

  async fn attempt(&self, fetch: Fetcher, timeout: Duration) -> Result<Value> {
    let timed = || async move {
      match tokio::time::timeout(timeout, fetch()).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
      }
    };
    match &self.shared.breaker {
      Some(breaker) => breaker.execute(timed).await,
      None => timed().await,
    }
  }

  fn complete(&self, id: &str, result: Result<Value>, elapsed: Duration) {
    let mut state = self.shared.state.lock();
    let Some(ActiveJob { mut job, .. }) = state.active.remove(id) else {
      // cancelled while running
      return;
    };
    state.record_response(elapsed);

    match result {
      Ok(value) => {
        state.completed += 1;
        state.forget_dedup(&job.request);
        drop(state);
        job.settle(Ok(value));
      }
      Err(e) if e.is_retryable() && job.request.retry_count < job.request.max_retries => {
        job.request.retry_count += 1;
        job.request.priority = job.request.priority.downgrade();
        state.retries += 1;
        let delay = self.shared.config.backoff.delay(job.request.retry_count);
        info!(
          id,
          attempt = job.request.retry_count,
          ?delay,
          error = %e,
          "Request failed, scheduling retry"
        );
        state.retrying.insert(id.to_string(), job);
        drop(state);

        let manager = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
          tokio::time::sleep(delay).await;
          manager.requeue(&id);
        });
      }
      Err(e) => {
        state.failed += 1;
        state.forget_dedup(&job.request);
        drop(state);
        warn!(id, error = %e, "Request failed terminally");
        let err = if job.request.retry_count > 0 && e.is_retryable() {
          Error::exhausted(job.request.retry_count + 1, e)
        } else {
          e
        };
        job.settle(Err(err));
      }
    }
    self.pump();
  }

  fn requeue(&self, id: &str) {
    {
      let mut state = self.shared.state.lock();
      let Some(job) = state.retrying.remove(id) else {
        return;
      };
      state.enqueue(job);
    }
    self.pump();
  }

  /// Reject and drop every queued, retrying or active request carrying `tag`.
  pub fn cancel_by_tag(&self, tag: &str) -> usize {
    self.cancel_where(|request| request.tags.contains(tag), tag)
  }

  pub fn cancel_all(&self) -> usize {
    self.cancel_where(|_| true, "all")
  }

  fn cancel_where(&self, matches: impl Fn(&ResourceRequest) -> bool, reason: &str) -> usize {
    let mut cancelled: Vec<Job> = Vec::new();
    {
      let mut state = self.shared.state.lock();

      let (hit, keep): (VecDeque<Job>, VecDeque<Job>) =
        std::mem::take(&mut state.queue).into_iter().partition(|j| matches(&j.request));
      state.queue = keep;
      cancelled.extend(hit);

      let retry_ids: Vec<String> = state
        .retrying
        .iter()
        .filter(|(_, j)| matches(&j.request))
        .map(|(id, _)| id.clone())
        .collect();
      for id in retry_ids {
        if let Some(job) = state.retrying.remove(&id) {
          cancelled.push(job);
        }
      }

      let active_ids: Vec<String> = state
        .active
        .iter()
        .filter(|(_, a)| matches(&a.job.request))
        .map(|(id, _)| id.clone())
        .collect();
      for id in active_ids {
        if let Some(active) = state.active.remove(&id) {
          active.abort.abort();
          cancelled.push(active.job);
        }
      }

      for job in &cancelled {
        state.forget_dedup(&job.request);
      }
      state.cancelled += cancelled.len() as u64;
    }

    let count = cancelled.len();
    if count > 0 {
      info!(count, reason, "Cancelled requests");
    }
    for job in cancelled {
      let id = job.request.id.clone();
      job.settle(Err(Error::Cancelled(format!("request {} cancelled ({})", id, reason))));
    }
    self.pump();
    count
  }

  pub fn metrics(&self) -> ResourceMetrics {
    let state = self.shared.state.lock();
    let mut by_priority = std::collections::BTreeMap::new();
    for job in &state.queue {
      *by_priority.entry(job.request.priority).or_insert(0) += 1;
    }

    let average_response_ms = if state.response_times.is_empty() {
      0.0
    } else {
      let total: f64 = state.response_times.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
      total / state.response_times.len() as f64
    };
    let finished = state.completed + state.failed;
    let success_rate = if finished == 0 {
      1.0
    } else {
      state.completed as f64 / finished as f64
    };

    ResourceMetrics {
      active: state.active.len(),
      queued: state.queue.len(),
      retrying: state.retrying.len(),
      completed: state.completed,
      failed: state.failed,
      cancelled: state.cancelled,
      retries: state.retries,
      by_priority,
      average_response_ms,
      success_rate,
    }
  }

  /// Re-run dispatch whenever connectivity changes (back online, faster link).
  pub fn spawn_connectivity_watcher(&self) -> JoinHandle<()> {
    let manager = self.clone();
    let mut rx = self.shared.connectivity.subscribe();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        manager.pump();
      }
    })
  }
}
