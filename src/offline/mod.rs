//! Durable queue of mutations recorded while offline or failing.
//!
//! Every queue mutation is written through to [`LocalStorage`] before it is
//! acknowledged. Replay runs in priority-then-age order with dependencies
//! first, checks the server state for create/update before writing, and
//! retries transient failures with capped exponential backoff.

mod conflict;
mod operation;

pub use conflict::{ConflictResolver, FieldConflict, Side, SyncConflict};
pub use operation::{
  FailureRecord, OfflineOperation, OperationKind, Pending, SyncEvent, SyncReport,
};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::connectivity::Connectivity;
use crate::entity::{EntityKind, EntityPolicies};
use crate::error::{Error, Result};
use crate::remote::{BatchItem, RemoteSource};
use crate::storage::LocalStorage;
use self::conflict::Plan;

pub const QUEUE_KEY: &str = "offline_sync_queue";
pub const FAILURES_KEY: &str = "offline_sync_failures";

/// Failure records kept in the persisted log.
const MAX_FAILURE_RECORDS: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_retries: u32,
  pub backoff: Backoff,
  pub interval_secs: u64,
  /// Operations older than this are dropped with `Expired`.
  pub max_age_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(5 * 60)),
      interval_secs: 30,
      max_age_secs: 24 * 60 * 60,
    }
  }
}

type Waiter = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct Queue {
  operations: Vec<OfflineOperation>,
  waiters: HashMap<String, Vec<Waiter>>,
  /// Earliest time an operation that failed may be attempted again.
  not_before: HashMap<String, Instant>,
}

impl Queue {
  fn contains(&self, id: &str) -> bool {
    self.operations.iter().any(|op| op.id == id)
  }

  fn remove(&mut self, id: &str) -> Option<(OfflineOperation, Vec<Waiter>)> {
    let pos = self.operations.iter().position(|op| op.id == id)?;
    let op = self.operations.remove(pos);
    self.not_before.remove(id);
    let waiters = self.waiters.remove(id).unwrap_or_default();
    Some((op, waiters))
  }

  /// Ids in replay order: priority desc, then oldest first, with every
  /// queued dependency ahead of its dependents. Back edges found while
  /// walking a cycle are returned so the cycle does not block itself.
  fn replay_order(&self) -> (Vec<String>, HashSet<(String, String)>) {
    let mut sorted: Vec<&OfflineOperation> = self.operations.iter().collect();
    sorted.sort_by(|a, b| {
      b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
    });
    let by_id: HashMap<&str, &OfflineOperation> =
      sorted.iter().map(|op| (op.id.as_str(), *op)).collect();

    let mut order = Vec::with_capacity(sorted.len());
    let mut processed = HashSet::new();
    let mut processing = HashSet::new();
    let mut back_edges = HashSet::new();

    fn visit<'a>(
      op: &'a OfflineOperation,
      by_id: &HashMap<&str, &'a OfflineOperation>,
      processed: &mut HashSet<&'a str>,
      processing: &mut HashSet<&'a str>,
      back_edges: &mut HashSet<(String, String)>,
      order: &mut Vec<String>,
    ) {
      if processed.contains(op.id.as_str()) {
        return;
      }
      processing.insert(op.id.as_str());
      for dep in &op.dependencies {
        if processing.contains(dep.as_str()) {
          back_edges.insert((op.id.clone(), dep.clone()));
          continue;
        }
        if let Some(dep_op) = by_id.get(dep.as_str()) {
          visit(dep_op, by_id, processed, processing, back_edges, order);
        }
      }
      processing.remove(op.id.as_str());
      processed.insert(op.id.as_str());
      order.push(op.id.clone());
    }

    for op in &sorted {
      visit(op, &by_id, &mut processed, &mut processing, &mut back_edges, &mut order);
    }
    (order, back_edges)
  }
}

struct Shared {
  queue: Mutex<Queue>,
  remote: Arc<dyn RemoteSource>,
  storage: Arc<dyn LocalStorage>,
  connectivity: Connectivity,
  policies: EntityPolicies,
  config: SyncConfig,
  resolver: RwLock<Option<Arc<dyn ConflictResolver>>>,
  events: broadcast::Sender<SyncEvent>,
  syncing: AtomicBool,
  /// Set when a pass was requested while another was running.
  rerun: AtomicBool,
}

/// Offline operation queue. Cheap to clone.
#[derive(Clone)]
pub struct OfflineSync {
  shared: Arc<Shared>,
}

impl std::fmt::Debug for OfflineSync {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OfflineSync")
      .field("queued", &self.len())
      .field("syncing", &self.is_syncing())
      .finish()
  }
}

/// Clears the syncing flag when a pass ends, however it ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

enum Replay {
  Done(Value),
  Unresolved,
}

impl OfflineSync {
  /// Restores any queue persisted by a previous run.
  pub fn new(
    remote: Arc<dyn RemoteSource>,
    storage: Arc<dyn LocalStorage>,
    connectivity: Connectivity,
    policies: EntityPolicies,
    config: SyncConfig,
  ) -> Self {
    let operations = match storage.get_item(QUEUE_KEY) {
      Ok(Some(raw)) => match serde_json::from_str::<Vec<OfflineOperation>>(&raw) {
        Ok(ops) => {
          if !ops.is_empty() {
            info!(count = ops.len(), "Restored offline queue");
          }
          ops
        }
        Err(e) => {
          warn!(error = %e, "Discarding unreadable offline queue");
          Vec::new()
        }
      },
      Ok(None) => Vec::new(),
      Err(e) => {
        warn!(error = %e, "Failed to read offline queue");
        Vec::new()
      }
    };

    let (events, _) = broadcast::channel(256);
    Self {
      shared: Arc::new(Shared {
        queue: Mutex::new(Queue {
          operations,
          ..Queue::default()
        }),
        remote,
        storage,
        connectivity,
        policies,
        config,
        resolver: RwLock::new(None),
        events,
        syncing: AtomicBool::new(false),
        rerun: AtomicBool::new(false),
      }),
    }
  }

  pub fn set_resolver(&self, resolver: Arc<dyn ConflictResolver>) {
    *self.shared.resolver.write() = Some(resolver);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.shared.events.subscribe()
  }

  fn emit(&self, event: SyncEvent) {
    // no receivers is fine
    self.shared.events.send(event).ok();
  }

  pub fn create(&self, entity: EntityKind, data: Value) -> Result<Pending> {
    let op = OfflineOperation::create(entity, data);
    self.enqueue(self.with_defaults(op))
  }

  pub fn update(&self, entity: EntityKind, id: &str, partial: Value) -> Result<Pending> {
    let op = OfflineOperation::update(entity, id, partial);
    self.enqueue(self.with_defaults(op))
  }

  pub fn delete(&self, entity: EntityKind, id: &str) -> Result<Pending> {
    let op = OfflineOperation::delete(entity, id);
    self.enqueue(self.with_defaults(op))
  }

  pub fn batch(&self, entity: EntityKind, items: &[BatchItem]) -> Result<Pending> {
    let op = OfflineOperation::batch(entity, items)?;
    self.enqueue(self.with_defaults(op))
  }

  fn with_defaults(&self, op: OfflineOperation) -> OfflineOperation {
    let policy = self.shared.policies.get(op.entity);
    op.with_policy(&policy)
      .with_max_retries(self.shared.config.max_retries)
  }

  /// Persist `op` and, when online, start a sync pass in the background.
  pub fn enqueue(&self, op: OfflineOperation) -> Result<Pending> {
    op.validate()?;
    let (tx, rx) = oneshot::channel();
    let id = op.id.clone();
    let (entity, kind) = (op.entity, op.kind);
    {
      let mut queue = self.shared.queue.lock();
      if queue.contains(&id) {
        return Err(Error::Validation(format!("operation {} is already queued", id)));
      }
      queue.operations.push(op);
      if let Err(e) = self.persist(&queue.operations) {
        queue.operations.pop();
        return Err(e);
      }
      queue.waiters.entry(id.clone()).or_default().push(tx);
    }
    debug!(id = %id, %entity, ?kind, "Queued offline operation");
    self.emit(SyncEvent::Queued {
      id: id.clone(),
      entity,
      kind,
    });

    if self.shared.connectivity.is_online() {
      self.spawn_sync();
    }
    Ok(Pending::new(id, rx))
  }

  fn spawn_sync(&self) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      let sync = self.clone();
      handle.spawn(async move { sync.run_sync().await });
    }
  }

  async fn run_sync(&self) {
    if let Err(e) = self.sync_operations().await {
      warn!(error = %e, "Offline sync pass failed");
    }
  }

  fn persist(&self, operations: &[OfflineOperation]) -> Result<()> {
    let raw = serde_json::to_string(operations)?;
    self.shared.storage.set_item(QUEUE_KEY, &raw)
  }

  fn persist_queue(&self) {
    let queue = self.shared.queue.lock();
    if let Err(e) = self.persist(&queue.operations) {
      warn!(error = %e, "Failed to persist offline queue");
    }
  }

  /// Queued operations in replay order.
  pub fn pending(&self) -> Vec<OfflineOperation> {
    let queue = self.shared.queue.lock();
    let (order, _) = queue.replay_order();
    order
      .iter()
      .filter_map(|id| queue.operations.iter().find(|op| op.id == *id).cloned())
      .collect()
  }

  pub fn len(&self) -> usize {
    self.shared.queue.lock().operations.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_syncing(&self) -> bool {
    self.shared.syncing.load(Ordering::SeqCst)
  }

  /// Drop every queued operation, rejecting their handles.
  pub fn clear(&self) -> Result<usize> {
    let (operations, waiters) = {
      let mut queue = self.shared.queue.lock();
      let operations = std::mem::take(&mut queue.operations);
      let waiters = std::mem::take(&mut queue.waiters);
      queue.not_before.clear();
      self.persist(&queue.operations)?;
      (operations, waiters)
    };
    for (id, senders) in waiters {
      for tx in senders {
        tx.send(Err(Error::Cancelled(format!("operation {} cleared", id)))).ok();
      }
    }
    info!(count = operations.len(), "Cleared offline queue");
    Ok(operations.len())
  }

  /// Terminal failures, most recent last.
  pub fn failures(&self) -> Result<Vec<FailureRecord>> {
    match self.shared.storage.get_item(FAILURES_KEY)? {
      Some(raw) => Ok(serde_json::from_str(&raw)?),
      None => Ok(Vec::new()),
    }
  }

  pub fn clear_failures(&self) -> Result<()> {
    self.shared.storage.remove_item(FAILURES_KEY)
  }

  fn record_failure(&self, operation: OfflineOperation, error: &Error) {
    let mut records = self.failures().unwrap_or_else(|e| {
      warn!(error = %e, "Resetting unreadable failure log");
      Vec::new()
    });
    records.push(FailureRecord {
      operation,
      error: error.to_string(),
      failed_at: Utc::now(),
    });
    if records.len() > MAX_FAILURE_RECORDS {
      let excess = records.len() - MAX_FAILURE_RECORDS;
      records.drain(..excess);
    }
    let result = serde_json::to_string(&records)
      .map_err(Error::from)
      .and_then(|raw| self.shared.storage.set_item(FAILURES_KEY, &raw));
    if let Err(e) = result {
      warn!(error = %e, "Failed to persist failure log");
    }
  }

  /// Remove `id` from the queue for good and reject its handles with `error`.
  fn drop_operation(&self, id: &str, error: Error) {
    let removed = {
      let mut queue = self.shared.queue.lock();
      let removed = queue.remove(id);
      if let Err(e) = self.persist(&queue.operations) {
        warn!(error = %e, "Failed to persist offline queue");
      }
      removed
    };
    let Some((op, waiters)) = removed else {
      return;
    };
    warn!(id, operation = %op.describe(), error = %error, "Dropping offline operation");
    self.record_failure(op, &error);
    for tx in waiters {
      tx.send(Err(error.clone())).ok();
    }
  }

  /// Drop operations older than the configured maximum age.
  fn expire(&self) -> usize {
    let max_age = Duration::from_secs(self.shared.config.max_age_secs);
    let now = Utc::now();
    let expired: Vec<String> = self
      .shared
      .queue
      .lock()
      .operations
      .iter()
      .filter(|op| op.age(now) > max_age)
      .map(|op| op.id.clone())
      .collect();

    for id in &expired {
      self.drop_operation(id, Error::Expired(id.clone()));
      self.emit(SyncEvent::Expired { id: id.clone() });
    }
    expired.len()
  }

  /// Replay the queue. A call made while a pass is running returns at once
  /// and the running pass goes around again, so operations queued in the
  /// meantime are not left for the next tick.
  pub async fn sync_operations(&self) -> Result<SyncReport> {
    let mut total = SyncReport::default();
    loop {
      if self.shared.syncing.swap(true, Ordering::SeqCst) {
        self.shared.rerun.store(true, Ordering::SeqCst);
        debug!("Sync already in progress, another pass requested");
        total.remaining = self.len();
        return Ok(total);
      }
      {
        let _guard = SyncGuard(&self.shared.syncing);
        self.shared.rerun.store(false, Ordering::SeqCst);
        total.absorb(self.sync_pass().await?);
      }
      // checked after the flag is released so a request racing the end of
      // the pass is not lost
      if !self.shared.rerun.swap(false, Ordering::SeqCst) {
        return Ok(total);
      }
    }
  }

  async fn sync_pass(&self) -> Result<SyncReport> {
    let mut report = SyncReport {
      expired: self.expire(),
      ..SyncReport::default()
    };

    if !self.shared.connectivity.is_online() {
      report.remaining = self.len();
      return Ok(report);
    }

    let (order, back_edges) = self.shared.queue.lock().replay_order();
    if order.is_empty() {
      return Ok(report);
    }
    info!(pending = order.len(), "Syncing offline operations");
    self.emit(SyncEvent::Started {
      pending: order.len(),
    });

    for id in order {
      if !self.shared.connectivity.is_online() {
        info!("Went offline during sync, stopping");
        break;
      }

      let op = {
        let queue = self.shared.queue.lock();
        let Some(op) = queue.operations.iter().find(|op| op.id == id).cloned() else {
          continue;
        };
        if queue.not_before.get(&id).is_some_and(|t| *t > Instant::now()) {
          drop(queue);
          report.deferred += 1;
          self.emit(SyncEvent::Deferred {
            id,
            reason: "waiting for retry backoff".into(),
          });
          continue;
        }
        let blocked = op.dependencies.iter().find(|dep| {
          **dep != op.id
            && queue.contains(dep)
            && !back_edges.contains(&(op.id.clone(), (*dep).clone()))
        });
        if let Some(dep) = blocked {
          let reason = format!("waiting on dependency {}", dep);
          drop(queue);
          report.deferred += 1;
          self.emit(SyncEvent::Deferred { id, reason });
          continue;
        }
        op
      };

      match self.replay(&op, &mut report).await {
        Ok(Replay::Done(result)) => {
          let removed = {
            let mut queue = self.shared.queue.lock();
            let removed = queue.remove(&op.id);
            if let Err(e) = self.persist(&queue.operations) {
              warn!(error = %e, "Failed to persist offline queue");
            }
            removed
          };
          report.synced += 1;
          debug!(id = %op.id, operation = %op.describe(), "Synced offline operation");
          self.emit(SyncEvent::Synced {
            id: op.id.clone(),
            entity: op.entity,
            entity_id: op
              .entity_id
              .clone()
              .or_else(|| result.get("id").and_then(Value::as_str).map(str::to_string)),
            result: result.clone(),
          });
          if let Some((_, waiters)) = removed {
            for tx in waiters {
              tx.send(Ok(result.clone())).ok();
            }
          }
        }
        Ok(Replay::Unresolved) => {
          report.deferred += 1;
          self.emit(SyncEvent::Deferred {
            id: op.id.clone(),
            reason: "awaiting manual conflict resolution".into(),
          });
        }
        Err(e) => self.handle_failure(op, e, &mut report),
      }
    }

    report.remaining = self.len();
    info!(
      synced = report.synced,
      failed = report.failed,
      deferred = report.deferred,
      remaining = report.remaining,
      "Offline sync finished"
    );
    self.emit(SyncEvent::Completed(report.clone()));
    Ok(report)
  }

  fn handle_failure(&self, op: OfflineOperation, error: Error, report: &mut SyncReport) {
    if !error.is_transient() {
      report.failed += 1;
      self.emit(SyncEvent::Failed {
        id: op.id.clone(),
        error: error.clone(),
      });
      self.drop_operation(&op.id, error);
      return;
    }

    let attempt = op.retry_count + 1;
    if attempt > op.max_retries {
      let error = Error::exhausted(attempt, error);
      report.failed += 1;
      self.emit(SyncEvent::Failed {
        id: op.id.clone(),
        error: error.clone(),
      });
      self.drop_operation(&op.id, error);
      return;
    }

    let delay = self.shared.config.backoff.delay(attempt);
    {
      let mut queue = self.shared.queue.lock();
      let Some(queued) = queue.operations.iter_mut().find(|q| q.id == op.id) else {
        return;
      };
      queued.retry_count = attempt;
      queue.not_before.insert(op.id.clone(), Instant::now() + delay);
    }
    self.persist_queue();

    report.retried += 1;
    info!(id = %op.id, attempt, ?delay, error = %error, "Offline operation failed, retrying later");
    self.emit(SyncEvent::RetryScheduled {
      id: op.id.clone(),
      attempt,
      delay,
    });

    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      let sync = self.clone();
      handle.spawn(async move {
        tokio::time::sleep(delay).await;
        if sync.shared.connectivity.is_online() {
          sync.run_sync().await;
        }
      });
    }
  }

  async fn replay(&self, op: &OfflineOperation, report: &mut SyncReport) -> Result<Replay> {
    let remote = &self.shared.remote;
    match op.kind {
      OperationKind::Delete => {
        let id = op.entity_id.as_deref().unwrap_or_default();
        remote.delete_entity(op.entity, id).await?;
        Ok(Replay::Done(Value::Null))
      }
      OperationKind::Batch => {
        let items = op.batch_items()?;
        let results = remote.batch(&items).await?;
        Ok(Replay::Done(Value::Array(results)))
      }
      OperationKind::Create | OperationKind::Update => {
        let server = match &op.entity_id {
          Some(id) => remote.fetch_entity(op.entity, id).await?,
          None => None,
        };
        let (Some(server), Some(id)) = (server, op.entity_id.as_deref()) else {
          return self.write(op, &op.payload).await.map(Replay::Done);
        };

        match self.resolve(op, id, server, report).await? {
          Some(Plan::Write(payload)) => remote.update_entity(op.entity, id, &payload).await.map(Replay::Done),
          Some(Plan::Adopt(server)) => Ok(Replay::Done(server)),
          Some(Plan::Ask) | None => Ok(Replay::Unresolved),
        }
      }
    }
  }

  async fn write(&self, op: &OfflineOperation, payload: &Value) -> Result<Value> {
    let remote = &self.shared.remote;
    match (op.kind, op.entity_id.as_deref()) {
      (OperationKind::Update, Some(id)) => remote.update_entity(op.entity, id, payload).await,
      _ => remote.create_entity(op.entity, payload).await,
    }
  }

  /// Settle a create/update against existing server state. `None` means a
  /// manual conflict nobody decided yet.
  async fn resolve(
    &self,
    op: &OfflineOperation,
    entity_id: &str,
    server: Value,
    report: &mut SyncReport,
  ) -> Result<Option<Plan>> {
    let server_fields = self.shared.policies.get(op.entity).server_fields;
    let (plan, fields) = conflict::plan(op.conflict, &op.payload, &server, &server_fields);
    if fields.is_empty() {
      return Ok(Some(plan));
    }

    report.conflicts += 1;
    let mut conflict = SyncConflict {
      operation_id: op.id.clone(),
      entity: op.entity,
      entity_id: entity_id.to_string(),
      local: op.payload.clone(),
      server,
      fields,
    };

    let plan = match plan {
      Plan::Ask => {
        let resolver = self.shared.resolver.read().clone();
        let decision = match resolver {
          Some(resolver) => resolver.resolve(&conflict).await,
          None => None,
        };
        match decision {
          Some(value) => {
            for field in &mut conflict.fields {
              let kept_local = value.get(field.field.as_str()) == Some(&field.local);
              field.kept = Some(if kept_local { Side::Client } else { Side::Server });
            }
            Some(Plan::Write(value))
          }
          None => {
            debug!(id = %op.id, "Manual conflict left unresolved");
            None
          }
        }
      }
      other => Some(other),
    };

    info!(
      id = %op.id,
      entity = %op.entity,
      entity_id,
      policy = ?op.conflict,
      fields = conflict.fields.len(),
      "Sync conflict"
    );
    self.emit(SyncEvent::Conflict {
      conflict,
      policy: op.conflict,
    });
    Ok(plan)
  }

  /// Spawn the background loop: sync when connectivity comes back, persist
  /// when it drops, and sync periodically while anything is queued.
  pub fn start(&self) -> JoinHandle<()> {
    let sync = self.clone();
    let mut rx = self.shared.connectivity.subscribe();
    let period = Duration::from_secs(self.shared.config.interval_secs.max(1));

    tokio::spawn(async move {
      let mut online = rx.borrow_and_update().online;
      if online && !sync.is_empty() {
        sync.run_sync().await;
      }

      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          changed = rx.changed() => {
            if changed.is_err() {
              break;
            }
            let now_online = rx.borrow_and_update().online;
            if now_online == online {
              continue;
            }
            online = now_online;
            if online {
              info!(queued = sync.len(), "Back online, syncing offline queue");
              sync.run_sync().await;
            } else {
              info!(queued = sync.len(), "Offline, persisting queue");
              sync.persist_queue();
            }
          }
          _ = ticker.tick() => {
            if online && !sync.is_empty() {
              sync.run_sync().await;
            }
          }
        }
      }
    })
  }
}
