//! Queued offline operations and the records produced while replaying them.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use super::conflict::SyncConflict;
use crate::entity::{CacheConfig, ConflictPolicy, EntityKind, Priority};
use crate::error::{Error, Result};
use crate::remote::BatchItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
  Batch,
}

/// A mutation waiting to be replayed against the server. Plain data, so it
/// survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
  pub id: String,
  pub kind: OperationKind,
  pub entity: EntityKind,
  #[serde(default)]
  pub entity_id: Option<String>,
  /// Entity body for create/update, the item list for batch.
  #[serde(default)]
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub retry_count: u32,
  pub max_retries: u32,
  pub priority: Priority,
  #[serde(default)]
  pub dependencies: Vec<String>,
  pub conflict: ConflictPolicy,
}

impl OfflineOperation {
  fn new(kind: OperationKind, entity: EntityKind, entity_id: Option<String>, payload: Value) -> Self {
    let config = entity.default_config();
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      kind,
      entity,
      entity_id,
      payload,
      created_at: Utc::now(),
      retry_count: 0,
      max_retries: 3,
      priority: config.priority,
      dependencies: Vec::new(),
      conflict: config.conflict,
    }
  }

  /// The entity id is taken from `data.id` when the client assigned one.
  pub fn create(entity: EntityKind, data: Value) -> Self {
    let id = data.get("id").and_then(Value::as_str).map(str::to_string);
    Self::new(OperationKind::Create, entity, id, data)
  }

  pub fn update(entity: EntityKind, id: impl Into<String>, partial: Value) -> Self {
    Self::new(OperationKind::Update, entity, Some(id.into()), partial)
  }

  pub fn delete(entity: EntityKind, id: impl Into<String>) -> Self {
    Self::new(OperationKind::Delete, entity, Some(id.into()), Value::Null)
  }

  pub fn batch(entity: EntityKind, items: &[BatchItem]) -> Result<Self> {
    let payload = serde_json::to_value(items)?;
    Ok(Self::new(OperationKind::Batch, entity, None, payload))
  }

  /// Take priority and conflict policy from an entity's effective config.
  pub fn with_policy(mut self, config: &CacheConfig) -> Self {
    self.priority = config.priority;
    self.conflict = config.conflict;
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_conflict(mut self, conflict: ConflictPolicy) -> Self {
    self.conflict = conflict;
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn depends_on(mut self, id: impl Into<String>) -> Self {
    self.dependencies.push(id.into());
    self
  }

  pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
    self.created_at = created_at;
    self
  }

  pub fn batch_items(&self) -> Result<Vec<BatchItem>> {
    Ok(serde_json::from_value(self.payload.clone())?)
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
  }

  pub(crate) fn validate(&self) -> Result<()> {
    match self.kind {
      OperationKind::Update | OperationKind::Delete if self.entity_id.is_none() => Err(
        Error::Validation(format!("{:?} of {} needs an entity id", self.kind, self.entity)),
      ),
      OperationKind::Create | OperationKind::Update if !self.payload.is_object() => Err(
        Error::Validation(format!("{:?} of {} needs an object payload", self.kind, self.entity)),
      ),
      OperationKind::Batch => self.batch_items().map(|_| ()),
      _ => Ok(()),
    }
  }

  pub(crate) fn describe(&self) -> String {
    match &self.entity_id {
      Some(id) => format!("{:?} {}:{}", self.kind, self.entity, id),
      None => format!("{:?} {}", self.kind, self.entity),
    }
  }
}

/// An operation dropped without reaching the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
  pub operation: OfflineOperation,
  pub error: String,
  pub failed_at: DateTime<Utc>,
}

/// Outcome of a `sync_operations` call, summed over its passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub synced: usize,
  pub failed: usize,
  pub retried: usize,
  pub deferred: usize,
  pub expired: usize,
  pub conflicts: usize,
  /// Operations still queued after the pass.
  pub remaining: usize,
}

impl SyncReport {
  pub(crate) fn absorb(&mut self, pass: SyncReport) {
    self.synced += pass.synced;
    self.failed += pass.failed;
    self.retried += pass.retried;
    self.deferred += pass.deferred;
    self.expired += pass.expired;
    self.conflicts += pass.conflicts;
    self.remaining = pass.remaining;
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  Queued {
    id: String,
    entity: EntityKind,
    kind: OperationKind,
  },
  Started {
    pending: usize,
  },
  Synced {
    id: String,
    entity: EntityKind,
    entity_id: Option<String>,
    result: Value,
  },
  Conflict {
    conflict: SyncConflict,
    policy: ConflictPolicy,
  },
  Deferred {
    id: String,
    reason: String,
  },
  RetryScheduled {
    id: String,
    attempt: u32,
    delay: Duration,
  },
  Failed {
    id: String,
    error: Error,
  },
  Expired {
    id: String,
  },
  Completed(SyncReport),
}

/// Resolves once the queued operation reaches the server or is dropped.
#[derive(Debug)]
pub struct Pending {
  id: String,
  rx: oneshot::Receiver<Result<Value>>,
}

impl Pending {
  pub(crate) fn new(id: String, rx: oneshot::Receiver<Result<Value>>) -> Self {
    Self { id, rx }
  }

  pub fn id(&self) -> &str {
    &self.id
  }
}

impl Future for Pending {
  type Output = Result<Value>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let id = self.id.clone();
    Pin::new(&mut self.rx)
      .poll(cx)
      .map(|r| r.unwrap_or_else(|_| Err(Error::Cancelled(format!("operation {} dropped", id)))))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_defaults_follow_entity_policy() {
    let op = OfflineOperation::update(EntityKind::Cart, "c1", json!({"qty": 2}));
    assert_eq!(op.priority, Priority::Critical);
    assert_eq!(op.conflict, ConflictPolicy::Merge);
    assert!(op.validate().is_ok());
  }

  #[test]
  fn test_create_picks_up_client_id() {
    let op = OfflineOperation::create(EntityKind::Wishlist, json!({"id": "w9", "sku": "A"}));
    assert_eq!(op.entity_id.as_deref(), Some("w9"));
    let op = OfflineOperation::create(EntityKind::Orders, json!({"total": 10}));
    assert_eq!(op.entity_id, None);
  }

  #[test]
  fn test_validation() {
    let mut op = OfflineOperation::delete(EntityKind::Cart, "c1");
    op.entity_id = None;
    assert!(matches!(op.validate(), Err(Error::Validation(_))));

    let op = OfflineOperation::create(EntityKind::Orders, json!("not an object"));
    assert!(matches!(op.validate(), Err(Error::Validation(_))));

    let mut op = OfflineOperation::batch(EntityKind::Cart, &[]).unwrap();
    op.payload = json!({"bad": true});
    assert!(matches!(op.validate(), Err(Error::Serialization(_))));
  }

  #[test]
  fn test_persisted_shape() {
    let op = OfflineOperation::update(EntityKind::UserProfile, "u1", json!({"name": "Ada"}));
    let value = serde_json::to_value(&op).unwrap();
    assert_eq!(value["kind"], "update");
    assert_eq!(value["entity"], "user-profile");
    let back: OfflineOperation = serde_json::from_value(value).unwrap();
    assert_eq!(back, op);
  }
}
