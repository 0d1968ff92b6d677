//! Optimistic writes: show the tentative value right away, then confirm it
//! with the server's answer or put the cache back exactly as it was.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheStore, SetOptions};
use crate::entity::{ConflictPolicy, EntityKind, EntityPolicies};
use crate::error::Result;
use crate::keys::entity_key;

/// An optimistic write that has not been confirmed or rolled back yet.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticUpdate {
  pub id: String,
  pub entity: EntityKind,
  pub entity_id: String,
  /// Value shown to readers. `None` for a tentative delete.
  pub tentative: Option<Value>,
  pub conflict: ConflictPolicy,
  pub started_at: Instant,
  seq: u64,
  snapshot: Option<CacheEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptimisticEvent {
  Applied {
    id: String,
    entity: EntityKind,
    entity_id: String,
  },
  Confirmed {
    id: String,
    entity: EntityKind,
    entity_id: String,
    data: Value,
  },
  RolledBack {
    id: String,
    entity: EntityKind,
    entity_id: String,
    reason: String,
  },
  /// Tracking stopped with the tentative value left in place.
  Settled {
    id: String,
    entity: EntityKind,
    entity_id: String,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimisticOptions {
  pub rollback_on_error: bool,
}

impl Default for OptimisticOptions {
  fn default() -> Self {
    Self {
      rollback_on_error: true,
    }
  }
}

/// Tracks in-flight optimistic writes against a [`CacheStore`].
#[derive(Clone)]
pub struct OptimisticCoordinator {
  cache: CacheStore,
  policies: EntityPolicies,
  updates: Arc<Mutex<HashMap<String, OptimisticUpdate>>>,
  seq: Arc<AtomicU64>,
  events: broadcast::Sender<OptimisticEvent>,
}

impl std::fmt::Debug for OptimisticCoordinator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OptimisticCoordinator")
      .field("pending", &self.updates.lock().len())
      .finish()
  }
}

impl OptimisticCoordinator {
  pub fn new(cache: CacheStore, policies: EntityPolicies) -> Self {
    let (events, _) = broadcast::channel(256);
    Self {
      cache,
      policies,
      updates: Arc::new(Mutex::new(HashMap::new())),
      seq: Arc::new(AtomicU64::new(0)),
      events,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<OptimisticEvent> {
    self.events.subscribe()
  }

  fn options_for(&self, entity: EntityKind, entity_id: &str) -> SetOptions {
    let config = self.policies.get(entity);
    SetOptions::from(&config)
      .with_tag(entity.name())
      .with_tag(entity_key(entity, entity_id))
  }

  /// Write `tentative` into the cache and start tracking it. Object values
  /// are layered over the cached entity so partial updates read as whole
  /// entities. Returns the update id.
  pub fn begin(&self, entity: EntityKind, entity_id: &str, tentative: Option<Value>) -> String {
    let key = entity_key(entity, entity_id);
    let snapshot = self.cache.snapshot(&key);

    match &tentative {
      Some(value) => {
        let shown = overlay(snapshot.as_ref().map(|e| &e.value), value);
        self
          .cache
          .set(&key, shown, self.options_for(entity, entity_id));
      }
      None => {
        self.cache.delete(&key);
      }
    }

    let id = uuid::Uuid::new_v4().to_string();
    let update = OptimisticUpdate {
      id: id.clone(),
      entity,
      entity_id: entity_id.to_string(),
      tentative,
      conflict: self.policies.get(entity).conflict,
      started_at: Instant::now(),
      seq: self.seq.fetch_add(1, Ordering::SeqCst),
      snapshot,
    };
    self.updates.lock().insert(id.clone(), update);
    debug!(id = %id, %entity, entity_id, "Applied optimistic update");
    self.events.send(OptimisticEvent::Applied {
      id: id.clone(),
      entity,
      entity_id: entity_id.to_string(),
    }).ok();
    id
  }

  /// Replace the tentative value with the server's. `Value::Null` means the
  /// entity is gone. Newer updates to the same entity that are still
  /// pending are rebased onto the server value and stay visible.
  pub fn confirm(&self, id: &str, server: Value) -> bool {
    let update = {
      let mut updates = self.updates.lock();
      let Some(update) = updates.remove(id) else {
        return false;
      };
      let key = entity_key(update.entity, &update.entity_id);
      let options = self.options_for(update.entity, &update.entity_id);
      if server.is_null() {
        self.cache.delete(&key);
      } else {
        self.cache.set(&key, server.clone(), options.clone());
      }

      let mut newer: Vec<&mut OptimisticUpdate> = updates
        .values_mut()
        .filter(|u| {
          u.entity == update.entity && u.entity_id == update.entity_id && u.seq > update.seq
        })
        .collect();
      if !newer.is_empty() {
        newer.sort_by_key(|u| u.seq);
        let confirmed = self.cache.snapshot(&key);
        let mut shown = confirmed.as_ref().map(|e| e.value.clone());
        for later in &newer {
          shown = later
            .tentative
            .as_ref()
            .map(|value| overlay(shown.as_ref(), value));
        }
        newer[0].snapshot = confirmed;
        match shown {
          Some(value) => self.cache.set(&key, value, options),
          None => {
            self.cache.delete(&key);
          }
        }
        debug!(id, pending = newer.len(), "Rebased newer optimistic updates");
      }
      update
    };

    debug!(id, entity = %update.entity, entity_id = %update.entity_id, "Confirmed optimistic update");
    self.events.send(OptimisticEvent::Confirmed {
      id: update.id,
      entity: update.entity,
      entity_id: update.entity_id,
      data: server,
    }).ok();
    true
  }

  /// Put the cache back to what it held before the update. When a newer
  /// update to the same entity is still pending, its value stays and it
  /// inherits this update's snapshot instead.
  pub fn rollback(&self, id: &str, reason: &str) -> bool {
    let update = {
      let mut updates = self.updates.lock();
      let Some(update) = updates.remove(id) else {
        return false;
      };
      let newer = updates
        .values_mut()
        .filter(|u| {
          u.entity == update.entity && u.entity_id == update.entity_id && u.seq > update.seq
        })
        .min_by_key(|u| u.seq);
      match newer {
        Some(next) => next.snapshot = update.snapshot.clone(),
        None => {
          let key = entity_key(update.entity, &update.entity_id);
          self.cache.restore(&key, update.snapshot.clone());
        }
      }
      update
    };

    info!(id, entity = %update.entity, entity_id = %update.entity_id, reason, "Rolled back optimistic update");
    self.events.send(OptimisticEvent::RolledBack {
      id: update.id,
      entity: update.entity,
      entity_id: update.entity_id,
      reason: reason.to_string(),
    }).ok();
    true
  }

  /// Stop tracking without touching the cache. Used when the write is
  /// handed to offline sync.
  pub fn settle(&self, id: &str) -> bool {
    let Some(update) = self.updates.lock().remove(id) else {
      return false;
    };
    self.events.send(OptimisticEvent::Settled {
      id: update.id,
      entity: update.entity,
      entity_id: update.entity_id,
    }).ok();
    true
  }

  pub fn cancel(&self, id: &str) -> bool {
    self.rollback(id, "cancelled")
  }

  /// Apply `tentative`, run `mutation`, then confirm or roll back.
  pub async fn apply<F, Fut>(
    &self,
    entity: EntityKind,
    entity_id: &str,
    tentative: Option<Value>,
    options: OptimisticOptions,
    mutation: F,
  ) -> Result<Value>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>>,
  {
    let id = self.begin(entity, entity_id, tentative);
    match mutation().await {
      Ok(server) => {
        self.confirm(&id, server.clone());
        Ok(server)
      }
      Err(e) => {
        if options.rollback_on_error {
          self.rollback(&id, &e.to_string());
        } else {
          self.settle(&id);
        }
        Err(e)
      }
    }
  }

  /// Pending updates for one entity, oldest first.
  pub fn pending_for(&self, entity: EntityKind, entity_id: &str) -> Vec<OptimisticUpdate> {
    let mut pending: Vec<_> = self
      .updates
      .lock()
      .values()
      .filter(|u| u.entity == entity && u.entity_id == entity_id)
      .cloned()
      .collect();
    pending.sort_by_key(|u| u.seq);
    pending
  }

  pub fn pending(&self) -> Vec<OptimisticUpdate> {
    let mut pending: Vec<_> = self.updates.lock().values().cloned().collect();
    pending.sort_by_key(|u| u.seq);
    pending
  }

  pub fn has_pending(&self, entity: EntityKind, entity_id: &str) -> bool {
    self
      .updates
      .lock()
      .values()
      .any(|u| u.entity == entity && u.entity_id == entity_id)
  }
}

/// Layer an object over the current object so partial writes read as whole
/// entities. Anything else replaces the current value.
fn overlay(current: Option<&Value>, changes: &Value) -> Value {
  match (current, changes) {
    (Some(Value::Object(current)), Value::Object(changes)) => {
      let mut merged = current.clone();
      for (k, v) in changes {
        merged.insert(k.clone(), v.clone());
      }
      Value::Object(merged)
    }
    _ => changes.clone(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use serde_json::json;

  fn coordinator() -> (OptimisticCoordinator, CacheStore) {
    let cache = CacheStore::default();
    (OptimisticCoordinator::new(cache.clone(), EntityPolicies::default()), cache)
  }

  #[tokio::test]
  async fn test_rollback_restores_exact_entry() {
    let (opt, cache) = coordinator();
    cache.set(
      "cart:c1",
      json!({"id": "c1", "qty": 1}),
      SetOptions::default().with_tag("cart"),
    );
    let before = cache.snapshot("cart:c1");

    let result = opt
      .apply(
        EntityKind::Cart,
        "c1",
        Some(json!({"qty": 5})),
        OptimisticOptions::default(),
        || async {
          assert_eq!(cache.get("cart:c1"), Some(json!({"id": "c1", "qty": 5})));
          Err(Error::Network("down".into()))
        },
      )
      .await;

    assert!(result.is_err());
    assert_eq!(cache.snapshot("cart:c1"), before);
    assert!(opt.pending().is_empty());
  }

  #[tokio::test]
  async fn test_rollback_of_new_entity_removes_it() {
    let (opt, cache) = coordinator();
    let id = opt.begin(EntityKind::Wishlist, "w1", Some(json!({"sku": "A"})));
    assert!(cache.has("wishlist:w1"));
    assert!(opt.rollback(&id, "rejected"));
    assert_eq!(cache.snapshot("wishlist:w1"), None);
  }

  #[tokio::test]
  async fn test_confirm_writes_server_value() {
    let (opt, cache) = coordinator();
    let mut events = opt.subscribe();
    let result = opt
      .apply(
        EntityKind::Cart,
        "c1",
        Some(json!({"qty": 2})),
        OptimisticOptions::default(),
        || async { Ok(json!({"id": "c1", "qty": 2, "total": 20})) },
      )
      .await
      .unwrap();
    assert_eq!(result["total"], 20);
    assert_eq!(cache.get("cart:c1"), Some(json!({"id": "c1", "qty": 2, "total": 20})));
    assert!(matches!(events.try_recv(), Ok(OptimisticEvent::Applied { .. })));
    assert!(matches!(events.try_recv(), Ok(OptimisticEvent::Confirmed { .. })));
  }

  #[tokio::test]
  async fn test_tentative_delete_and_rollback() {
    let (opt, cache) = coordinator();
    cache.set("orders:o1", json!({"id": "o1"}), SetOptions::default());
    let before = cache.snapshot("orders:o1");
    let id = opt.begin(EntityKind::Orders, "o1", None);
    assert!(!cache.has("orders:o1"));
    opt.cancel(&id);
    assert_eq!(cache.snapshot("orders:o1"), before);
  }

  #[tokio::test]
  async fn test_no_rollback_when_suppressed() {
    let (opt, cache) = coordinator();
    let result = opt
      .apply(
        EntityKind::Cart,
        "c1",
        Some(json!({"qty": 3})),
        OptimisticOptions {
          rollback_on_error: false,
        },
        || async { Err(Error::Timeout(std::time::Duration::from_secs(1))) },
      )
      .await;
    assert!(result.is_err());
    assert_eq!(cache.get("cart:c1"), Some(json!({"qty": 3})));
    assert!(!opt.has_pending(EntityKind::Cart, "c1"));
  }

  #[tokio::test]
  async fn test_stacked_updates_roll_back_in_any_order() {
    let (opt, cache) = coordinator();
    cache.set("cart:c1", json!({"qty": 1}), SetOptions::default());
    let original = cache.snapshot("cart:c1");

    let first = opt.begin(EntityKind::Cart, "c1", Some(json!({"qty": 2})));
    let second = opt.begin(EntityKind::Cart, "c1", Some(json!({"qty": 3})));
    assert_eq!(opt.pending_for(EntityKind::Cart, "c1").len(), 2);

    // Older one fails first: the newer value stays visible.
    opt.rollback(&first, "failed");
    assert_eq!(cache.get("cart:c1"), Some(json!({"qty": 3})));

    // Then the newer one fails: back to the original.
    opt.rollback(&second, "failed");
    assert_eq!(cache.snapshot("cart:c1"), original);
  }

  #[tokio::test]
  async fn test_older_confirm_keeps_newer_tentative_visible() {
    let (opt, cache) = coordinator();
    cache.set("cart:c1", json!({"id": "c1", "qty": 1, "total": 10}), SetOptions::default());

    let first = opt.begin(EntityKind::Cart, "c1", Some(json!({"qty": 2})));
    let second = opt.begin(EntityKind::Cart, "c1", Some(json!({"note": "gift"})));

    assert!(opt.confirm(&first, json!({"id": "c1", "qty": 2, "total": 20})));
    assert_eq!(
      cache.get("cart:c1"),
      Some(json!({"id": "c1", "qty": 2, "total": 20, "note": "gift"}))
    );
    assert!(opt.has_pending(EntityKind::Cart, "c1"));

    // rolling the newer one back lands on the confirmed value
    opt.rollback(&second, "failed");
    assert_eq!(cache.get("cart:c1"), Some(json!({"id": "c1", "qty": 2, "total": 20})));
  }
}
