//! In-process remote used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::entity::EntityKind;
use crate::error::{Error, Result};
use crate::remote::{BatchItem, RemoteSource};

type Push = (EntityKind, String, Value);

/// Scriptable server: holds entity state, counts calls, fails on demand.
pub struct MockRemote {
  state: Mutex<HashMap<(EntityKind, String), Value>>,
  scripted: Mutex<VecDeque<Error>>,
  outage: Mutex<Option<Error>>,
  delay: Mutex<Option<Duration>>,
  push: broadcast::Sender<Push>,
  next_id: AtomicU64,
  pub fetches: AtomicU32,
  pub creates: AtomicU32,
  pub updates: AtomicU32,
  pub deletes: AtomicU32,
  pub batches: AtomicU32,
}

impl Default for MockRemote {
  fn default() -> Self {
    Self::new()
  }
}

impl MockRemote {
  pub fn new() -> Self {
    let (push, _) = broadcast::channel(64);
    Self {
      state: Mutex::new(HashMap::new()),
      scripted: Mutex::new(VecDeque::new()),
      outage: Mutex::new(None),
      delay: Mutex::new(None),
      push,
      next_id: AtomicU64::new(1),
      fetches: AtomicU32::new(0),
      creates: AtomicU32::new(0),
      updates: AtomicU32::new(0),
      deletes: AtomicU32::new(0),
      batches: AtomicU32::new(0),
    }
  }

  pub fn insert(&self, kind: EntityKind, id: &str, value: Value) {
    self.state.lock().insert((kind, id.to_string()), value);
  }

  pub fn get(&self, kind: EntityKind, id: &str) -> Option<Value> {
    self.state.lock().get(&(kind, id.to_string())).cloned()
  }

  /// The next call fails with `error`. Stacks.
  pub fn fail_next(&self, error: Error) {
    self.scripted.lock().push_back(error);
  }

  /// Every call fails with `error` until cleared with `None`.
  pub fn set_outage(&self, error: Option<Error>) {
    *self.outage.lock() = error;
  }

  pub fn set_delay(&self, delay: Option<Duration>) {
    *self.delay.lock() = delay;
  }

  pub fn push(&self, kind: EntityKind, id: &str, value: Value) {
    self.push.send((kind, id.to_string(), value)).ok();
  }

  pub fn subscriber_count(&self) -> usize {
    self.push.receiver_count()
  }

  async fn enter(&self) -> Result<()> {
    let delay = *self.delay.lock();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    if let Some(e) = self.scripted.lock().pop_front() {
      return Err(e);
    }
    match self.outage.lock().clone() {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  fn apply_create(&self, kind: EntityKind, data: &Value) -> Value {
    let mut created = data.clone();
    let id = match created.get("id").and_then(Value::as_str) {
      Some(id) => id.to_string(),
      None => {
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Value::Object(obj) = &mut created {
          obj.insert("id".into(), Value::String(id.clone()));
        }
        id
      }
    };
    self.state.lock().insert((kind, id), created.clone());
    created
  }

  fn apply_update(&self, kind: EntityKind, id: &str, partial: &Value) -> Value {
    let mut state = self.state.lock();
    let entry = state
      .entry((kind, id.to_string()))
      .or_insert_with(|| serde_json::json!({ "id": id }));
    match (entry.as_object_mut(), partial.as_object()) {
      (Some(current), Some(changes)) => {
        for (k, v) in changes {
          current.insert(k.clone(), v.clone());
        }
      }
      _ => *entry = partial.clone(),
    }
    entry.clone()
  }
}

#[async_trait]
impl RemoteSource for MockRemote {
  async fn fetch_entity(&self, kind: EntityKind, id: &str) -> Result<Option<Value>> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    self.enter().await?;
    Ok(self.get(kind, id))
  }

  async fn create_entity(&self, kind: EntityKind, data: &Value) -> Result<Value> {
    self.creates.fetch_add(1, Ordering::SeqCst);
    self.enter().await?;
    Ok(self.apply_create(kind, data))
  }

  async fn update_entity(&self, kind: EntityKind, id: &str, partial: &Value) -> Result<Value> {
    self.updates.fetch_add(1, Ordering::SeqCst);
    self.enter().await?;
    Ok(self.apply_update(kind, id, partial))
  }

  async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<()> {
    self.deletes.fetch_add(1, Ordering::SeqCst);
    self.enter().await?;
    self.state.lock().remove(&(kind, id.to_string()));
    Ok(())
  }

  async fn batch(&self, items: &[BatchItem]) -> Result<Vec<Value>> {
    self.batches.fetch_add(1, Ordering::SeqCst);
    self.enter().await?;
    Ok(
      items
        .iter()
        .map(|item| match item {
          BatchItem::Create { entity, data } => self.apply_create(*entity, data),
          BatchItem::Update { entity, id, data } => self.apply_update(*entity, id, data),
          BatchItem::Delete { entity, id } => {
            self.state.lock().remove(&(*entity, id.clone()));
            Value::Null
          }
        })
        .collect(),
    )
  }

  fn subscribe(&self, kind: EntityKind, id: &str) -> BoxStream<'static, Value> {
    let rx = self.push.subscribe();
    let id = id.to_string();
    Box::pin(stream::unfold(rx, move |mut rx| {
      let id = id.clone();
      async move {
        loop {
          match rx.recv().await {
            Ok((k, i, value)) if k == kind && i == id => return Some((value, rx)),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
          }
        }
      }
    }))
  }
}
