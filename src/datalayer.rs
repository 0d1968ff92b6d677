//! Data layer facade: reads through the cache strategies, writes through the
//! mutation pipeline with optimistic updates and offline hand-off, and
//! per-entity push subscriptions.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheStore, ReadOrigin, SetOptions};
use crate::connectivity::Connectivity;
use crate::entity::{CacheConfig, CacheStrategy, EntityKind, EntityPolicies, Priority};
use crate::error::{Error, Result};
use crate::keys::{entity_key, QueryKey};
use crate::offline::{OfflineSync, SyncEvent};
use crate::optimistic::OptimisticCoordinator;
use crate::pipeline::{DedupStage, Pipeline};
use crate::remote::{BatchItem, RemoteSource};
use crate::resource::{fetcher, Fetcher, ResourceManager};

/// Capacity of each per-entity subscription channel.
const TOPIC_CAPACITY: usize = 64;

/// Where the data of a [`DataResponse`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
  /// Fresh cache entry.
  Cache,
  /// Cache entry past its TTL, served because the strategy or a failed
  /// refresh allowed it.
  Stale,
  Network,
  /// The cache holds a tentative value that the server has not confirmed.
  Optimistic,
  /// The mutation was queued for offline replay.
  Pending,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataResponse<T> {
  pub data: T,
  pub source: ResponseSource,
  pub timestamp: DateTime<Utc>,
}

impl<T> DataResponse<T> {
  pub fn new(data: T, source: ResponseSource) -> Self {
    Self {
      data,
      source,
      timestamp: Utc::now(),
    }
  }
}

/// Per-call overrides for a query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
  pub strategy: Option<CacheStrategy>,
  pub priority: Option<Priority>,
  /// Go to the network even when the cache is fresh. The cache is still
  /// used as a fallback.
  pub force_refresh: bool,
  pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MutationOptions {
  pub optimistic: bool,
  pub rollback_on_error: bool,
  /// Hand transient failures to offline sync. `None` follows the entity's
  /// `sync_when_online` policy.
  pub offline_sync: Option<bool>,
  /// Concurrent mutations sharing a key are sent once.
  pub dedup_key: Option<String>,
}

impl Default for MutationOptions {
  fn default() -> Self {
    Self {
      optimistic: true,
      rollback_on_error: true,
      offline_sync: None,
      dedup_key: None,
    }
  }
}

/// A write against one entity kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  Create(Value),
  Update { id: String, data: Value },
  Delete { id: String },
  Batch(Vec<BatchItem>),
}

impl Mutation {
  fn validate(&self, kind: EntityKind) -> Result<()> {
    match self {
      Mutation::Create(data) if !data.is_object() => Err(Error::Validation(format!(
        "create of {} needs an object",
        kind
      ))),
      Mutation::Update { id, data } if id.is_empty() || !data.is_object() => Err(
        Error::Validation(format!("update of {} needs an id and an object", kind)),
      ),
      Mutation::Delete { id } if id.is_empty() => {
        Err(Error::Validation(format!("delete of {} needs an id", kind)))
      }
      Mutation::Batch(items) if items.is_empty() => {
        Err(Error::Validation("empty batch".into()))
      }
      _ => Ok(()),
    }
  }

  /// The entity id this mutation targets, when known before the server
  /// answers.
  fn entity_id(&self) -> Option<&str> {
    match self {
      Mutation::Create(data) => data.get("id").and_then(Value::as_str),
      Mutation::Update { id, .. } | Mutation::Delete { id } => Some(id),
      Mutation::Batch(_) => None,
    }
  }

  /// Value shown to readers before the server confirms. `Some(None)` is a
  /// tentative delete.
  fn tentative(&self) -> Option<Option<Value>> {
    match self {
      Mutation::Create(data) | Mutation::Update { data, .. } => Some(Some(data.clone())),
      Mutation::Delete { .. } => Some(None),
      Mutation::Batch(_) => None,
    }
  }

  async fn send(&self, kind: EntityKind, remote: &dyn RemoteSource) -> Result<Value> {
    match self {
      Mutation::Create(data) => remote.create_entity(kind, data).await,
      Mutation::Update { id, data } => remote.update_entity(kind, id, data).await,
      Mutation::Delete { id } => remote.delete_entity(kind, id).await.map(|_| Value::Null),
      Mutation::Batch(items) => remote.batch(items).await.map(Value::Array),
    }
  }

  fn payload(&self) -> Value {
    match self {
      Mutation::Create(data) | Mutation::Update { data, .. } => data.clone(),
      Mutation::Delete { .. } => Value::Null,
      Mutation::Batch(items) => serde_json::to_value(items).unwrap_or(Value::Null),
    }
  }
}

/// Everything the facade is assembled from. Built by the composition root.
pub struct Components {
  pub cache: CacheLayer,
  pub resources: ResourceManager,
  pub pipeline: Pipeline,
  pub offline: OfflineSync,
  pub optimistic: OptimisticCoordinator,
  pub remote: Arc<dyn RemoteSource>,
  pub policies: EntityPolicies,
  pub connectivity: Connectivity,
}

struct Topic {
  tx: broadcast::Sender<Value>,
  subscribers: usize,
  forwarder: Option<JoinHandle<()>>,
}

type Topics = Arc<Mutex<HashMap<String, Topic>>>;

/// Push updates for one entity. Unsubscribes on drop; the shared upstream
/// subscription ends with the last subscriber.
pub struct Subscription {
  key: String,
  rx: broadcast::Receiver<Value>,
  topics: Topics,
}

impl Subscription {
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Next update, or `None` once the topic is gone.
  pub async fn recv(&mut self) -> Option<Value> {
    loop {
      match self.rx.recv().await {
        Ok(value) => return Some(value),
        Err(RecvError::Lagged(skipped)) => {
          debug!(key = %self.key, skipped, "Subscriber lagged");
        }
        Err(RecvError::Closed) => return None,
      }
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let mut topics = self.topics.lock();
    let Some(topic) = topics.get_mut(&self.key) else {
      return;
    };
    topic.subscribers = topic.subscribers.saturating_sub(1);
    if topic.subscribers == 0 {
      if let Some(forwarder) = topics.remove(&self.key).and_then(|t| t.forwarder) {
        forwarder.abort();
      }
      debug!(key = %self.key, "Closed subscription topic");
    }
  }
}

struct Inner {
  cache: CacheLayer,
  resources: ResourceManager,
  pipeline: Pipeline,
  offline: OfflineSync,
  optimistic: OptimisticCoordinator,
  remote: Arc<dyn RemoteSource>,
  policies: EntityPolicies,
  connectivity: Connectivity,
  queries: DedupStage<DataResponse<Value>>,
  topics: Topics,
  /// Offline operations started by `mutate`, by operation id.
  handoffs: Mutex<HashMap<String, (EntityKind, Option<String>)>>,
}

/// Single entry point for storefront reads, writes and subscriptions.
/// Cheap to clone.
#[derive(Clone)]
pub struct DataLayer {
  inner: Arc<Inner>,
}

impl std::fmt::Debug for DataLayer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DataLayer")
      .field("cached", &self.inner.cache.store().len())
      .field("queued", &self.inner.offline.len())
      .field("topics", &self.inner.topics.lock().len())
      .finish()
  }
}

impl DataLayer {
  pub fn new(components: Components) -> Self {
    let Components {
      cache,
      resources,
      pipeline,
      offline,
      optimistic,
      remote,
      policies,
      connectivity,
    } = components;
    Self {
      inner: Arc::new(Inner {
        cache,
        resources,
        pipeline,
        offline,
        optimistic,
        remote,
        policies,
        connectivity,
        queries: DedupStage::new(),
        topics: Arc::new(Mutex::new(HashMap::new())),
        handoffs: Mutex::new(HashMap::new()),
      }),
    }
  }

  pub fn cache(&self) -> &CacheStore {
    self.inner.cache.store()
  }

  pub fn resources(&self) -> &ResourceManager {
    &self.inner.resources
  }

  pub fn offline(&self) -> &OfflineSync {
    &self.inner.offline
  }

  pub fn optimistic(&self) -> &OptimisticCoordinator {
    &self.inner.optimistic
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.inner.connectivity
  }

  pub fn policies(&self) -> &EntityPolicies {
    &self.inner.policies
  }

  pub fn remote(&self) -> &Arc<dyn RemoteSource> {
    &self.inner.remote
  }

  /// Read `key` with `loader` as the network source, following the entity
  /// kind's cache strategy. Concurrent identical queries share one load.
  pub async fn query<T, F, Fut>(
    &self,
    key: &QueryKey,
    options: QueryOptions,
    loader: F,
  ) -> Result<DataResponse<T>>
  where
    T: DeserializeOwned,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let response = self.query_value(key, options, fetcher(loader)).await?;
    Ok(DataResponse {
      data: serde_json::from_value(response.data)?,
      source: response.source,
      timestamp: response.timestamp,
    })
  }

  /// One entity from the remote source. A missing entity is `NotFound`.
  pub async fn get(
    &self,
    kind: EntityKind,
    id: &str,
    options: QueryOptions,
  ) -> Result<DataResponse<Value>> {
    let key = QueryKey::entity(kind, id);
    let remote = self.inner.remote.clone();
    let id = id.to_string();
    let what = key.description();
    let load = fetcher(move || {
      let remote = remote.clone();
      let id = id.clone();
      let what = what.clone();
      async move {
        remote
          .fetch_entity(kind, &id)
          .await?
          .ok_or(Error::NotFound(what))
      }
    });
    self.query_value(&key, options, load).await
  }

  async fn query_value(
    &self,
    key: &QueryKey,
    options: QueryOptions,
    load: Fetcher,
  ) -> Result<DataResponse<Value>> {
    let cache_key = key.cache_key();
    let this = self.clone();
    let key = key.clone();
    self
      .inner
      .queries
      .run(&cache_key, move || async move {
        this.run_query(&key, options, load).await
      })
      .await
  }

  async fn run_query(
    &self,
    key: &QueryKey,
    options: QueryOptions,
    load: Fetcher,
  ) -> Result<DataResponse<Value>> {
    let kind = key.kind();
    let cache_key = key.cache_key();
    let config = self.query_config(key, &options);

    let mut template = self
      .inner
      .resources
      .request(key.description())
      .with_priority(config.priority)
      .with_dedup_key(cache_key.clone());
    for tag in key.tags() {
      template = template.with_tag(tag);
    }
    let resources = self.inner.resources.clone();
    let loader = move || {
      let request = template
        .clone()
        .with_id(uuid::Uuid::new_v4().to_string());
      resources.add_request(request, load.clone())
    };

    let result = self.inner.cache.fetch(&cache_key, &config, loader).await?;
    let mut source = match result.origin {
      ReadOrigin::Loaded => ResponseSource::Network,
      ReadOrigin::Fresh => ResponseSource::Cache,
      ReadOrigin::Stale | ReadOrigin::Fallback => ResponseSource::Stale,
    };
    if let QueryKey::Entity { id, .. } = key {
      if source != ResponseSource::Network && self.inner.optimistic.has_pending(kind, id) {
        source = ResponseSource::Optimistic;
      }
    }
    debug!(key = %cache_key, ?source, "Query answered");
    Ok(DataResponse::new(result.value, source))
  }

  fn query_config(&self, key: &QueryKey, options: &QueryOptions) -> CacheConfig {
    let mut config = self.inner.policies.get(key.kind());
    if let Some(strategy) = options.strategy {
      config.strategy = strategy;
    }
    if options.force_refresh && config.strategy != CacheStrategy::CacheOnly {
      config.strategy = CacheStrategy::NetworkFirst;
    }
    if let Some(priority) = options.priority {
      config.priority = priority;
    }
    config.tags.extend(key.tags());
    config.tags.extend(options.tags.iter().cloned());
    config
  }

  /// Send `mutation` for `kind`.
  ///
  /// With `optimistic`, readers see the tentative value right away. A
  /// transient failure with offline sync enabled queues the mutation and
  /// answers `Pending` with the tentative value; any other failure rolls
  /// back (unless disabled) and is returned. Payments are never optimistic
  /// and never queued.
  pub async fn mutate(
    &self,
    kind: EntityKind,
    mutation: Mutation,
    options: MutationOptions,
  ) -> Result<DataResponse<Value>> {
    mutation.validate(kind)?;
    let config = self.inner.policies.get(kind);
    let replayable = kind != EntityKind::Payments;
    let offline_sync = replayable && options.offline_sync.unwrap_or(config.sync_when_online);

    let update = match (options.optimistic && replayable, mutation.entity_id(), mutation.tentative()) {
      (true, Some(id), Some(tentative)) => Some(self.inner.optimistic.begin(kind, id, tentative)),
      _ => None,
    };

    let outcome = if offline_sync && !self.inner.connectivity.is_online() {
      Err(Error::Network("offline".into()))
    } else {
      let remote = self.inner.remote.clone();
      let op = mutation.clone();
      self
        .inner
        .pipeline
        .call(options.dedup_key.as_deref(), move || {
          let remote = remote.clone();
          let op = op.clone();
          async move { op.send(kind, remote.as_ref()).await }
        })
        .await
    };

    match outcome {
      Ok(server) => {
        match &update {
          Some(update) => {
            self.inner.optimistic.confirm(update, server.clone());
          }
          None => self.write_back(kind, &mutation, &server, &config),
        }
        self.after_write(kind, &mutation, &server);
        Ok(DataResponse::new(server, ResponseSource::Network))
      }
      Err(e) if offline_sync && e.is_transient() => {
        let pending = match &mutation {
          Mutation::Create(data) => self.inner.offline.create(kind, data.clone()),
          Mutation::Update { id, data } => self.inner.offline.update(kind, id, data.clone()),
          Mutation::Delete { id } => self.inner.offline.delete(kind, id),
          Mutation::Batch(items) => self.inner.offline.batch(kind, items),
        };
        let pending = match pending {
          Ok(pending) => pending,
          Err(queue_error) => {
            warn!(%kind, error = %queue_error, "Could not queue mutation for offline sync");
            self.abandon(update.as_deref(), options.rollback_on_error, &e);
            return Err(e);
          }
        };
        self.inner.handoffs.lock().insert(
          pending.id().to_string(),
          (kind, mutation.entity_id().map(str::to_string)),
        );
        if let Some(update) = &update {
          self.inner.optimistic.settle(update);
        }
        info!(%kind, operation = pending.id(), error = %e, "Mutation queued for offline sync");

        let shown = mutation
          .entity_id()
          .and_then(|id| self.cache().get(&entity_key(kind, id)))
          .unwrap_or_else(|| mutation.payload());
        Ok(DataResponse::new(shown, ResponseSource::Pending))
      }
      Err(e) => {
        self.abandon(update.as_deref(), options.rollback_on_error, &e);
        Err(e)
      }
    }
  }

  fn abandon(&self, update: Option<&str>, rollback: bool, error: &Error) {
    let Some(update) = update else {
      return;
    };
    if rollback {
      self.inner.optimistic.rollback(update, &error.to_string());
    } else {
      self.inner.optimistic.settle(update);
    }
  }

  pub async fn create(&self, kind: EntityKind, data: Value) -> Result<DataResponse<Value>> {
    self
      .mutate(kind, Mutation::Create(data), MutationOptions::default())
      .await
  }

  pub async fn update(
    &self,
    kind: EntityKind,
    id: &str,
    data: Value,
  ) -> Result<DataResponse<Value>> {
    let mutation = Mutation::Update {
      id: id.to_string(),
      data,
    };
    self.mutate(kind, mutation, MutationOptions::default()).await
  }

  pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<DataResponse<Value>> {
    let mutation = Mutation::Delete { id: id.to_string() };
    self.mutate(kind, mutation, MutationOptions::default()).await
  }

  pub async fn batch(
    &self,
    kind: EntityKind,
    items: Vec<BatchItem>,
  ) -> Result<DataResponse<Value>> {
    self
      .mutate(kind, Mutation::Batch(items), MutationOptions::default())
      .await
  }

  /// Cache the server's answer to a non-optimistic mutation.
  fn write_back(&self, kind: EntityKind, mutation: &Mutation, server: &Value, config: &CacheConfig) {
    match mutation {
      Mutation::Delete { id } => {
        self.cache().delete(&entity_key(kind, id));
      }
      Mutation::Batch(items) => {
        let results = server.as_array().map(Vec::as_slice).unwrap_or_default();
        for (item, result) in items.iter().zip(results) {
          let item_config = self.inner.policies.get(item.entity());
          match item {
            BatchItem::Delete { entity, id } => {
              self.cache().delete(&entity_key(*entity, id));
            }
            _ => self.store_entity(item.entity(), item.entity_id(), result, &item_config),
          }
        }
      }
      _ => self.store_entity(kind, mutation.entity_id(), server, config),
    }
  }

  fn store_entity(&self, kind: EntityKind, id: Option<&str>, value: &Value, config: &CacheConfig) {
    if config.max_age.is_zero() {
      return;
    }
    let Some(id) = id.or_else(|| value.get("id").and_then(Value::as_str)) else {
      return;
    };
    let key = entity_key(kind, id);
    let options = SetOptions::from(config)
      .with_tag(kind.name())
      .with_tag(key.clone());
    self.cache().set(&key, value.clone(), options);
  }

  /// Drop cached listings of `kind` and tell subscribers about the change.
  fn after_write(&self, kind: EntityKind, mutation: &Mutation, server: &Value) {
    self.invalidate_collections(kind);
    match mutation {
      Mutation::Batch(items) => {
        let results = server.as_array().map(Vec::as_slice).unwrap_or_default();
        for (item, result) in items.iter().zip(results) {
          if item.entity() != kind {
            self.invalidate_collections(item.entity());
          }
          let id = item
            .entity_id()
            .or_else(|| result.get("id").and_then(Value::as_str));
          if let Some(id) = id {
            self.notify(item.entity(), id, result.clone());
          }
        }
      }
      _ => {
        let id = mutation
          .entity_id()
          .or_else(|| server.get("id").and_then(Value::as_str));
        if let Some(id) = id {
          self.notify(kind, id, server.clone());
        }
      }
    }
  }

  fn invalidate_collections(&self, kind: EntityKind) {
    self
      .cache()
      .invalidate_by_tags(&[format!("{}:collection", kind)]);
  }

  /// Drop every cached entry of `kind`.
  pub fn invalidate(&self, kind: EntityKind) -> usize {
    let removed = self.cache().invalidate_by_tags(&[kind.name()]);
    debug!(%kind, removed, "Invalidated entity kind");
    removed
  }

  pub fn invalidate_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
    self.cache().invalidate_by_tags(tags)
  }

  /// Listen for updates to one entity. Subscribers of the same entity share
  /// one upstream push subscription, which also keeps the cache current.
  pub fn subscribe(&self, kind: EntityKind, id: &str) -> Subscription {
    let key = entity_key(kind, id);
    let mut topics = self.inner.topics.lock();
    let topic = topics.entry(key.clone()).or_insert_with(|| {
      let (tx, _) = broadcast::channel(TOPIC_CAPACITY);
      let forwarder = self.spawn_forwarder(kind, id, tx.clone());
      debug!(key = %key, "Opened subscription topic");
      Topic {
        tx,
        subscribers: 0,
        forwarder,
      }
    });
    topic.subscribers += 1;
    Subscription {
      key,
      rx: topic.tx.subscribe(),
      topics: self.inner.topics.clone(),
    }
  }

  fn spawn_forwarder(
    &self,
    kind: EntityKind,
    id: &str,
    tx: broadcast::Sender<Value>,
  ) -> Option<JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let mut updates = self.inner.remote.subscribe(kind, id);
    let this = self.clone();
    let id = id.to_string();
    let config = self.inner.policies.get(kind);
    Some(handle.spawn(async move {
      while let Some(value) = updates.next().await {
        this.store_entity(kind, Some(&id), &value, &config);
        tx.send(value).ok();
      }
    }))
  }

  /// Deliver `value` to subscribers of the entity, if any.
  pub fn notify(&self, kind: EntityKind, id: &str, value: Value) {
    let topics = self.inner.topics.lock();
    if let Some(topic) = topics.get(&entity_key(kind, id)) {
      topic.tx.send(value).ok();
    }
  }

  /// Mirror offline replays into the cache: synced results are written
  /// back and announced, dropped operations lose their tentative value.
  pub fn spawn_sync_listener(&self) -> JoinHandle<()> {
    let mut events = self.inner.offline.subscribe();
    let this = self.clone();
    tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(event) => this.on_sync_event(event),
          Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, "Sync listener lagged");
          }
          Err(RecvError::Closed) => break,
        }
      }
    })
  }

  fn on_sync_event(&self, event: SyncEvent) {
    match event {
      SyncEvent::Synced {
        id,
        entity,
        entity_id,
        result,
      } => {
        self.inner.handoffs.lock().remove(&id);
        self.invalidate_collections(entity);
        let Some(entity_id) = entity_id else {
          return;
        };
        if result.is_null() {
          self.cache().delete(&entity_key(entity, &entity_id));
        } else if !result.is_array() {
          let config = self.inner.policies.get(entity);
          self.store_entity(entity, Some(&entity_id), &result, &config);
        }
        self.notify(entity, &entity_id, result);
      }
      SyncEvent::Failed { id, .. } | SyncEvent::Expired { id } => {
        let handoff = self.inner.handoffs.lock().remove(&id);
        if let Some((entity, Some(entity_id))) = handoff {
          debug!(operation = %id, %entity, entity_id = %entity_id, "Dropping unconfirmed value");
          self.cache().delete(&entity_key(entity, &entity_id));
        }
      }
      _ => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backoff::Backoff;
  use crate::breaker::{BreakerConfig, CircuitBreaker};
  use crate::offline::SyncConfig;
  use crate::pipeline::{BreakerStage, RetryStage};
  use crate::resource::ResourceConfig;
  use crate::storage::MemoryStorage;
  use crate::testing::MockRemote;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn backoff() -> Backoff {
    Backoff::new(Duration::from_millis(10), Duration::from_millis(100)).without_jitter()
  }

  fn layer(remote: Arc<MockRemote>, connectivity: Connectivity) -> DataLayer {
    let policies = EntityPolicies::default();
    let store = CacheStore::default();
    let breaker = Arc::new(CircuitBreaker::new("test", BreakerConfig::default()));
    let resources = ResourceManager::with_breaker(
      ResourceConfig {
        backoff: backoff(),
        ..ResourceConfig::default()
      },
      connectivity.clone(),
      breaker.clone(),
    );
    let pipeline = Pipeline::new(RetryStage::new(2, backoff()), BreakerStage::new(breaker));
    let offline = OfflineSync::new(
      remote.clone(),
      Arc::new(MemoryStorage::new()),
      connectivity.clone(),
      policies.clone(),
      SyncConfig::default(),
    );
    let optimistic = OptimisticCoordinator::new(store.clone(), policies.clone());
    DataLayer::new(Components {
      cache: CacheLayer::new(store),
      resources,
      pipeline,
      offline,
      optimistic,
      remote,
      policies,
      connectivity,
    })
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_queries_share_one_load() {
    let data = layer(Arc::new(MockRemote::new()), Connectivity::default());
    let calls = Arc::new(AtomicU32::new(0));
    let key = QueryKey::list(EntityKind::Products, [("category", "shoes")]);

    let loader = {
      let calls = calls.clone();
      move || {
        let calls = calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok(json!([{"id": "1"}, {"id": "2"}]))
        }
      }
    };

    let (a, b) = tokio::join!(
      data.query::<Value, _, _>(&key, QueryOptions::default(), loader.clone()),
      data.query::<Value, _, _>(&key, QueryOptions::default(), loader),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.data, b.data);
    assert_eq!(a.source, ResponseSource::Network);
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_caches_by_strategy() {
    let remote = Arc::new(MockRemote::new());
    remote.insert(EntityKind::Categories, "c1", json!({"id": "c1", "name": "Shoes"}));
    let data = layer(remote.clone(), Connectivity::default());

    let first = data
      .get(EntityKind::Categories, "c1", QueryOptions::default())
      .await
      .unwrap();
    assert_eq!(first.source, ResponseSource::Network);
    let second = data
      .get(EntityKind::Categories, "c1", QueryOptions::default())
      .await
      .unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.data["name"], "Shoes");
    assert_eq!(remote.fetches.load(Ordering::SeqCst), 1);

    let forced = data
      .get(
        EntityKind::Categories,
        "c1",
        QueryOptions {
          force_refresh: true,
          ..QueryOptions::default()
        },
      )
      .await
      .unwrap();
    assert_eq!(forced.source, ResponseSource::Network);
    assert_eq!(remote.fetches.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_missing_entity() {
    let data = layer(Arc::new(MockRemote::new()), Connectivity::default());
    let err = data
      .get(EntityKind::Orders, "nope", QueryOptions::default())
      .await
      .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_typed_query() {
    #[derive(serde::Deserialize)]
    struct Product {
      id: String,
      price: u32,
    }

    let data = layer(Arc::new(MockRemote::new()), Connectivity::default());
    let key = QueryKey::entity(EntityKind::Products, "p1");
    let response = data
      .query::<Product, _, _>(&key, QueryOptions::default(), || async {
        Ok(json!({"id": "p1", "price": 25}))
      })
      .await
      .unwrap();
    assert_eq!(response.data.id, "p1");
    assert_eq!(response.data.price, 25);
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_confirms_with_server_value() {
    let remote = Arc::new(MockRemote::new());
    remote.insert(EntityKind::Wishlist, "w1", json!({"id": "w1", "items": []}));
    let data = layer(remote.clone(), Connectivity::default());

    let response = data
      .update(EntityKind::Wishlist, "w1", json!({"items": ["sku-1"]}))
      .await
      .unwrap();
    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(response.data, json!({"id": "w1", "items": ["sku-1"]}));
    assert_eq!(data.cache().get("wishlist:w1"), Some(response.data));
    assert!(data.optimistic().pending().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_update_rolls_back() {
    let remote = Arc::new(MockRemote::new());
    let data = layer(remote.clone(), Connectivity::default());
    let before = json!({"id": "u1", "name": "Ada"});
    data.cache().set(
      "user-profile:u1",
      before.clone(),
      SetOptions::from(&EntityKind::UserProfile.default_config()),
    );
    let snapshot = data.cache().snapshot("user-profile:u1");

    remote.fail_next(Error::Validation("name too long".into()));
    let err = data
      .update(EntityKind::UserProfile, "u1", json!({"name": "x".repeat(300)}))
      .await
      .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(data.cache().snapshot("user-profile:u1"), snapshot);
    assert!(data.optimistic().pending().is_empty());
    assert!(data.offline().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_update_is_queued_and_replayed() {
    let remote = Arc::new(MockRemote::new());
    remote.insert(EntityKind::Cart, "c1", json!({"id": "c1", "qty": 1}));
    let connectivity = Connectivity::offline();
    let data = layer(remote.clone(), connectivity.clone());
    let listener = data.spawn_sync_listener();

    let response = data
      .update(EntityKind::Cart, "c1", json!({"qty": 3}))
      .await
      .unwrap();
    assert_eq!(response.source, ResponseSource::Pending);
    assert_eq!(response.data["qty"], 3);
    assert_eq!(remote.updates.load(Ordering::SeqCst), 0);
    assert_eq!(data.offline().len(), 1);
    assert!(data.optimistic().pending().is_empty());

    connectivity.set_online(true);
    let report = data.offline().sync_operations().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(remote.get(EntityKind::Cart, "c1").unwrap()["qty"], 3);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(data.cache().get("cart:c1").unwrap()["qty"], 3);
    listener.abort();
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failure_without_offline_sync_rolls_back() {
    let remote = Arc::new(MockRemote::new());
    remote.set_outage(Some(Error::Network("down".into())));
    let data = layer(remote.clone(), Connectivity::default());

    let err = data
      .update(EntityKind::Products, "p1", json!({"name": "Shoe"}))
      .await
      .unwrap_err();
    assert!(err.is_transient());
    assert!(data.cache().get("products:p1").is_none());
    assert!(data.offline().is_empty());
    assert_eq!(remote.updates.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_payments_are_never_queued() {
    let data = layer(Arc::new(MockRemote::new()), Connectivity::offline());
    let options = MutationOptions {
      offline_sync: Some(true),
      ..MutationOptions::default()
    };
    let result = data
      .mutate(
        EntityKind::Payments,
        Mutation::Create(json!({"order_id": "o1"})),
        options,
      )
      .await;
    // payments go out even while offline
    assert!(result.is_ok());
    assert!(data.offline().is_empty());
    assert!(data.cache().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_invalidates_collections() {
    let data = layer(Arc::new(MockRemote::new()), Connectivity::default());
    let key = QueryKey::list(EntityKind::Reviews, [("product", "p1")]);
    data
      .query::<Value, _, _>(&key, QueryOptions::default(), || async { Ok(json!([])) })
      .await
      .unwrap();
    assert!(data.cache().has(&key.cache_key()));

    let created = data
      .create(EntityKind::Reviews, json!({"product": "p1", "stars": 5}))
      .await
      .unwrap();
    assert_eq!(created.data["id"], "srv-1");
    assert!(!data.cache().has(&key.cache_key()));
    assert!(data.cache().has("reviews:srv-1"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscribers_share_one_upstream() {
    let remote = Arc::new(MockRemote::new());
    let data = layer(remote.clone(), Connectivity::default());

    let mut first = data.subscribe(EntityKind::Products, "p1");
    let mut second = data.subscribe(EntityKind::Products, "p1");
    assert_eq!(remote.subscriber_count(), 1);

    tokio::task::yield_now().await;
    remote.push(EntityKind::Products, "p1", json!({"id": "p1", "stock": 2}));
    assert_eq!(first.recv().await.unwrap()["stock"], 2);
    assert_eq!(second.recv().await.unwrap()["stock"], 2);
    assert_eq!(data.cache().get("products:p1").unwrap()["stock"], 2);

    data
      .update(EntityKind::Products, "p1", json!({"stock": 1}))
      .await
      .unwrap();
    assert_eq!(first.recv().await.unwrap()["stock"], 1);

    drop(first);
    assert_eq!(remote.subscriber_count(), 1);
    drop(second);
    for _ in 0..10 {
      if remote.subscriber_count() == 0 {
        break;
      }
      tokio::task::yield_now().await;
    }
    assert_eq!(remote.subscriber_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_kind() {
    let remote = Arc::new(MockRemote::new());
    remote.insert(EntityKind::Categories, "c1", json!({"id": "c1"}));
    let data = layer(remote, Connectivity::default());
    data
      .get(EntityKind::Categories, "c1", QueryOptions::default())
      .await
      .unwrap();
    assert_eq!(data.invalidate(EntityKind::Categories), 1);
    assert!(data.cache().is_empty());
  }
}
