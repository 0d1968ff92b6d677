//! Composition root: builds every component from [`Config`] and owns the
//! background tasks.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::cache::{CacheLayer, CacheStats, CacheStore};
use crate::config::Config;
use crate::connectivity::{Connectivity, NetworkStatus};
use crate::datalayer::{Components, DataLayer};
use crate::entity::EntityPolicies;
use crate::offline::OfflineSync;
use crate::optimistic::OptimisticCoordinator;
use crate::pipeline::{BreakerStage, Pipeline, RetryStage};
use crate::remote::{HttpRemote, RemoteSource};
use crate::resource::{ResourceManager, ResourceMetrics};
use crate::storage::{LocalStorage, SqliteStorage};

/// Point-in-time view of every component, for `shopsync status`.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
  pub network: NetworkStatus,
  pub breaker: BreakerSnapshot,
  pub cache_entries: usize,
  pub cache: CacheStats,
  pub resources: ResourceMetrics,
  pub queued: usize,
  pub failures: usize,
  pub optimistic: usize,
}

/// Main application state
pub struct App {
  config: Config,
  data: DataLayer,
  breaker: Arc<CircuitBreaker>,
  storage: Arc<dyn LocalStorage>,
  tasks: Vec<JoinHandle<()>>,
}

impl App {
  /// Build the app against the configured REST remote and SQLite store.
  pub fn new(config: Config) -> Result<Self> {
    let remote = HttpRemote::new(
      &config.remote.base_url,
      config.remote.api_key(),
      config.remote.timeout(),
    )
    .map_err(|e| eyre!("Invalid remote {}: {}", config.remote.base_url, e))?;

    let storage = match &config.storage.path {
      Some(path) => SqliteStorage::open(path),
      None => SqliteStorage::open_default(),
    }
    .map_err(|e| eyre!("Failed to open local storage: {}", e))?;

    Ok(Self::with_parts(config, Arc::new(remote), Arc::new(storage)))
  }

  /// Build the app on explicit remote and storage implementations.
  pub fn with_parts(
    config: Config,
    remote: Arc<dyn RemoteSource>,
    storage: Arc<dyn LocalStorage>,
  ) -> Self {
    let policies = EntityPolicies::new(&config.entities);
    let connectivity = Connectivity::default();
    let store = CacheStore::new(config.cache.max_entries);
    let breaker = Arc::new(CircuitBreaker::new("remote", config.breaker));

    let resources = ResourceManager::with_breaker(
      config.resources.clone(),
      connectivity.clone(),
      breaker.clone(),
    );
    let pipeline = Pipeline::new(
      RetryStage::new(config.resources.default_max_retries, config.resources.backoff),
      BreakerStage::new(breaker.clone()),
    );
    let offline = OfflineSync::new(
      remote.clone(),
      storage.clone(),
      connectivity.clone(),
      policies.clone(),
      config.sync.clone(),
    );
    let optimistic = OptimisticCoordinator::new(store.clone(), policies.clone());

    let data = DataLayer::new(Components {
      cache: CacheLayer::new(store).with_revalidate_backoff(config.resources.backoff),
      resources,
      pipeline,
      offline,
      optimistic,
      remote,
      policies,
      connectivity,
    });

    Self {
      config,
      data,
      breaker,
      storage,
      tasks: Vec::new(),
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn data(&self) -> &DataLayer {
    &self.data
  }

  pub fn breaker(&self) -> &CircuitBreaker {
    &self.breaker
  }

  /// Spawn the offline sync loop, the sync listener and the connectivity
  /// watcher, and restore cache statistics from the last run.
  pub fn start(&mut self) {
    if !self.tasks.is_empty() {
      return;
    }
    if let Err(e) = self.data.cache().load_stats(self.storage.as_ref()) {
      warn!(error = %e, "Failed to restore cache statistics");
    }
    self.tasks.push(self.data.spawn_sync_listener());
    self.tasks.push(self.data.resources().spawn_connectivity_watcher());
    self.tasks.push(self.data.offline().start());
    info!(queued = self.data.offline().len(), "Data layer started");
  }

  /// Stop background tasks and persist cache statistics.
  pub fn shutdown(&mut self) {
    for task in self.tasks.drain(..) {
      task.abort();
    }
    if let Err(e) = self.data.cache().persist_stats(self.storage.as_ref()) {
      warn!(error = %e, "Failed to persist cache statistics");
    }
  }

  pub fn status(&self) -> Status {
    let failures = match self.data.offline().failures() {
      Ok(failures) => failures.len(),
      Err(e) => {
        warn!(error = %e, "Failed to read failure log");
        0
      }
    };
    Status {
      network: self.data.connectivity().status(),
      breaker: self.breaker.snapshot(),
      cache_entries: self.data.cache().len(),
      cache: self.data.cache().stats(),
      resources: self.data.resources().metrics(),
      queued: self.data.offline().len(),
      failures,
      optimistic: self.data.optimistic().pending().len(),
    }
  }
}

impl Drop for App {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entity::EntityKind;
  use crate::storage::MemoryStorage;
  use crate::testing::MockRemote;
  use serde_json::json;

  fn app(remote: Arc<MockRemote>, storage: Arc<MemoryStorage>) -> App {
    App::with_parts(Config::default(), remote, storage)
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_write_syncs_when_back_online() {
    let remote = Arc::new(MockRemote::new());
    let mut app = app(remote.clone(), Arc::new(MemoryStorage::new()));
    app.start();
    app.data().connectivity().set_online(false);

    let response = app
      .data()
      .create(EntityKind::Wishlist, json!({"id": "w1", "sku": "A"}))
      .await
      .unwrap();
    assert_eq!(response.source, crate::datalayer::ResponseSource::Pending);
    assert_eq!(app.status().queued, 1);

    app.data().connectivity().set_online(true);
    for _ in 0..20 {
      if app.data().offline().is_empty() {
        break;
      }
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(app.data().offline().is_empty());
    assert_eq!(remote.get(EntityKind::Wishlist, "w1").unwrap()["sku"], "A");
    app.shutdown();
  }

  #[tokio::test]
  async fn test_shutdown_persists_cache_stats() {
    let storage = Arc::new(MemoryStorage::new());
    let mut app = app(Arc::new(MockRemote::new()), storage.clone());
    app.start();
    app.data().cache().get("missing");
    app.shutdown();

    let raw = storage.get_item(crate::cache::CACHE_METRICS_KEY).unwrap().unwrap();
    let stats: CacheStats = serde_json::from_str(&raw).unwrap();
    assert_eq!(stats.misses, 1);
  }
}
