//! Cache layer that orchestrates caching logic with network fetching.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::store::{CacheStore, Lookup};
use super::traits::{CacheRead, ReadOrigin, SetOptions};
use crate::backoff::Backoff;
use crate::entity::{CacheConfig, CacheStrategy};
use crate::error::{Error, Result};

/// Attempts made by a stale-while-revalidate background refresh.
const REVALIDATE_ATTEMPTS: u32 = 3;

/// Applies the per-entity read strategy on top of a [`CacheStore`].
///
/// This layer sits between the data layer and the network loader,
/// providing transparent caching with offline fallback.
#[derive(Debug, Clone)]
pub struct CacheLayer {
  store: CacheStore,
  revalidate_backoff: Backoff,
}

impl CacheLayer {
  pub fn new(store: CacheStore) -> Self {
    Self {
      store,
      revalidate_backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(10)),
    }
  }

  pub fn with_revalidate_backoff(mut self, backoff: Backoff) -> Self {
    self.revalidate_backoff = backoff;
    self
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  /// Read `key` according to `config.strategy`, invoking `loader` when the
  /// cache cannot answer. Every successful load backfills the cache.
  ///
  /// The loader may be called more than once (background revalidation
  /// retries), hence `Fn`.
  pub async fn fetch<F, Fut>(&self, key: &str, config: &CacheConfig, loader: F) -> Result<CacheRead>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    match config.strategy {
      CacheStrategy::CacheFirst => self.cache_first(key, config, loader).await,
      CacheStrategy::NetworkFirst => self.network_first(key, config, loader).await,
      CacheStrategy::StaleWhileRevalidate => {
        self.stale_while_revalidate(key, config, loader).await
      }
      CacheStrategy::NetworkOnly => self.load(key, config, loader).await,
      CacheStrategy::CacheOnly => match self.store.lookup(key) {
        Lookup::Fresh(entry) => Ok(CacheRead::cached(entry, ReadOrigin::Fresh)),
        Lookup::Stale(entry) => Ok(CacheRead::cached(entry, ReadOrigin::Stale)),
        Lookup::Missing => Err(Error::NoCachedData(key.to_string())),
      },
    }
  }

  async fn load<F, Fut>(&self, key: &str, config: &CacheConfig, loader: F) -> Result<CacheRead>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Value>>,
  {
    let value = loader().await?;
    self.backfill(key, &value, config);
    Ok(CacheRead::loaded(value))
  }

  /// 1. Fresh cache is returned immediately
  /// 2. Otherwise fetch and store
  /// 3. If the fetch fails, serve the stale entry if there is one
  async fn cache_first<F, Fut>(&self, key: &str, config: &CacheConfig, loader: F) -> Result<CacheRead>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Value>>,
  {
    let stale = match self.store.lookup(key) {
      Lookup::Fresh(entry) => return Ok(CacheRead::cached(entry, ReadOrigin::Fresh)),
      Lookup::Stale(entry) => Some(entry),
      Lookup::Missing => None,
    };

    match self.load(key, config, loader).await {
      Err(e) if falls_back(&e) => match stale {
        Some(entry) => {
          debug!(key, error = %e, "Fetch failed, serving stale cache");
          Ok(CacheRead::cached(entry, ReadOrigin::Fallback))
        }
        None => Err(e),
      },
      result => result,
    }
  }

  async fn network_first<F, Fut>(&self, key: &str, config: &CacheConfig, loader: F) -> Result<CacheRead>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Value>>,
  {
    match self.load(key, config, loader).await {
      Err(e) if falls_back(&e) => match self.store.lookup(key) {
        Lookup::Fresh(entry) | Lookup::Stale(entry) => {
          debug!(key, error = %e, "Network failed, falling back to cache");
          Ok(CacheRead::cached(entry, ReadOrigin::Fallback))
        }
        Lookup::Missing => Err(e),
      },
      result => result,
    }
  }

  async fn stale_while_revalidate<F, Fut>(
    &self,
    key: &str,
    config: &CacheConfig,
    loader: F,
  ) -> Result<CacheRead>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    match self.store.lookup(key) {
      Lookup::Fresh(entry) => Ok(CacheRead::cached(entry, ReadOrigin::Fresh)),
      Lookup::Stale(entry) => {
        self.spawn_revalidate(key, config, loader);
        Ok(CacheRead::cached(entry, ReadOrigin::Stale))
      }
      Lookup::Missing => self.load(key, config, loader).await,
    }
  }

  /// Refresh `key` in the background with bounded retries. At most one
  /// refresh per key runs at a time.
  fn spawn_revalidate<F, Fut>(&self, key: &str, config: &CacheConfig, loader: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let Some(claim) = self.store.begin_revalidate(key) else {
      return;
    };

    let layer = self.clone();
    let key = key.to_string();
    let config = config.clone();
    tokio::spawn(async move {
      let _claim = claim;
      for attempt in 1..=REVALIDATE_ATTEMPTS {
        match loader().await {
          Ok(data) => {
            layer.backfill(&key, &data, &config);
            debug!(key, attempt, "Revalidated stale entry");
            break;
          }
          Err(e) if e.is_transient() && attempt < REVALIDATE_ATTEMPTS => {
            tokio::time::sleep(layer.revalidate_backoff.delay(attempt)).await;
          }
          Err(e) => {
            warn!(key, attempt, error = %e, "Background revalidation failed");
            break;
          }
        }
      }
    });
  }

  fn backfill(&self, key: &str, data: &Value, config: &CacheConfig) {
    // Kinds with a zero max-age (payments) are never stored.
    if config.max_age.is_zero() {
      return;
    }
    self.store.set(key, data.clone(), SetOptions::from(config));
  }
}

/// A failed load is covered by a resident copy unless the request itself
/// was rejected or called off.
fn falls_back(error: &Error) -> bool {
  !matches!(error, Error::Validation(_) | Error::Cancelled(_))
}
