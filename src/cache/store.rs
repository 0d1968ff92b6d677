//! Bounded, tag-aware in-memory cache store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::traits::{CacheEntry, CacheStats, SetOptions};
use crate::error::Result;
use crate::storage::LocalStorage;

/// Storage key for persisted cache statistics.
pub const CACHE_METRICS_KEY: &str = "cache_metrics";

const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Outcome of looking a key up without touching the network.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
  Fresh(CacheEntry),
  Stale(CacheEntry),
  Missing,
}

#[derive(Debug, Default)]
struct Inner {
  entries: HashMap<String, CacheEntry>,
  /// Last access tick per key, for LRU eviction.
  access: HashMap<String, u64>,
  tick: u64,
  stats: CacheStats,
  revalidating: HashSet<String>,
}

impl Inner {
  fn touch(&mut self, key: &str) {
    self.tick += 1;
    self.access.insert(key.to_string(), self.tick);
  }

  fn remove(&mut self, key: &str) -> Option<CacheEntry> {
    self.access.remove(key);
    self.entries.remove(key)
  }

  /// Evict one entry: anything past max-age first, then the lowest
  /// priority tier, least recently used within it.
  fn evict_one(&mut self, now: Instant) -> Option<String> {
    let victim = self
      .entries
      .values()
      .find(|e| !e.is_servable(now))
      .map(|e| e.key.clone())
      .or_else(|| {
        self
          .entries
          .values()
          .min_by_key(|e| (e.priority, self.access.get(&e.key).copied().unwrap_or(0)))
          .map(|e| e.key.clone())
      })?;
    self.remove(&victim);
    self.stats.evictions += 1;
    Some(victim)
  }
}

/// Claim on a background refresh of one key. Released on drop, including
/// when the refreshing task is aborted or panics.
#[derive(Debug)]
pub(crate) struct Revalidation {
  store: CacheStore,
  key: String,
}

impl Drop for Revalidation {
  fn drop(&mut self) {
    self.store.inner.lock().revalidating.remove(&self.key);
  }
}

/// Process-wide cache. Cheap to clone; clones share the same entries.
#[derive(Debug, Clone)]
pub struct CacheStore {
  inner: Arc<Mutex<Inner>>,
  max_entries: usize,
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_ENTRIES)
  }
}

impl CacheStore {
  pub fn new(max_entries: usize) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner::default())),
      max_entries: max_entries.max(1),
    }
  }

  /// Fresh value for `key`, if any. Entries past max-age are dropped here.
  pub fn get(&self, key: &str) -> Option<Value> {
    match self.lookup(key) {
      Lookup::Fresh(entry) => Some(entry.value),
      _ => None,
    }
  }

  /// Classify `key` as fresh, stale-but-servable or missing, updating hit
  /// statistics and lazily removing entries past max-age.
  pub fn lookup(&self, key: &str) -> Lookup {
    let now = Instant::now();
    let mut inner = self.inner.lock();

    let Some(entry) = inner.entries.get(key) else {
      inner.stats.misses += 1;
      return Lookup::Missing;
    };

    if entry.is_fresh(now) {
      let entry = entry.clone();
      inner.stats.hits += 1;
      inner.touch(key);
      Lookup::Fresh(entry)
    } else if entry.is_servable(now) {
      let entry = entry.clone();
      inner.stats.stale_hits += 1;
      inner.touch(key);
      Lookup::Stale(entry)
    } else {
      debug!(key, "Dropping entry past max age");
      inner.remove(key);
      inner.stats.misses += 1;
      Lookup::Missing
    }
  }

  /// Store `value` under `key`, replacing any previous entry and evicting
  /// when the store is full.
  pub fn set(&self, key: &str, value: Value, options: SetOptions) {
    let now = Instant::now();
    let mut inner = self.inner.lock();

    if !inner.entries.contains_key(key) {
      while inner.entries.len() >= self.max_entries {
        match inner.evict_one(now) {
          Some(victim) => debug!(key = %victim, "Evicted cache entry"),
          None => break,
        }
      }
    }

    let entry = CacheEntry {
      key: key.to_string(),
      value,
      inserted_at: now,
      ttl: options.ttl,
      max_age: options.max_age.max(options.ttl),
      priority: options.priority,
      tags: options.tags,
      compressed: options.compress,
    };
    inner.entries.insert(key.to_string(), entry);
    inner.touch(key);
    inner.stats.sets += 1;
  }

  /// Whether a fresh entry exists.
  pub fn has(&self, key: &str) -> bool {
    let now = Instant::now();
    self
      .inner
      .lock()
      .entries
      .get(key)
      .is_some_and(|e| e.is_fresh(now))
  }

  pub fn delete(&self, key: &str) -> bool {
    self.inner.lock().remove(key).is_some()
  }

  /// Remove every entry sharing at least one tag with `tags`, regardless of
  /// expiry. Returns the number removed.
  pub fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
    let wanted: BTreeSet<&str> = tags.iter().map(|t| t.as_ref()).collect();
    let mut inner = self.inner.lock();

    let victims: Vec<String> = inner
      .entries
      .values()
      .filter(|e| e.tags.iter().any(|t| wanted.contains(t.as_str())))
      .map(|e| e.key.clone())
      .collect();

    for key in &victims {
      inner.remove(key);
    }
    inner.stats.invalidations += victims.len() as u64;
    if !victims.is_empty() {
      debug!(count = victims.len(), ?wanted, "Invalidated cache entries by tag");
    }
    victims.len()
  }

  pub fn keys_by_tag(&self, tag: &str) -> Vec<String> {
    let mut keys: Vec<String> = self
      .inner
      .lock()
      .entries
      .values()
      .filter(|e| e.tags.contains(tag))
      .map(|e| e.key.clone())
      .collect();
    keys.sort();
    keys
  }

  /// Exact copy of the resident entry, expired or not.
  pub fn snapshot(&self, key: &str) -> Option<CacheEntry> {
    self.inner.lock().entries.get(key).cloned()
  }

  /// Put back a previously taken snapshot. `None` removes the key.
  pub fn restore(&self, key: &str, snapshot: Option<CacheEntry>) {
    let mut inner = self.inner.lock();
    match snapshot {
      Some(entry) => {
        inner.entries.insert(key.to_string(), entry);
        inner.touch(key);
      }
      None => {
        inner.remove(key);
      }
    }
  }

  pub fn clear(&self) {
    let mut inner = self.inner.lock();
    inner.entries.clear();
    inner.access.clear();
  }

  pub fn len(&self) -> usize {
    self.inner.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    self.inner.lock().stats
  }

  /// Mark `key` as being revalidated until the returned guard drops.
  /// `None` if a refresh is already running.
  pub(crate) fn begin_revalidate(&self, key: &str) -> Option<Revalidation> {
    if !self.inner.lock().revalidating.insert(key.to_string()) {
      return None;
    }
    Some(Revalidation {
      store: self.clone(),
      key: key.to_string(),
    })
  }

  pub fn persist_stats(&self, storage: &dyn LocalStorage) -> Result<()> {
    let stats = self.stats();
    storage.set_item(CACHE_METRICS_KEY, &serde_json::to_string(&stats)?)
  }

  /// Seed counters from a previous run.
  pub fn load_stats(&self, storage: &dyn LocalStorage) -> Result<()> {
    if let Some(raw) = storage.get_item(CACHE_METRICS_KEY)? {
      let stats: CacheStats = serde_json::from_str(&raw)?;
      self.inner.lock().stats = stats;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entity::Priority;
  use crate::storage::MemoryStorage;
  use serde_json::json;
  use std::time::Duration;

  fn opts(ttl_ms: u64, max_age_ms: u64) -> SetOptions {
    SetOptions {
      ttl: Duration::from_millis(ttl_ms),
      max_age: Duration::from_millis(max_age_ms),
      ..SetOptions::default()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_set_then_get_within_ttl() {
    let store = CacheStore::default();
    store.set("k", json!({"id": "42"}), opts(1000, 2000));
    assert_eq!(store.get("k"), Some(json!({"id": "42"})));
    assert!(store.has("k"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_entry_is_logically_absent_but_servable() {
    let store = CacheStore::default();
    store.set("k", json!(1), opts(100, 1000));

    tokio::time::advance(Duration::from_millis(200)).await;
    assert_eq!(store.get("k"), None);
    assert!(!store.has("k"));
    assert!(matches!(store.lookup("k"), Lookup::Stale(_)));

    tokio::time::advance(Duration::from_millis(1000)).await;
    assert_eq!(store.lookup("k"), Lookup::Missing);
    assert!(store.snapshot("k").is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_tag_invalidation_ignores_expiry() {
    let store = CacheStore::default();
    store.set("a", json!(1), opts(10, 10_000).with_tag("catalog"));
    store.set("b", json!(2), opts(10_000, 10_000).with_tag("catalog").with_tag("x"));
    store.set("c", json!(3), opts(10_000, 10_000).with_tag("user"));

    tokio::time::advance(Duration::from_millis(50)).await;
    assert_eq!(store.keys_by_tag("catalog"), vec!["a", "b"]);
    assert_eq!(store.invalidate_by_tags(&["catalog"]), 2);
    assert_eq!(store.len(), 1);
    assert_eq!(store.stats().invalidations, 2);
  }

  #[tokio::test]
  async fn test_eviction_prefers_low_priority_then_lru() {
    let store = CacheStore::new(3);
    store.set("high", json!(1), SetOptions::default().with_priority(Priority::High));
    store.set("low-old", json!(2), SetOptions::default().with_priority(Priority::Low));
    store.set("low-new", json!(3), SetOptions::default().with_priority(Priority::Low));

    store.set("critical", json!(4), SetOptions::default().with_priority(Priority::Critical));
    assert_eq!(store.len(), 3);
    assert!(store.snapshot("low-old").is_none());
    assert!(store.snapshot("low-new").is_some());
    assert_eq!(store.stats().evictions, 1);
  }

  #[tokio::test]
  async fn test_refresh_same_key_does_not_evict() {
    let store = CacheStore::new(1);
    store.set("k", json!(1), SetOptions::default());
    store.set("k", json!(2), SetOptions::default());
    assert_eq!(store.get("k"), Some(json!(2)));
    assert_eq!(store.stats().evictions, 0);
  }

  #[tokio::test]
  async fn test_snapshot_restore_is_exact() {
    let store = CacheStore::default();
    store.set("k", json!({"qty": 1}), SetOptions::default().with_tag("cart"));
    let before = store.snapshot("k");

    store.set("k", json!({"qty": 5}), SetOptions::default());
    store.restore("k", before.clone());
    assert_eq!(store.snapshot("k"), before);

    store.restore("missing", None);
    assert!(store.snapshot("missing").is_none());
  }

  #[tokio::test]
  async fn test_stats_round_trip_through_storage() {
    let storage = MemoryStorage::default();
    let store = CacheStore::default();
    store.set("k", json!(1), SetOptions::default());
    store.get("k");
    store.get("missing");
    store.persist_stats(&storage).unwrap();

    let warm = CacheStore::default();
    warm.load_stats(&storage).unwrap();
    assert_eq!(warm.stats().hits, 1);
    assert_eq!(warm.stats().misses, 1);
    assert!((warm.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
  }

  #[tokio::test]
  async fn test_aborted_revalidation_releases_key() {
    let store = CacheStore::default();
    let claim = store.begin_revalidate("k").unwrap();
    assert!(store.begin_revalidate("k").is_none());

    let task = tokio::spawn(async move {
      let _claim = claim;
      futures::future::pending::<()>().await;
    });
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert!(store.begin_revalidate("k").is_some());
  }
}
