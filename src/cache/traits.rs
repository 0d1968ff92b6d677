//! Core types shared by the cache store and the strategy layer.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::entity::{CacheConfig, Priority};

/// A resident cache entry.
///
/// An entry past `ttl` is logically absent to plain reads but may still be
/// served as stale until `max_age`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  pub inserted_at: Instant,
  pub ttl: Duration,
  pub max_age: Duration,
  pub priority: Priority,
  pub tags: BTreeSet<String>,
  pub compressed: bool,
}

impl CacheEntry {
  pub fn age(&self, now: Instant) -> Duration {
    now.saturating_duration_since(self.inserted_at)
  }

  pub fn is_fresh(&self, now: Instant) -> bool {
    self.age(now) < self.ttl
  }

  /// Still usable as a degraded (stale) response.
  pub fn is_servable(&self, now: Instant) -> bool {
    self.age(now) <= self.max_age && !self.max_age.is_zero()
  }
}

/// Options for a single `set`.
#[derive(Debug, Clone, PartialEq)]
pub struct SetOptions {
  pub ttl: Duration,
  pub max_age: Duration,
  pub priority: Priority,
  pub tags: BTreeSet<String>,
  pub compress: bool,
}

impl Default for SetOptions {
  fn default() -> Self {
    SetOptions::from(&CacheConfig::default())
  }
}

impl From<&CacheConfig> for SetOptions {
  fn from(config: &CacheConfig) -> Self {
    Self {
      ttl: config.ttl,
      max_age: config.max_age.max(config.ttl),
      priority: config.priority,
      tags: config.tags.iter().cloned().collect(),
      compress: config.compress,
    }
  }
}

impl SetOptions {
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self.max_age = self.max_age.max(ttl);
    self
  }

  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.insert(tag.into());
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }
}

/// A read answered by a [`CacheLayer`](super::CacheLayer) strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
  pub value: Value,
  pub origin: ReadOrigin,
  /// Age of the cached copy when it was served. `None` after a load.
  pub age: Option<Duration>,
}

impl CacheRead {
  pub(crate) fn loaded(value: Value) -> Self {
    Self {
      value,
      origin: ReadOrigin::Loaded,
      age: None,
    }
  }

  pub(crate) fn cached(entry: CacheEntry, origin: ReadOrigin) -> Self {
    Self {
      age: Some(entry.age(Instant::now())),
      value: entry.value,
      origin,
    }
  }
}

/// How a strategy answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrigin {
  /// The loader ran and its result was backfilled.
  Loaded,
  Fresh,
  /// Past its TTL but allowed by the strategy, e.g. while a background
  /// refresh runs.
  Stale,
  /// The loader failed and a resident copy was served instead.
  Fallback,
}

/// Counters kept by the store. Persisted between runs as cache-warm metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub stale_hits: u64,
  pub sets: u64,
  pub evictions: u64,
  pub invalidations: u64,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}
