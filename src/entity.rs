//! Entity kinds and their per-kind caching and sync policy.
//!
//! Every kind maps to exactly one [`CacheConfig`] through an exhaustive match,
//! so adding a kind without a policy is a compile error.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Scheduling tier, highest first: critical > high > normal > low > background.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Background,
  Low,
  #[default]
  Normal,
  High,
  Critical,
}

impl Priority {
  /// All tiers, highest first.
  pub const ALL: [Priority; 5] = [
    Priority::Critical,
    Priority::High,
    Priority::Normal,
    Priority::Low,
    Priority::Background,
  ];

  /// One step toward `Background`. Saturates.
  pub fn downgrade(self) -> Self {
    match self {
      Priority::Critical => Priority::High,
      Priority::High => Priority::Normal,
      Priority::Normal => Priority::Low,
      Priority::Low | Priority::Background => Priority::Background,
    }
  }
}

/// How a read for an entity kind balances cache and network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  NetworkOnly,
  CacheOnly,
}

/// What to do when local and server state diverge during replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
  #[default]
  ClientWins,
  ServerWins,
  Merge,
  Manual,
}

/// Resolved policy for one entity kind.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
  pub strategy: CacheStrategy,
  /// Freshness window.
  pub ttl: Duration,
  /// Hard limit after which a stale entry is no longer served.
  pub max_age: Duration,
  pub priority: Priority,
  pub tags: Vec<String>,
  pub compress: bool,
  /// Marks payloads that storage backends must not keep in plaintext.
  pub encrypt: bool,
  /// Failed mutations for this kind are handed to offline sync.
  pub sync_when_online: bool,
  pub conflict: ConflictPolicy,
  /// Fields the server owns during a `Merge`; every other divergent field
  /// takes the client value.
  pub server_fields: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      strategy: CacheStrategy::CacheFirst,
      ttl: Duration::from_secs(5 * 60),
      max_age: Duration::from_secs(60 * 60),
      priority: Priority::Normal,
      tags: Vec::new(),
      compress: false,
      encrypt: false,
      sync_when_online: false,
      conflict: ConflictPolicy::ClientWins,
      server_fields: Vec::new(),
    }
  }
}

/// Storefront entity categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
  Products,
  Categories,
  Cart,
  UserProfile,
  Orders,
  Wishlist,
  Reviews,
  Payments,
}

impl EntityKind {
  pub const ALL: [EntityKind; 8] = [
    EntityKind::Products,
    EntityKind::Categories,
    EntityKind::Cart,
    EntityKind::UserProfile,
    EntityKind::Orders,
    EntityKind::Wishlist,
    EntityKind::Reviews,
    EntityKind::Payments,
  ];

  /// Canonical name, also the REST path segment.
  pub fn name(self) -> &'static str {
    match self {
      EntityKind::Products => "products",
      EntityKind::Categories => "categories",
      EntityKind::Cart => "cart",
      EntityKind::UserProfile => "user-profile",
      EntityKind::Orders => "orders",
      EntityKind::Wishlist => "wishlist",
      EntityKind::Reviews => "reviews",
      EntityKind::Payments => "payments",
    }
  }

  pub fn aliases(self) -> &'static [&'static str] {
    match self {
      EntityKind::Products => &["product", "p", "catalog"],
      EntityKind::Categories => &["category", "cat"],
      EntityKind::Cart => &["carts", "basket"],
      EntityKind::UserProfile => &["profile", "user", "user_profile"],
      EntityKind::Orders => &["order", "o"],
      EntityKind::Wishlist => &["wishlists", "wish"],
      EntityKind::Reviews => &["review", "r"],
      EntityKind::Payments => &["payment", "pay"],
    }
  }

  /// Built-in policy for this kind.
  pub fn default_config(self) -> CacheConfig {
    let secs = Duration::from_secs;
    match self {
      EntityKind::Products => CacheConfig {
        strategy: CacheStrategy::StaleWhileRevalidate,
        ttl: secs(5 * 60),
        max_age: secs(60 * 60),
        priority: Priority::High,
        tags: tags(&["products", "catalog"]),
        compress: true,
        conflict: ConflictPolicy::Merge,
        server_fields: tags(&["stock", "price"]),
        ..CacheConfig::default()
      },
      EntityKind::Categories => CacheConfig {
        strategy: CacheStrategy::CacheFirst,
        ttl: secs(30 * 60),
        max_age: secs(24 * 60 * 60),
        priority: Priority::Normal,
        tags: tags(&["categories", "catalog"]),
        compress: true,
        conflict: ConflictPolicy::ServerWins,
        ..CacheConfig::default()
      },
      EntityKind::Cart => CacheConfig {
        strategy: CacheStrategy::NetworkFirst,
        ttl: secs(30),
        max_age: secs(5 * 60),
        priority: Priority::Critical,
        tags: tags(&["cart", "user"]),
        sync_when_online: true,
        conflict: ConflictPolicy::Merge,
        server_fields: tags(&["price", "stock"]),
        ..CacheConfig::default()
      },
      EntityKind::UserProfile => CacheConfig {
        strategy: CacheStrategy::CacheFirst,
        ttl: secs(10 * 60),
        max_age: secs(60 * 60),
        priority: Priority::High,
        tags: tags(&["user"]),
        encrypt: true,
        sync_when_online: true,
        conflict: ConflictPolicy::ClientWins,
        ..CacheConfig::default()
      },
      EntityKind::Orders => CacheConfig {
        strategy: CacheStrategy::NetworkFirst,
        ttl: secs(60),
        max_age: secs(10 * 60),
        priority: Priority::High,
        tags: tags(&["orders", "user"]),
        sync_when_online: true,
        conflict: ConflictPolicy::ServerWins,
        ..CacheConfig::default()
      },
      EntityKind::Wishlist => CacheConfig {
        strategy: CacheStrategy::CacheFirst,
        ttl: secs(5 * 60),
        max_age: secs(60 * 60),
        priority: Priority::Low,
        tags: tags(&["wishlist", "user"]),
        sync_when_online: true,
        conflict: ConflictPolicy::ClientWins,
        ..CacheConfig::default()
      },
      EntityKind::Reviews => CacheConfig {
        strategy: CacheStrategy::StaleWhileRevalidate,
        ttl: secs(15 * 60),
        max_age: secs(6 * 60 * 60),
        priority: Priority::Low,
        tags: tags(&["reviews", "catalog"]),
        compress: true,
        sync_when_online: true,
        conflict: ConflictPolicy::ClientWins,
        ..CacheConfig::default()
      },
      // Payments are never cached and never replayed.
      EntityKind::Payments => CacheConfig {
        strategy: CacheStrategy::NetworkOnly,
        ttl: Duration::ZERO,
        max_age: Duration::ZERO,
        priority: Priority::Critical,
        tags: tags(&["payments"]),
        conflict: ConflictPolicy::ServerWins,
        ..CacheConfig::default()
      },
    }
  }

  /// Resolve user input to a kind: exact name, alias, then prefix match.
  pub fn resolve(input: &str) -> Option<EntityKind> {
    suggestions(input).into_iter().next()
  }
}

fn tags(values: &[&str]) -> Vec<String> {
  values.iter().map(|s| s.to_string()).collect()
}

/// Candidate kinds for partial input, best match first.
pub fn suggestions(input: &str) -> Vec<EntityKind> {
  let input = input.trim().to_lowercase();
  if input.is_empty() {
    return EntityKind::ALL.to_vec();
  }

  let mut matches: Vec<(EntityKind, u32)> = Vec::new();
  for kind in EntityKind::ALL {
    if kind.name() == input {
      matches.push((kind, 0));
    } else if kind.aliases().contains(&input.as_str()) {
      matches.push((kind, 1));
    } else if kind.name().starts_with(&input) {
      matches.push((kind, 2));
    } else if kind.aliases().iter().any(|a| a.starts_with(&input)) {
      matches.push((kind, 3));
    }
  }

  matches.sort_by_key(|(_, rank)| *rank);
  matches.into_iter().map(|(kind, _)| kind).collect()
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for EntityKind {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    EntityKind::resolve(s).ok_or_else(|| Error::Validation(format!("unknown entity type '{}'", s)))
  }
}

/// Partial override of a kind's built-in policy, as read from config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EntityOverride {
  pub strategy: Option<CacheStrategy>,
  pub ttl_secs: Option<u64>,
  pub max_age_secs: Option<u64>,
  pub priority: Option<Priority>,
  pub conflict: Option<ConflictPolicy>,
  pub server_fields: Option<Vec<String>>,
  pub sync_when_online: Option<bool>,
}

/// The resolved policy table for every kind.
#[derive(Debug, Clone)]
pub struct EntityPolicies {
  configs: HashMap<EntityKind, CacheConfig>,
}

impl EntityPolicies {
  pub fn new(overrides: &HashMap<EntityKind, EntityOverride>) -> Self {
    let configs = EntityKind::ALL
      .into_iter()
      .map(|kind| {
        let mut config = kind.default_config();
        if let Some(o) = overrides.get(&kind) {
          apply_override(&mut config, o);
        }
        (kind, config)
      })
      .collect();
    Self { configs }
  }

  pub fn get(&self, kind: EntityKind) -> CacheConfig {
    self
      .configs
      .get(&kind)
      .cloned()
      .unwrap_or_else(|| kind.default_config())
  }
}

impl Default for EntityPolicies {
  fn default() -> Self {
    Self::new(&HashMap::new())
  }
}

fn apply_override(config: &mut CacheConfig, o: &EntityOverride) {
  if let Some(strategy) = o.strategy {
    config.strategy = strategy;
  }
  if let Some(ttl) = o.ttl_secs {
    config.ttl = Duration::from_secs(ttl);
  }
  if let Some(max_age) = o.max_age_secs {
    config.max_age = Duration::from_secs(max_age);
  }
  if let Some(priority) = o.priority {
    config.priority = priority;
  }
  if let Some(conflict) = o.conflict {
    config.conflict = conflict;
  }
  if let Some(fields) = &o.server_fields {
    config.server_fields = fields.clone();
  }
  if let Some(sync) = o.sync_when_online {
    config.sync_when_online = sync;
  }
  // max_age below ttl would make fresh entries unservable as stale
  if config.max_age < config.ttl {
    config.max_age = config.ttl;
  }
}
