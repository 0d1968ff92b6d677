//! Cache keys for storefront queries.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::entity::EntityKind;

/// What a query reads. Turns into a stable cache key and the tags used for
/// bulk invalidation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryKey {
  /// A single entity by id.
  Entity { kind: EntityKind, id: String },
  /// A filtered listing, e.g. products in a category.
  List {
    kind: EntityKind,
    params: BTreeMap<String, String>,
  },
  /// Free-text search.
  Search { kind: EntityKind, query: String },
}

impl QueryKey {
  pub fn entity(kind: EntityKind, id: impl Into<String>) -> Self {
    Self::Entity {
      kind,
      id: id.into(),
    }
  }

  pub fn list<K, V>(kind: EntityKind, params: impl IntoIterator<Item = (K, V)>) -> Self
  where
    K: Into<String>,
    V: Into<String>,
  {
    Self::List {
      kind,
      params: params.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
    }
  }

  pub fn search(kind: EntityKind, query: impl Into<String>) -> Self {
    Self::Search {
      kind,
      query: query.into(),
    }
  }

  pub fn kind(&self) -> EntityKind {
    match self {
      Self::Entity { kind, .. } | Self::List { kind, .. } | Self::Search { kind, .. } => *kind,
    }
  }

  /// Entity keys stay readable (`products:42`) so they line up with the
  /// per-entity tags. Lists and searches are hashed to a fixed length.
  pub fn cache_key(&self) -> String {
    match self {
      Self::Entity { kind, id } => entity_key(*kind, id),
      Self::List { kind, params } => {
        let input = params
          .iter()
          .map(|(k, v)| format!("{}={}", k.trim().to_lowercase(), v.trim()))
          .collect::<Vec<_>>()
          .join("&");
        format!("{}:list:{}", kind, hash(&input))
      }
      Self::Search { kind, query } => {
        format!("{}:search:{}", kind, hash(&normalize_query(query)))
      }
    }
  }

  /// Tags attached to the cached value on top of the entity kind's own tags.
  pub fn tags(&self) -> Vec<String> {
    match self {
      Self::Entity { kind, id } => vec![kind.name().to_string(), entity_key(*kind, id)],
      Self::List { kind, .. } | Self::Search { kind, .. } => {
        vec![kind.name().to_string(), format!("{}:collection", kind)]
      }
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::Entity { kind, id } => format!("{} {}", kind, id),
      Self::List { kind, params } if params.is_empty() => format!("all {}", kind),
      Self::List { kind, params } => {
        let filters = params
          .iter()
          .map(|(k, v)| format!("{}={}", k, v))
          .collect::<Vec<_>>()
          .join(", ");
        format!("{} where {}", kind, filters)
      }
      Self::Search { kind, query } => format!("{} matching '{}'", kind, query),
    }
  }
}

/// `kind:id`, used both as cache key and as the per-entity tag.
pub fn entity_key(kind: EntityKind, id: &str) -> String {
  format!("{}:{}", kind, id)
}

fn hash(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Collapse whitespace and lowercase so equivalent searches share a key.
fn normalize_query(query: &str) -> String {
  query
    .split_whitespace()
    .collect::<Vec<_>>()
    .join(" ")
    .to_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_entity_key_is_readable() {
    let key = QueryKey::entity(EntityKind::Products, "42");
    assert_eq!(key.cache_key(), "products:42");
    assert_eq!(key.tags(), vec!["products".to_string(), "products:42".to_string()]);
  }

  #[test]
  fn test_list_key_ignores_param_order() {
    let a = QueryKey::list(EntityKind::Products, [("category", "shoes"), ("sort", "price")]);
    let b = QueryKey::list(EntityKind::Products, [("sort", "price"), ("category", "shoes")]);
    assert_eq!(a.cache_key(), b.cache_key());
    assert!(a.cache_key().starts_with("products:list:"));
    assert_eq!(a.cache_key().len(), "products:list:".len() + 64);
  }

  #[test]
  fn test_search_normalization() {
    let a = QueryKey::search(EntityKind::Products, "  Red   Shoes ");
    let b = QueryKey::search(EntityKind::Products, "red shoes");
    assert_eq!(a.cache_key(), b.cache_key());
    assert_ne!(
      a.cache_key(),
      QueryKey::search(EntityKind::Reviews, "red shoes").cache_key()
    );
  }

  #[test]
  fn test_description() {
    assert_eq!(
      QueryKey::list(EntityKind::Orders, Vec::<(String, String)>::new()).description(),
      "all orders"
    );
    assert_eq!(
      QueryKey::entity(EntityKind::Cart, "c1").description(),
      "cart c1"
    );
  }
}
