//! Conflict detection and resolution between a queued payload and the
//! current server state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::{ConflictPolicy, EntityKind};

/// Which side's value a diverging field ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
  Client,
  Server,
}

/// One field whose local and server values differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
  pub field: String,
  pub local: Value,
  pub server: Value,
  /// `None` while a manual decision is outstanding.
  pub kept: Option<Side>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
  pub operation_id: String,
  pub entity: EntityKind,
  pub entity_id: String,
  pub local: Value,
  pub server: Value,
  pub fields: Vec<FieldConflict>,
}

/// Decides `manual` conflicts. Returning `None` leaves the operation queued
/// until a later sync pass.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
  async fn resolve(&self, conflict: &SyncConflict) -> Option<Value>;
}

/// What to do with a conflicting operation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Plan {
  /// Send this payload to the server.
  Write(Value),
  /// Drop the local change and take the server state as the result.
  Adopt(Value),
  /// Needs an external decision.
  Ask,
}

/// Fields of `local` that are absent on the server or hold another value.
/// Non-object payloads are compared whole under the empty field name.
pub(crate) fn diverging_fields(local: &Value, server: &Value) -> Vec<FieldConflict> {
  match (local.as_object(), server.as_object()) {
    (Some(local), Some(server)) => local
      .iter()
      .filter(|(field, value)| server.get(field.as_str()) != Some(*value))
      .map(|(field, value)| FieldConflict {
        field: field.clone(),
        local: value.clone(),
        server: server.get(field.as_str()).cloned().unwrap_or(Value::Null),
        kept: None,
      })
      .collect(),
    _ if local == server => Vec::new(),
    _ => vec![FieldConflict {
      field: String::new(),
      local: local.clone(),
      server: server.clone(),
      kept: None,
    }],
  }
}

/// Resolve `local` against `server` under `policy`. `server_fields` lists
/// the fields the server owns under `merge` (stock, price).
pub(crate) fn plan(
  policy: ConflictPolicy,
  local: &Value,
  server: &Value,
  server_fields: &[String],
) -> (Plan, Vec<FieldConflict>) {
  let mut fields = diverging_fields(local, server);
  if fields.is_empty() {
    return (Plan::Write(local.clone()), fields);
  }

  let plan = match policy {
    ConflictPolicy::ClientWins => {
      mark(&mut fields, |_| Side::Client);
      Plan::Write(local.clone())
    }
    ConflictPolicy::ServerWins => {
      mark(&mut fields, |_| Side::Server);
      Plan::Adopt(server.clone())
    }
    ConflictPolicy::Merge => {
      let owned_by_server = |f: &FieldConflict| server_fields.iter().any(|s| *s == f.field);
      mark(&mut fields, |f| {
        if owned_by_server(f) {
          Side::Server
        } else {
          Side::Client
        }
      });
      match local.as_object() {
        Some(obj) => {
          let merged: Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| {
              !fields
                .iter()
                .any(|f| f.field == **k && f.kept == Some(Side::Server))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
          let client_changes = fields.iter().any(|f| f.kept == Some(Side::Client));
          if client_changes {
            Plan::Write(Value::Object(merged))
          } else {
            Plan::Adopt(server.clone())
          }
        }
        None => Plan::Write(local.clone()),
      }
    }
    ConflictPolicy::Manual => Plan::Ask,
  };
  (plan, fields)
}

fn mark(fields: &mut [FieldConflict], side: impl Fn(&FieldConflict) -> Side) {
  for field in fields.iter_mut() {
    field.kept = Some(side(field));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_no_divergence_writes_local() {
    let local = json!({"qty": 2});
    let (plan, fields) = plan(ConflictPolicy::Manual, &local, &json!({"qty": 2, "id": "c1"}), &[]);
    assert_eq!(plan, Plan::Write(local));
    assert!(fields.is_empty());
  }

  #[test]
  fn test_client_and_server_wins() {
    let local = json!({"qty": 3});
    let server = json!({"qty": 1});
    let (p, fields) = plan(ConflictPolicy::ClientWins, &local, &server, &[]);
    assert_eq!(p, Plan::Write(local.clone()));
    assert_eq!(fields[0].kept, Some(Side::Client));

    let (p, fields) = plan(ConflictPolicy::ServerWins, &local, &server, &[]);
    assert_eq!(p, Plan::Adopt(server));
    assert_eq!(fields[0].kept, Some(Side::Server));
  }

  #[test]
  fn test_merge_keeps_server_owned_fields() {
    let local = json!({"name": "Trail shoe", "stock": 10, "price": 80});
    let server = json!({"name": "Shoe", "stock": 4, "price": 80});
    let server_fields = vec!["stock".to_string(), "price".to_string()];
    let (p, fields) = plan(ConflictPolicy::Merge, &local, &server, &server_fields);

    assert_eq!(p, Plan::Write(json!({"name": "Trail shoe", "price": 80})));
    assert_eq!(fields.len(), 2);
    let stock = fields.iter().find(|f| f.field == "stock").unwrap();
    assert_eq!(stock.kept, Some(Side::Server));
    let name = fields.iter().find(|f| f.field == "name").unwrap();
    assert_eq!(name.kept, Some(Side::Client));
  }

  #[test]
  fn test_merge_with_only_server_fields_adopts_server() {
    let server = json!({"stock": 4});
    let (p, _) = plan(
      ConflictPolicy::Merge,
      &json!({"stock": 10}),
      &server,
      &["stock".to_string()],
    );
    assert_eq!(p, Plan::Adopt(server));
  }

  #[test]
  fn test_manual_asks() {
    let (p, fields) = plan(ConflictPolicy::Manual, &json!({"a": 1}), &json!({"a": 2}), &[]);
    assert_eq!(p, Plan::Ask);
    assert_eq!(fields[0].kept, None);
  }

  #[test]
  fn test_scalar_payloads() {
    assert!(diverging_fields(&json!(1), &json!(1)).is_empty());
    assert_eq!(diverging_fields(&json!(1), &json!(2))[0].field, "");
  }
}
