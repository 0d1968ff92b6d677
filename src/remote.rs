//! Remote data source port and its REST implementation.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::entity::EntityKind;
use crate::error::{Error, Result};

/// One entry of a batch mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum BatchItem {
  Create {
    entity: EntityKind,
    data: Value,
  },
  Update {
    entity: EntityKind,
    id: String,
    data: Value,
  },
  Delete {
    entity: EntityKind,
    id: String,
  },
}

impl BatchItem {
  pub fn entity(&self) -> EntityKind {
    match self {
      BatchItem::Create { entity, .. }
      | BatchItem::Update { entity, .. }
      | BatchItem::Delete { entity, .. } => *entity,
    }
  }

  pub fn entity_id(&self) -> Option<&str> {
    match self {
      BatchItem::Create { .. } => None,
      BatchItem::Update { id, .. } | BatchItem::Delete { id, .. } => Some(id),
    }
  }
}

/// The server. Every network call of the data layer goes through this trait.
#[async_trait]
pub trait RemoteSource: Send + Sync {
  /// `Ok(None)` when the entity does not exist.
  async fn fetch_entity(&self, kind: EntityKind, id: &str) -> Result<Option<Value>>;

  async fn create_entity(&self, kind: EntityKind, data: &Value) -> Result<Value>;

  async fn update_entity(&self, kind: EntityKind, id: &str, partial: &Value) -> Result<Value>;

  async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<()>;

  async fn batch(&self, items: &[BatchItem]) -> Result<Vec<Value>>;

  /// Push updates for one entity. Sources without push support return an
  /// empty stream.
  fn subscribe(&self, _kind: EntityKind, _id: &str) -> BoxStream<'static, Value> {
    Box::pin(stream::empty())
  }
}

/// REST client: `{base}/{entity}/{id}` for single entities, `{base}/batch`
/// for batches.
#[derive(Debug, Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
  api_key: Option<String>,
  timeout: Duration,
}

impl HttpRemote {
  pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
    let mut base = Url::parse(base_url)
      .map_err(|e| Error::Validation(format!("invalid base url {}: {}", base_url, e)))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| Error::Network(format!("failed to build http client: {}", e)))?;

    Ok(Self {
      client,
      base,
      api_key,
      timeout,
    })
  }

  fn url(&self, segments: &[&str]) -> Result<Url> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| Error::Validation(format!("base url {} cannot hold a path", self.base)))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  async fn send(&self, method: Method, segments: &[&str], body: Option<&Value>) -> Result<Option<Value>> {
    let url = self.url(segments)?;
    debug!(%method, %url, "Remote request");
    let mut request = self.client.request(method, url.clone());
    if let Some(key) = &self.api_key {
      request = request.bearer_auth(key);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await.map_err(|e| self.transport_error(e))?;
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if status.is_success() {
      if status == StatusCode::NO_CONTENT {
        return Ok(Some(Value::Null));
      }
      let text = response.text().await.map_err(|e| self.transport_error(e))?;
      if text.trim().is_empty() {
        return Ok(Some(Value::Null));
      }
      return Ok(Some(serde_json::from_str(&text)?));
    }

    let text = response.text().await.unwrap_or_default();
    Err(status_error(status, segments, &url, text))
  }

  fn transport_error(&self, e: reqwest::Error) -> Error {
    if e.is_timeout() {
      Error::Timeout(self.timeout)
    } else {
      Error::from(e)
    }
  }
}

fn status_error(status: StatusCode, segments: &[&str], url: &Url, body: String) -> Error {
  let detail = if body.is_empty() {
    format!("{} {}", status, url)
  } else {
    format!("{} {}: {}", status, url, body)
  };
  match status {
    StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::Validation(detail),
    StatusCode::CONFLICT => Error::Conflict {
      entity: segments.first().copied().unwrap_or_default().to_string(),
      id: segments.get(1).copied().unwrap_or_default().to_string(),
      reason: detail,
    },
    StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Error::Network(detail),
    s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => Error::Network(detail),
    _ => Error::Validation(detail),
  }
}

#[async_trait]
impl RemoteSource for HttpRemote {
  async fn fetch_entity(&self, kind: EntityKind, id: &str) -> Result<Option<Value>> {
    self.send(Method::GET, &[kind.name(), id], None).await
  }

  async fn create_entity(&self, kind: EntityKind, data: &Value) -> Result<Value> {
    self
      .send(Method::POST, &[kind.name()], Some(data))
      .await?
      .ok_or_else(|| Error::NotFound(kind.name().to_string()))
  }

  async fn update_entity(&self, kind: EntityKind, id: &str, partial: &Value) -> Result<Value> {
    self
      .send(Method::PATCH, &[kind.name(), id], Some(partial))
      .await?
      .ok_or_else(|| Error::NotFound(format!("{}:{}", kind, id)))
  }

  async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<()> {
    // Deleting something already gone is not an error.
    self.send(Method::DELETE, &[kind.name(), id], None).await?;
    Ok(())
  }

  async fn batch(&self, items: &[BatchItem]) -> Result<Vec<Value>> {
    let body = serde_json::json!({ "operations": items });
    match self.send(Method::POST, &["batch"], Some(&body)).await? {
      Some(Value::Array(results)) => Ok(results),
      Some(Value::Object(mut obj)) => match obj.remove("results") {
        Some(Value::Array(results)) => Ok(results),
        _ => Err(Error::Serialization("batch response has no results array".into())),
      },
      Some(other) => Err(Error::Serialization(format!(
        "unexpected batch response: {}",
        other
      ))),
      None => Err(Error::NotFound("batch endpoint".into())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn remote() -> HttpRemote {
    HttpRemote::new("https://api.example.com/v1", None, Duration::from_secs(5)).unwrap()
  }

  #[test]
  fn test_url_building() {
    let r = remote();
    assert_eq!(
      r.url(&["products", "42"]).unwrap().as_str(),
      "https://api.example.com/v1/products/42"
    );
    assert_eq!(
      r.url(&["user-profile", "a b"]).unwrap().as_str(),
      "https://api.example.com/v1/user-profile/a%20b"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    let err = HttpRemote::new("not a url", None, Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
  }

  #[test]
  fn test_status_mapping() {
    let url = Url::parse("https://api.example.com/v1/cart/7").unwrap();
    let segments = ["cart", "7"];
    assert!(matches!(
      status_error(StatusCode::UNPROCESSABLE_ENTITY, &segments, &url, String::new()),
      Error::Validation(_)
    ));
    assert!(matches!(
      status_error(StatusCode::SERVICE_UNAVAILABLE, &segments, &url, String::new()),
      Error::Network(_)
    ));
    match status_error(StatusCode::CONFLICT, &segments, &url, "stale".into()) {
      Error::Conflict { entity, id, .. } => {
        assert_eq!(entity, "cart");
        assert_eq!(id, "7");
      }
      other => panic!("expected conflict, got {:?}", other),
    }
  }

  #[test]
  fn test_batch_item_serialization() {
    let item = BatchItem::Update {
      entity: EntityKind::Cart,
      id: "c1".into(),
      data: serde_json::json!({"qty": 2}),
    };
    let value = serde_json::to_value(&item).unwrap();
    assert_eq!(value["op"], "update");
    assert_eq!(value["entity"], "cart");
    assert_eq!(item.entity_id(), Some("c1"));
  }
}
