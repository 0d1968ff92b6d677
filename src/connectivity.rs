//! Online/offline signal and link quality hints.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Effective connection type as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveType {
  #[serde(rename = "slow-2g")]
  Slow2g,
  #[serde(rename = "2g")]
  TwoG,
  #[serde(rename = "3g")]
  ThreeG,
  #[serde(rename = "4g")]
  FourG,
  #[default]
  Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
  pub online: bool,
  pub effective_type: EffectiveType,
  pub downlink_mbps: f64,
  pub rtt_ms: u32,
}

impl Default for NetworkStatus {
  fn default() -> Self {
    Self {
      online: true,
      effective_type: EffectiveType::Unknown,
      downlink_mbps: 10.0,
      rtt_ms: 50,
    }
  }
}

impl NetworkStatus {
  /// Slow enough that non-critical work should be deferred.
  pub fn is_slow(&self) -> bool {
    matches!(
      self.effective_type,
      EffectiveType::Slow2g | EffectiveType::TwoG
    ) || self.rtt_ms > 1000
  }
}

/// Shared connectivity state. Cheap to clone; every clone sees the same
/// status.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: watch::Sender<NetworkStatus>,
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(NetworkStatus::default())
  }
}

impl Connectivity {
  pub fn new(initial: NetworkStatus) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx }
  }

  pub fn offline() -> Self {
    Self::new(NetworkStatus {
      online: false,
      ..NetworkStatus::default()
    })
  }

  pub fn status(&self) -> NetworkStatus {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.tx.borrow().online
  }

  /// Record an online/offline transition. Receivers are only woken when the
  /// value actually changes.
  pub fn set_online(&self, online: bool) {
    self.tx.send_if_modified(|status| {
      if status.online == online {
        return false;
      }
      status.online = online;
      info!(online, "Connectivity changed");
      true
    });
  }

  pub fn update_quality(&self, effective_type: EffectiveType, downlink_mbps: f64, rtt_ms: u32) {
    self.tx.send_modify(|status| {
      status.effective_type = effective_type;
      status.downlink_mbps = downlink_mbps;
      status.rtt_ms = rtt_ms;
    });
  }

  pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
    self.tx.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_transition_wakes_subscriber() {
    let conn = Connectivity::offline();
    let mut rx = conn.subscribe();
    assert!(!conn.is_online());

    conn.set_online(true);
    rx.changed().await.unwrap();
    assert!(rx.borrow().online);
  }

  #[test]
  fn test_same_value_does_not_notify() {
    let conn = Connectivity::default();
    let mut rx = conn.subscribe();
    rx.mark_unchanged();
    conn.set_online(true);
    assert!(!rx.has_changed().unwrap());
  }

  #[test]
  fn test_slow_detection() {
    let conn = Connectivity::default();
    assert!(!conn.status().is_slow());
    conn.update_quality(EffectiveType::TwoG, 0.2, 600);
    assert!(conn.status().is_slow());
    conn.update_quality(EffectiveType::FourG, 20.0, 1500);
    assert!(conn.status().is_slow());
  }
}
