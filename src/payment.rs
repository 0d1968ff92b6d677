//! Payment verification. The server checks the signature; the client only
//! forwards it and never caches or replays the result.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::datalayer::{DataLayer, DataResponse, Mutation, MutationOptions};
use crate::entity::EntityKind;
use crate::error::{Error, Result};

/// Checkout callback data to be verified by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentVerification {
  pub order_id: String,
  pub payment_id: String,
  pub signature: String,
}

impl PaymentVerification {
  pub fn new(
    order_id: impl Into<String>,
    payment_id: impl Into<String>,
    signature: impl Into<String>,
  ) -> Self {
    Self {
      order_id: order_id.into(),
      payment_id: payment_id.into(),
      signature: signature.into(),
    }
  }

  pub fn validate(&self) -> Result<()> {
    for (field, value) in [
      ("order_id", &self.order_id),
      ("payment_id", &self.payment_id),
      ("signature", &self.signature),
    ] {
      if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
      }
    }
    if !self.signature.chars().all(|c| c.is_ascii_hexdigit()) {
      return Err(Error::Validation("signature must be hex encoded".into()));
    }
    Ok(())
  }

  fn payload(&self) -> Value {
    json!({
      "action": "verify",
      "order_id": self.order_id,
      "payment_id": self.payment_id,
      "signature": self.signature,
    })
  }
}

impl DataLayer {
  /// Ask the server to verify a payment signature and mark the order paid.
  pub async fn verify_payment(&self, verification: &PaymentVerification) -> Result<DataResponse<Value>> {
    verification.validate()?;
    let options = MutationOptions {
      optimistic: false,
      offline_sync: Some(false),
      dedup_key: Some(format!("payment:{}", verification.payment_id)),
      ..MutationOptions::default()
    };
    let response = self
      .mutate(EntityKind::Payments, Mutation::Create(verification.payload()), options)
      .await?;
    info!(order_id = %verification.order_id, "Payment verified");
    Ok(response)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_validation() {
    assert!(PaymentVerification::new("o1", "pay_1", "ab12").validate().is_ok());
    assert!(matches!(
      PaymentVerification::new("", "pay_1", "ab12").validate(),
      Err(Error::Validation(_))
    ));
    assert!(matches!(
      PaymentVerification::new("o1", "pay_1", "not-hex").validate(),
      Err(Error::Validation(_))
    ));
  }

  #[test]
  fn test_payload_marks_verify_action() {
    let payload = PaymentVerification::new("o1", "pay_1", "ab12").payload();
    assert_eq!(payload["action"], "verify");
    assert_eq!(payload["order_id"], "o1");
  }
}
