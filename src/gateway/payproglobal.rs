//! PayProGlobal-style gateway: redirect-only checkout links, no synchronous
//! downgrade, cancellation always terminates immediately. IPN bodies are
//! JSON signed with hex HMAC-SHA256 over their canonical encoding.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use url::Url;

use super::signature::{canonical_json, constant_time_eq, hmac_sha256};
use super::{
    http_client, log_call_failure, parse_timestamp, send_json, BillingPeriod, CancellationReceipt,
    CheckoutHandle, CheckoutRequest, GatewayAdapter, GatewayError, GatewayEvent, GatewayKind,
    PlanChange, PlanChangeRequest,
};

pub const SIGNATURE_HEADER: &str = "X-PayPro-Signature";
const REFERENCE_FIELD: &str = "x-order-reference";

#[derive(Debug, Clone)]
pub struct PayProGlobalConfig {
    pub api_url: String,
    pub checkout_url: String,
    pub vendor_account_id: String,
    pub api_secret_key: SecretString,
    pub webhook_secret: SecretString,
    pub timeout: Duration,
}

impl PayProGlobalConfig {
    pub fn new(
        vendor_account_id: impl Into<String>,
        api_secret_key: impl Into<SecretString>,
        webhook_secret: impl Into<SecretString>,
    ) -> Self {
        Self {
            api_url: "https://store.payproglobal.com/api".to_string(),
            checkout_url: "https://store.payproglobal.com/checkout".to_string(),
            vendor_account_id: vendor_account_id.into(),
            api_secret_key: api_secret_key.into(),
            webhook_secret: webhook_secret.into(),
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_checkout_url(mut self, url: impl Into<String>) -> Self {
        self.checkout_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct PayProGlobalAdapter {
    config: PayProGlobalConfig,
    http: reqwest::Client,
}

impl PayProGlobalAdapter {
    pub fn new(config: PayProGlobalConfig) -> Result<Self, GatewayError> {
        Url::parse(&config.checkout_url)
            .map_err(|e| GatewayError::Configuration(format!("invalid checkout url: {}", e)))?;
        let http = http_client(config.timeout, "tollway-payproglobal")?;
        Ok(Self { config, http })
    }

    fn checkout_link(&self, params: &[(&str, &str)]) -> Result<String, GatewayError> {
        Url::parse_with_params(&self.config.checkout_url, params)
            .map(String::from)
            .map_err(|e| GatewayError::Configuration(format!("invalid checkout url: {}", e)))
    }
}

fn id_field(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Custom fields arrive either as an object or as `key=value;key=value`.
fn order_reference(payload: &Value) -> Option<String> {
    match payload.get("customFields")? {
        Value::Object(map) => map.get(REFERENCE_FIELD).and_then(Value::as_str).map(str::to_string),
        Value::String(raw) => raw.split(';').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key.trim() == REFERENCE_FIELD).then(|| value.trim().to_string())
        }),
        _ => None,
    }
}

fn decode_ipn(payload: &Value) -> GatewayEvent {
    let kind = payload.get("ipnTypeName").and_then(Value::as_str).unwrap_or_default();
    let period_end = payload.get("subscriptionNextChargeDate").and_then(parse_timestamp);

    match kind {
        "OrderCharged" => GatewayEvent::PaymentCompleted {
            transaction_id: id_field(payload, "orderId"),
            order_reference: order_reference(payload),
            subscription_id: id_field(payload, "subscriptionId"),
            period_end,
        },
        "SubscriptionChargeSucceed" => match id_field(payload, "subscriptionId") {
            Some(subscription_id) => GatewayEvent::SubscriptionRenewed {
                subscription_id,
                transaction_id: id_field(payload, "orderId"),
                period_end,
            },
            None => GatewayEvent::Ignored { kind: kind.to_string() },
        },
        "SubscriptionTerminated" | "SubscriptionFinished" => match id_field(payload, "subscriptionId") {
            Some(subscription_id) => GatewayEvent::SubscriptionCanceled { subscription_id },
            None => GatewayEvent::Ignored { kind: kind.to_string() },
        },
        other => GatewayEvent::Ignored { kind: other.to_string() },
    }
}

#[async_trait]
impl GatewayAdapter for PayProGlobalAdapter {
    fn kind(&self) -> GatewayKind {
        GatewayKind::PayProGlobal
    }

    fn signature_header(&self) -> Option<&'static str> {
        Some(SIGNATURE_HEADER)
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutHandle, GatewayError> {
        let checkout_url = self.checkout_link(&[
            ("products[1][id]", request.product_id.as_str()),
            ("currency", request.currency.as_str()),
            ("billing-email", request.email.as_str()),
            (REFERENCE_FIELD, request.reference.as_str()),
        ])?;
        Ok(CheckoutHandle::Redirect { checkout_url })
    }

    /// Upgrades are paid through a fresh checkout; completion arrives by IPN
    /// carrying the order reference back in its custom fields.
    async fn upgrade(&self, request: &PlanChangeRequest) -> Option<PlanChange> {
        match self.checkout_link(&[
            ("products[1][id]", request.product_id.as_str()),
            ("x-upgrade-subscription", request.subscription_id.as_str()),
            (REFERENCE_FIELD, request.reference.as_str()),
        ]) {
            Ok(url) => Some(PlanChange {
                subscription_id: request.subscription_id.clone(),
                checkout_url: Some(url),
                ..PlanChange::default()
            }),
            Err(e) => {
                log_call_failure(GatewayKind::PayProGlobal, "upgrade", &request.subscription_id, &e);
                None
            }
        }
    }

    /// No remote downgrade exists; the orchestrator schedules the swap.
    async fn downgrade(&self, request: &PlanChangeRequest) -> Option<PlanChange> {
        tracing::debug!(
            target: "tollway::gateway::payproglobal",
            gateway = "payproglobal",
            subscription_id = %request.subscription_id,
            product = %request.product_id,
            "Downgrade is scheduled locally; no gateway call made"
        );
        Some(PlanChange {
            subscription_id: request.subscription_id.clone(),
            ..PlanChange::default()
        })
    }

    async fn cancel(&self, subscription_id: &str, period: BillingPeriod) -> Option<CancellationReceipt> {
        if period == BillingPeriod::EndOfPeriod {
            tracing::debug!(
                target: "tollway::gateway::payproglobal",
                gateway = "payproglobal",
                subscription_id = %subscription_id,
                "End-of-period cancellation unsupported; terminating immediately"
            );
        }

        let body = json!({
            "vendorAccountId": self.config.vendor_account_id,
            "apiSecretKey": self.config.api_secret_key.expose_secret(),
            "subscriptionId": subscription_id,
            "reasonText": "Cancelled by customer",
        });
        let url = format!("{}/Subscriptions/Terminate", self.config.api_url.trim_end_matches('/'));

        let result = send_json("cancel", self.http.post(url).json(&body))
            .await
            .and_then(|response| match response.get("isSuccess").and_then(Value::as_bool) {
                Some(true) => Ok(()),
                _ => Err(GatewayError::InvalidResponse {
                    operation: "cancel",
                    message: response
                        .get("errors")
                        .map(Value::to_string)
                        .unwrap_or_else(|| "isSuccess=false".to_string()),
                }),
            });

        match result {
            Ok(()) => Some(CancellationReceipt {
                subscription_id: subscription_id.to_string(),
                immediate: true,
                effective_at: Some(chrono::Utc::now()),
            }),
            Err(e) => {
                log_call_failure(GatewayKind::PayProGlobal, "cancel", subscription_id, &e);
                None
            }
        }
    }

    fn verify_webhook(&self, raw: &[u8], signature: &str) -> bool {
        let payload: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(_) => return false,
        };
        let provided = match hex::decode(signature.trim()) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let expected = hmac_sha256(
            self.config.webhook_secret.expose_secret().as_bytes(),
            canonical_json(&payload).as_bytes(),
        );
        constant_time_eq(&expected, &provided)
    }

    fn parse_webhook(&self, raw: &[u8]) -> Result<Vec<GatewayEvent>, GatewayError> {
        let payload: Value = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::InvalidPayload(e.to_string()))?;
        Ok(vec![decode_ipn(&payload)])
    }
}
