//! FastSpring-style gateway: basic auth REST API, synchronous session ids,
//! batched webhook events signed with base64 HMAC-SHA256.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use super::signature::{constant_time_eq, hmac_sha256};
use super::{
    http_client, log_call_failure, parse_timestamp, send_json, BillingPeriod, CancellationReceipt,
    CheckoutHandle, CheckoutRequest, GatewayAdapter, GatewayError, GatewayEvent, GatewayKind,
    PlanChange, PlanChangeRequest,
};

pub const SIGNATURE_HEADER: &str = "X-FS-Signature";

#[derive(Debug, Clone)]
pub struct FastSpringConfig {
    pub api_url: String,
    pub username: String,
    pub password: SecretString,
    pub webhook_secret: SecretString,
    /// Storefront popup URL; the session id is appended to build the checkout link.
    pub checkout_url: Option<String>,
    pub timeout: Duration,
}

impl FastSpringConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<SecretString>,
        webhook_secret: impl Into<SecretString>,
    ) -> Self {
        Self {
            api_url: "https://api.fastspring.com".to_string(),
            username: username.into(),
            password: password.into(),
            webhook_secret: webhook_secret.into(),
            checkout_url: None,
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_checkout_url(mut self, url: impl Into<String>) -> Self {
        self.checkout_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct FastSpringAdapter {
    config: FastSpringConfig,
    http: reqwest::Client,
}

impl FastSpringAdapter {
    pub fn new(config: FastSpringConfig) -> Result<Self, GatewayError> {
        let http = http_client(config.timeout, "tollway-fastspring")?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.basic_auth(
            &self.config.username,
            Some(self.config.password.expose_secret()),
        )
    }

    /// Swap the product on a subscription, prorating immediately.
    async fn change_product(
        &self,
        operation: &'static str,
        subscription_id: &str,
        product_id: &str,
    ) -> Option<PlanChange> {
        let body = json!({
            "subscriptions": [{
                "subscription": subscription_id,
                "product": product_id,
                "quantity": 1,
                "prorate": true,
            }]
        });

        let request = self.authed(self.http.post(self.url("/subscriptions"))).json(&body);
        match send_json(operation, request).await.and_then(|v| first_result(operation, &v)) {
            Ok(entry) => {
                tracing::info!(
                    target: "tollway::gateway::fastspring",
                    gateway = "fastspring",
                    operation = operation,
                    subscription_id = %subscription_id,
                    product = %product_id,
                    "Subscription product changed"
                );
                Some(PlanChange {
                    subscription_id: subscription_id.to_string(),
                    transaction_id: None,
                    checkout_url: None,
                    next_billing_at: entry.get("nextChargeDate").and_then(parse_timestamp),
                })
            }
            Err(e) => {
                log_call_failure(GatewayKind::FastSpring, operation, subscription_id, &e);
                None
            }
        }
    }
}

/// FastSpring answers batch endpoints with one result entry per subscription.
fn first_result(operation: &'static str, body: &Value) -> Result<Value, GatewayError> {
    let entry = body
        .get("subscriptions")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .cloned()
        .ok_or_else(|| GatewayError::InvalidResponse {
            operation,
            message: "missing subscriptions result".to_string(),
        })?;

    match entry.get("result").and_then(Value::as_str) {
        Some("success") => Ok(entry),
        other => Err(GatewayError::InvalidResponse {
            operation,
            message: format!(
                "result {:?}: {}",
                other,
                entry.get("error").map(Value::to_string).unwrap_or_default()
            ),
        }),
    }
}

fn subscription_ref(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) => Some(id.clone()),
        Value::Object(obj) => obj.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn string_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn decode_event(event: &Value) -> GatewayEvent {
    let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
    let data = event.get("data").cloned().unwrap_or(Value::Null);

    match kind {
        "order.completed" => {
            let subscription_id = data
                .get("items")
                .and_then(Value::as_array)
                .and_then(|items| items.iter().find_map(|item| subscription_ref(item.get("subscription"))));
            GatewayEvent::PaymentCompleted {
                transaction_id: string_field(&data, "id"),
                order_reference: data
                    .get("tags")
                    .and_then(|tags| tags.get("order_reference"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                subscription_id,
                period_end: None,
            }
        }
        "subscription.charge.completed" => match subscription_ref(data.get("subscription")) {
            Some(subscription_id) => GatewayEvent::SubscriptionRenewed {
                subscription_id,
                transaction_id: data.get("order").and_then(|o| string_field(o, "id")),
                period_end: data
                    .get("subscription")
                    .and_then(|s| s.get("nextChargeDate"))
                    .or_else(|| data.get("nextChargeDate"))
                    .and_then(parse_timestamp),
            },
            None => GatewayEvent::Ignored { kind: kind.to_string() },
        },
        // `subscription.canceled` only records the request; billing stops on deactivation.
        "subscription.deactivated" => match string_field(&data, "id").or_else(|| subscription_ref(data.get("subscription"))) {
            Some(subscription_id) => GatewayEvent::SubscriptionCanceled { subscription_id },
            None => GatewayEvent::Ignored { kind: kind.to_string() },
        },
        other => GatewayEvent::Ignored { kind: other.to_string() },
    }
}

#[async_trait]
impl GatewayAdapter for FastSpringAdapter {
    fn kind(&self) -> GatewayKind {
        GatewayKind::FastSpring
    }

    fn signature_header(&self) -> Option<&'static str> {
        Some(SIGNATURE_HEADER)
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutHandle, GatewayError> {
        let body = json!({
            "contact": { "email": request.email },
            "items": [{ "product": request.product_id, "quantity": 1 }],
            "tags": {
                "order_reference": request.reference,
                "user_id": request.user_id,
            },
        });

        let request = self.authed(self.http.post(self.url("/sessions"))).json(&body);
        let response = send_json("create_checkout", request).await?;
        let session_id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidResponse {
                operation: "create_checkout",
                message: "session id missing".to_string(),
            })?;

        Ok(CheckoutHandle::Transaction {
            transaction_id: session_id.to_string(),
            checkout_url: self
                .config
                .checkout_url
                .as_ref()
                .map(|base| format!("{}/session/{}", base.trim_end_matches('/'), session_id)),
        })
    }

    async fn upgrade(&self, request: &PlanChangeRequest) -> Option<PlanChange> {
        self.change_product("upgrade", &request.subscription_id, &request.product_id)
            .await
    }

    async fn downgrade(&self, request: &PlanChangeRequest) -> Option<PlanChange> {
        self.change_product("downgrade", &request.subscription_id, &request.product_id)
            .await
    }

    async fn cancel(&self, subscription_id: &str, period: BillingPeriod) -> Option<CancellationReceipt> {
        let url = self.url(&format!("/subscriptions/{}", subscription_id));
        let request = self
            .authed(self.http.delete(url))
            .query(&[("billingPeriod", period.code().to_string())]);

        match send_json("cancel", request).await.and_then(|v| first_result("cancel", &v)) {
            Ok(_) => Some(CancellationReceipt {
                subscription_id: subscription_id.to_string(),
                immediate: period == BillingPeriod::Immediate,
                effective_at: None,
            }),
            Err(e) => {
                log_call_failure(GatewayKind::FastSpring, "cancel", subscription_id, &e);
                None
            }
        }
    }

    fn verify_webhook(&self, raw: &[u8], signature: &str) -> bool {
        let provided = match BASE64.decode(signature.trim()) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let expected = hmac_sha256(self.config.webhook_secret.expose_secret().as_bytes(), raw);
        constant_time_eq(&expected, &provided)
    }

    fn parse_webhook(&self, raw: &[u8]) -> Result<Vec<GatewayEvent>, GatewayError> {
        let payload: Value = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::InvalidPayload(e.to_string()))?;
        let events = payload
            .get("events")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::InvalidPayload("missing events array".to_string()))?;

        Ok(events.iter().map(decode_event).collect())
    }
}
