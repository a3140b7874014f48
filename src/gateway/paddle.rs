//! Paddle-style gateway: bearer-token JSON API with immediate proration,
//! form-encoded webhook alerts signed with RSA over PHP-serialized fields.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use super::signature::{php_serialize, verify_rsa_sha1};
use super::{
    http_client, log_call_failure, parse_timestamp, send_json, BillingPeriod, CancellationReceipt,
    CheckoutHandle, CheckoutRequest, GatewayAdapter, GatewayError, GatewayEvent, GatewayKind,
    PlanChange, PlanChangeRequest,
};

const SIGNATURE_FIELD: &str = "p_signature";

#[derive(Debug, Clone)]
pub struct PaddleConfig {
    pub api_url: String,
    pub api_key: SecretString,
    /// PEM-encoded public key used to verify webhook alerts.
    pub public_key: String,
    pub timeout: Duration,
}

impl PaddleConfig {
    pub fn new(api_key: impl Into<SecretString>, public_key: impl Into<String>) -> Self {
        Self {
            api_url: "https://api.paddle.com".to_string(),
            api_key: api_key.into(),
            public_key: public_key.into(),
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct PaddleAdapter {
    config: PaddleConfig,
    http: reqwest::Client,
}

impl PaddleAdapter {
    pub fn new(config: PaddleConfig) -> Result<Self, GatewayError> {
        let http = http_client(config.timeout, "tollway-paddle")?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.bearer_auth(self.config.api_key.expose_secret())
    }

    async fn change_price(
        &self,
        operation: &'static str,
        subscription_id: &str,
        price_id: &str,
    ) -> Option<PlanChange> {
        let body = json!({
            "items": [{ "price_id": price_id, "quantity": 1 }],
            "proration_billing_mode": "prorated_immediately",
        });
        let url = self.url(&format!("/subscriptions/{}", subscription_id));
        let request = self.authed(self.http.patch(url)).json(&body);

        match send_json(operation, request).await {
            Ok(response) => {
                let data = response.get("data").cloned().unwrap_or(Value::Null);
                tracing::info!(
                    target: "tollway::gateway::paddle",
                    gateway = "paddle",
                    operation = operation,
                    subscription_id = %subscription_id,
                    price_id = %price_id,
                    "Subscription price changed"
                );
                Some(PlanChange {
                    subscription_id: data
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or(subscription_id)
                        .to_string(),
                    transaction_id: None,
                    checkout_url: None,
                    next_billing_at: data.get("next_billed_at").and_then(parse_timestamp),
                })
            }
            Err(e) => {
                log_call_failure(GatewayKind::Paddle, operation, subscription_id, &e);
                None
            }
        }
    }
}

/// Decode a form-encoded alert into sorted fields.
fn form_fields(raw: &[u8]) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(raw).into_owned().collect()
}

fn decode_alert(fields: &BTreeMap<String, String>) -> GatewayEvent {
    let field = |key: &str| fields.get(key).filter(|v| !v.is_empty()).cloned();
    let alert = fields.get("alert_name").map(String::as_str).unwrap_or_default();

    match alert {
        "payment_succeeded" => GatewayEvent::PaymentCompleted {
            transaction_id: field("checkout_id").or_else(|| field("order_id")),
            order_reference: field("passthrough"),
            subscription_id: None,
            period_end: None,
        },
        "subscription_payment_succeeded" => {
            let period_end = field("next_bill_date").and_then(|d| parse_timestamp(&Value::String(d)));
            let initial = fields.get("initial_payment").map(String::as_str) == Some("1");
            match (initial, field("subscription_id")) {
                (true, subscription_id) => GatewayEvent::PaymentCompleted {
                    transaction_id: field("checkout_id").or_else(|| field("order_id")),
                    order_reference: field("passthrough"),
                    subscription_id,
                    period_end,
                },
                (false, Some(subscription_id)) => GatewayEvent::SubscriptionRenewed {
                    subscription_id,
                    transaction_id: field("order_id"),
                    period_end,
                },
                (false, None) => GatewayEvent::Ignored { kind: alert.to_string() },
            }
        }
        "subscription_cancelled" => {
            let effective = field("cancellation_effective_date")
                .and_then(|d| parse_timestamp(&Value::String(d)));
            match (field("subscription_id"), effective) {
                // Billing continues until the effective date; the sweep finishes it.
                (Some(_), Some(at)) if at > Utc::now() => GatewayEvent::Ignored {
                    kind: "subscription_cancelled_pending".to_string(),
                },
                (Some(subscription_id), _) => GatewayEvent::SubscriptionCanceled { subscription_id },
                (None, _) => GatewayEvent::Ignored { kind: alert.to_string() },
            }
        }
        other => GatewayEvent::Ignored { kind: other.to_string() },
    }
}

#[async_trait]
impl GatewayAdapter for PaddleAdapter {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Paddle
    }

    fn signature_header(&self) -> Option<&'static str> {
        None
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutHandle, GatewayError> {
        // Alerts echo `passthrough` back verbatim; it carries the order reference.
        let body = json!({
            "items": [{ "price_id": request.product_id, "quantity": 1 }],
            "passthrough": request.reference,
            "custom_data": { "user_id": request.user_id },
            "customer": { "email": request.email },
        });

        let response = send_json(
            "create_checkout",
            self.authed(self.http.post(self.url("/transactions"))).json(&body),
        )
        .await?;

        let data = response.get("data").cloned().unwrap_or(Value::Null);
        let transaction_id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidResponse {
                operation: "create_checkout",
                message: "transaction id missing".to_string(),
            })?;

        Ok(CheckoutHandle::Transaction {
            transaction_id: transaction_id.to_string(),
            checkout_url: data
                .get("checkout")
                .and_then(|c| c.get("url"))
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn upgrade(&self, request: &PlanChangeRequest) -> Option<PlanChange> {
        self.change_price("upgrade", &request.subscription_id, &request.product_id)
            .await
    }

    async fn downgrade(&self, request: &PlanChangeRequest) -> Option<PlanChange> {
        self.change_price("downgrade", &request.subscription_id, &request.product_id)
            .await
    }

    async fn cancel(&self, subscription_id: &str, period: BillingPeriod) -> Option<CancellationReceipt> {
        let effective_from = match period {
            BillingPeriod::EndOfPeriod => "next_billing_period",
            BillingPeriod::Immediate => "immediately",
        };
        let url = self.url(&format!("/subscriptions/{}/cancel", subscription_id));
        let request = self
            .authed(self.http.post(url))
            .json(&json!({ "effective_from": effective_from }));

        match send_json("cancel", request).await {
            Ok(response) => {
                let data = response.get("data").cloned().unwrap_or(Value::Null);
                let effective_at = data
                    .get("scheduled_change")
                    .and_then(|c| c.get("effective_at"))
                    .or_else(|| data.get("canceled_at"))
                    .and_then(parse_timestamp);
                Some(CancellationReceipt {
                    subscription_id: subscription_id.to_string(),
                    immediate: period == BillingPeriod::Immediate,
                    effective_at,
                })
            }
            Err(e) => {
                log_call_failure(GatewayKind::Paddle, "cancel", subscription_id, &e);
                None
            }
        }
    }

    /// The signature travels inside the form body; a non-empty `signature`
    /// argument takes precedence over the embedded field.
    fn verify_webhook(&self, raw: &[u8], signature: &str) -> bool {
        let mut fields = form_fields(raw);
        let embedded = fields.remove(SIGNATURE_FIELD);
        let encoded = if signature.trim().is_empty() {
            match embedded {
                Some(sig) => sig,
                None => return false,
            }
        } else {
            signature.trim().to_string()
        };

        let signature = match BASE64.decode(encoded.as_bytes()) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };

        verify_rsa_sha1(&self.config.public_key, php_serialize(&fields).as_bytes(), &signature)
    }

    fn parse_webhook(&self, raw: &[u8]) -> Result<Vec<GatewayEvent>, GatewayError> {
        let fields = form_fields(raw);
        if !fields.contains_key("alert_name") {
            return Err(GatewayError::InvalidPayload("missing alert_name".to_string()));
        }
        Ok(vec![decode_alert(&fields)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use httpmock::Method::PATCH;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
    use sha1::{Digest, Sha1};

    fn keypair() -> (RsaPrivateKey, String) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (private, pem)
    }

    fn signed_form(private: &RsaPrivateKey, fields: &[(&str, &str)]) -> Vec<u8> {
        let sorted: BTreeMap<String, String> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let digest = Sha1::digest(php_serialize(&sorted).as_bytes());
        let signature = private.sign(Pkcs1v15Sign::new::<Sha1>(), &digest).unwrap();

        let mut form = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in fields {
            form.append_pair(k, v);
        }
        form.append_pair(SIGNATURE_FIELD, &BASE64.encode(signature));
        form.finish().into_bytes()
    }

    fn plan_change(subscription_id: &str, product_id: &str) -> PlanChangeRequest {
        PlanChangeRequest {
            order_id: uuid::Uuid::new_v4(),
            reference: "ref-change".into(),
            subscription_id: subscription_id.into(),
            product_id: product_id.into(),
        }
    }

    #[test]
    fn test_verify_and_parse_signed_alert() {
        let (private, pem) = keypair();
        let adapter = PaddleAdapter::new(PaddleConfig::new("key", pem)).unwrap();

        let body = signed_form(
            &private,
            &[
                ("alert_name", "subscription_payment_succeeded"),
                ("checkout_id", "txn_1"),
                ("initial_payment", "1"),
                ("next_bill_date", "2030-01-31"),
                ("passthrough", "ref-1"),
                ("subscription_id", "SUB-9"),
            ],
        );

        assert!(adapter.verify_webhook(&body, ""));
        let events = adapter.parse_webhook(&body).unwrap();
        assert!(matches!(
            &events[0],
            GatewayEvent::PaymentCompleted { transaction_id: Some(t), order_reference: Some(r), subscription_id: Some(s), period_end: Some(_) }
                if t == "txn_1" && r == "ref-1" && s == "SUB-9"
        ));

        let mut tampered = String::from_utf8(body).unwrap();
        tampered = tampered.replace("SUB-9", "SUB-1");
        assert!(!adapter.verify_webhook(tampered.as_bytes(), ""));
    }

    #[test]
    fn test_unsigned_alert_rejected() {
        let (_, pem) = keypair();
        let adapter = PaddleAdapter::new(PaddleConfig::new("key", pem)).unwrap();
        assert!(!adapter.verify_webhook(b"alert_name=payment_succeeded", ""));
        assert!(!adapter.verify_webhook(b"alert_name=payment_succeeded", "%%%"));
    }

    #[test]
    fn test_decode_renewal_and_cancellation() {
        let fields = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };

        let renewal = decode_alert(&fields(&[
            ("alert_name", "subscription_payment_succeeded"),
            ("initial_payment", "0"),
            ("order_id", "ORD-2"),
            ("subscription_id", "SUB-9"),
        ]));
        assert!(matches!(renewal, GatewayEvent::SubscriptionRenewed { ref subscription_id, .. } if subscription_id == "SUB-9"));

        let ended = decode_alert(&fields(&[
            ("alert_name", "subscription_cancelled"),
            ("subscription_id", "SUB-9"),
            ("cancellation_effective_date", "2001-01-01"),
        ]));
        assert_eq!(ended, GatewayEvent::SubscriptionCanceled { subscription_id: "SUB-9".into() });

        let pending = decode_alert(&fields(&[
            ("alert_name", "subscription_cancelled"),
            ("subscription_id", "SUB-9"),
            ("cancellation_effective_date", "2999-01-01"),
        ]));
        assert!(matches!(pending, GatewayEvent::Ignored { .. }));
    }

    #[tokio::test]
    async fn test_checkout_reference_comes_back_in_alert() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/transactions")
                    .body_contains(r#""passthrough":"ref-77""#);
                then.status(200).json_body(json!({
                    "data": { "id": "txn_01", "checkout": { "url": "https://pay.example.com/txn_01" } }
                }));
            })
            .await;

        let (private, pem) = keypair();
        let adapter = PaddleAdapter::new(PaddleConfig::new("key", pem).with_api_url(server.base_url())).unwrap();
        let handle = adapter
            .create_checkout(&CheckoutRequest {
                order_id: uuid::Uuid::new_v4(),
                reference: "ref-77".into(),
                user_id: "user_1".into(),
                email: "user@example.com".into(),
                package_id: "pro".into(),
                package_name: "Pro".into(),
                product_id: "pri_pro".into(),
                amount: rust_decimal::Decimal::new(2900, 2),
                currency: "USD".into(),
            })
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(handle.transaction_id(), Some("txn_01"));

        // The alert names a checkout id that differs from the transaction id.
        let body = signed_form(
            &private,
            &[
                ("alert_name", "payment_succeeded"),
                ("checkout_id", "chk_other"),
                ("passthrough", "ref-77"),
            ],
        );
        assert!(adapter.verify_webhook(&body, ""));
        let events = adapter.parse_webhook(&body).unwrap();
        assert!(matches!(
            &events[0],
            GatewayEvent::PaymentCompleted { order_reference: Some(r), .. } if r == "ref-77"
        ));
    }

    #[tokio::test]
    async fn test_upgrade_prorates_immediately() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PATCH)
                    .path("/subscriptions/SUB-9")
                    .header("authorization", "Bearer key")
                    .body_contains("prorated_immediately");
                then.status(200).json_body(json!({
                    "data": { "id": "SUB-9", "next_billed_at": "2030-02-01T00:00:00Z" }
                }));
            })
            .await;

        let adapter = PaddleAdapter::new(PaddleConfig::new("key", "").with_api_url(server.base_url())).unwrap();
        let change = adapter.upgrade(&plan_change("SUB-9", "pri_pro")).await.unwrap();

        mock.assert_async().await;
        assert_eq!(change.subscription_id, "SUB-9");
        assert!(change.next_billing_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_at_next_billing_period() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/subscriptions/SUB-9/cancel")
                    .body_contains("next_billing_period");
                then.status(200).json_body(json!({
                    "data": { "id": "SUB-9", "scheduled_change": { "action": "cancel", "effective_at": "2030-02-01T00:00:00Z" } }
                }));
            })
            .await;

        let adapter = PaddleAdapter::new(PaddleConfig::new("key", "").with_api_url(server.base_url())).unwrap();
        let receipt = adapter.cancel("SUB-9", BillingPeriod::EndOfPeriod).await.unwrap();

        mock.assert_async().await;
        assert!(!receipt.immediate);
        assert!(receipt.effective_at.is_some());
    }

    #[tokio::test]
    async fn test_rejected_change_returns_none() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PATCH).path("/subscriptions/SUB-9");
                then.status(400).json_body(json!({ "error": { "code": "subscription_locked" } }));
            })
            .await;

        let adapter = PaddleAdapter::new(PaddleConfig::new("key", "").with_api_url(server.base_url())).unwrap();
        assert!(adapter
            .downgrade(&plan_change("SUB-9", "pri_starter"))
            .await
            .is_none());
    }
}
