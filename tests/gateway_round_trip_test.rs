//! Checkout and upgrade through the real gateway adapters against a local
//! HTTP mock, completed by signed webhooks.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use httpmock::prelude::*;
use httpmock::Method::PATCH;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde_json::json;
use sha1::{Digest, Sha1};
use url::Url;
use uuid::Uuid;

use tollway::domain::OrderStatus;
use tollway::gateway::signature::{canonical_json, hmac_sha256, php_serialize};
use tollway::gateway::{
    FastSpringAdapter, FastSpringConfig, GatewayKind, PaddleAdapter, PaddleConfig, PayProGlobalAdapter,
    PayProGlobalConfig,
};
use tollway::orchestrator::{RequestContext, TransitionOutcome};
use tollway::testing::TestHarness;
use tollway::WebhookOutcome;

async fn start_checkout(harness: &TestHarness, gateway: GatewayKind) -> (Uuid, TransitionOutcome, String) {
    harness.register("user_1").await.unwrap();
    let outcome = harness
        .orchestrator
        .checkout("user_1", "starter", Some(gateway), &RequestContext::new())
        .await
        .unwrap();
    let TransitionOutcome::CheckoutStarted { order_id, .. } = &outcome else {
        panic!("expected checkout to start, got {:?}", outcome);
    };
    let order_id = *order_id;
    let reference = order_reference(harness, order_id).await;
    (order_id, outcome, reference)
}

async fn order_reference(harness: &TestHarness, order_id: Uuid) -> String {
    harness
        .ledger("user_1")
        .await
        .unwrap()
        .order(order_id)
        .unwrap()
        .reference()
        .to_string()
}

async fn order_status(harness: &TestHarness, order_id: Uuid) -> OrderStatus {
    harness.ledger("user_1").await.unwrap().order(order_id).unwrap().status
}

async fn active_package(harness: &TestHarness) -> String {
    harness
        .ledger("user_1")
        .await
        .unwrap()
        .active_license()
        .unwrap()
        .package_id
        .clone()
}

fn query_value(url: &str, key: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

// =============================================================================
// FastSpring
// =============================================================================

fn fastspring_signature(body: &[u8]) -> String {
    BASE64.encode(hmac_sha256(b"whsec", body))
}

#[tokio::test]
async fn test_fastspring_checkout_and_upgrade() {
    let server = MockServer::start_async().await;
    let sessions = server
        .mock_async(|when, then| {
            when.method(POST).path("/sessions").body_contains("fastspring-starter");
            then.status(200).json_body(json!({ "id": "SESSION-1" }));
        })
        .await;
    let plan_change = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/subscriptions")
                .body_contains("SUB-1")
                .body_contains("fastspring-pro");
            then.status(200).json_body(json!({
                "subscriptions": [{ "subscription": "SUB-1", "action": "subscription.update", "result": "success" }]
            }));
        })
        .await;

    let adapter = FastSpringAdapter::new(
        FastSpringConfig::new("api-user", "api-pass", "whsec").with_api_url(server.base_url()),
    )
    .unwrap();
    let harness = TestHarness::builder().with_adapter(Arc::new(adapter)).build();

    let (order_id, outcome, reference) = start_checkout(&harness, GatewayKind::FastSpring).await;
    sessions.assert_async().await;
    assert!(matches!(
        outcome,
        TransitionOutcome::CheckoutStarted { transaction_id: Some(ref t), .. } if t == "SESSION-1"
    ));

    // The completed order carries its own id; only the tag links it back.
    let body = serde_json::to_vec(&json!({
        "events": [{
            "id": "evt-1",
            "type": "order.completed",
            "data": {
                "id": "ORD-100",
                "tags": { "order_reference": reference },
                "items": [{ "product": "fastspring-starter", "subscription": "SUB-1" }]
            }
        }]
    }))
    .unwrap();
    let reconciler = harness.reconciler();
    let handled = reconciler
        .handle(GatewayKind::FastSpring, &body, &fastspring_signature(&body))
        .await
        .unwrap();
    assert_eq!(handled, WebhookOutcome::Processed);
    assert_eq!(order_status(&harness, order_id).await, OrderStatus::Completed);
    assert_eq!(active_package(&harness).await, "starter");

    let outcome = harness.orchestrator.upgrade("user_1", "pro").await.unwrap();
    let TransitionOutcome::Activated { order_id, .. } = outcome else {
        panic!("expected activation, got {:?}", outcome);
    };
    plan_change.assert_async().await;
    assert_eq!(order_status(&harness, order_id).await, OrderStatus::Completed);
    assert_eq!(active_package(&harness).await, "pro");

    let redelivered = reconciler
        .handle(GatewayKind::FastSpring, &body, &fastspring_signature(&body))
        .await
        .unwrap();
    assert_eq!(redelivered, WebhookOutcome::Duplicate);
}

// =============================================================================
// Paddle
// =============================================================================

fn paddle_keys() -> (RsaPrivateKey, String) {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let pem = RsaPublicKey::from(&private)
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    (private, pem)
}

fn paddle_alert(private: &RsaPrivateKey, fields: &[(&str, &str)]) -> Vec<u8> {
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
    form.append_pair("p_signature", &BASE64.encode(signature));
    form.finish().into_bytes()
}

#[tokio::test]
async fn test_paddle_checkout_and_upgrade() {
    let server = MockServer::start_async().await;
    let transactions = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/transactions")
                .body_contains(r#""passthrough":"#)
                .body_contains("paddle-starter");
            then.status(200).json_body(json!({
                "data": { "id": "txn_01", "checkout": { "url": "https://pay.example.com/txn_01" } }
            }));
        })
        .await;
    let price_change = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path("/subscriptions/sub_01")
                .body_contains("paddle-pro");
            then.status(200).json_body(json!({
                "data": { "id": "sub_01", "next_billed_at": "2030-02-01T00:00:00Z" }
            }));
        })
        .await;

    let (private, pem) = paddle_keys();
    let adapter = PaddleAdapter::new(PaddleConfig::new("key", pem).with_api_url(server.base_url())).unwrap();
    let harness = TestHarness::builder().with_adapter(Arc::new(adapter)).build();

    let (order_id, _, reference) = start_checkout(&harness, GatewayKind::Paddle).await;
    transactions.assert_async().await;

    // The alert's checkout id differs from the transaction id; passthrough matches.
    let body = paddle_alert(
        &private,
        &[
            ("alert_name", "subscription_payment_succeeded"),
            ("checkout_id", "chk_other"),
            ("initial_payment", "1"),
            ("next_bill_date", "2030-01-31"),
            ("passthrough", reference.as_str()),
            ("subscription_id", "sub_01"),
        ],
    );
    let handled = harness
        .reconciler()
        .handle(GatewayKind::Paddle, &body, "")
        .await
        .unwrap();
    assert_eq!(handled, WebhookOutcome::Processed);
    assert_eq!(order_status(&harness, order_id).await, OrderStatus::Completed);
    assert_eq!(
        harness.ledger("user_1").await.unwrap().subscription_id(),
        Some("sub_01")
    );

    let outcome = harness.orchestrator.upgrade("user_1", "pro").await.unwrap();
    let TransitionOutcome::Activated { order_id, .. } = outcome else {
        panic!("expected activation, got {:?}", outcome);
    };
    price_change.assert_async().await;
    assert_eq!(order_status(&harness, order_id).await, OrderStatus::Completed);
    assert_eq!(active_package(&harness).await, "pro");
}

// =============================================================================
// PayProGlobal
// =============================================================================

fn payproglobal_adapter(api_url: &str) -> PayProGlobalAdapter {
    PayProGlobalAdapter::new(
        PayProGlobalConfig::new("vendor-1", "api-secret", "ipn-secret")
            .with_api_url(api_url)
            .with_checkout_url("https://checkout.example.com/pay"),
    )
    .unwrap()
}

fn payproglobal_ipn(payload: serde_json::Value) -> (Vec<u8>, String) {
    let signature = hex::encode(hmac_sha256(b"ipn-secret", canonical_json(&payload).as_bytes()));
    (serde_json::to_vec(&payload).unwrap(), signature)
}

#[tokio::test]
async fn test_payproglobal_checkout_and_upgrade() {
    let harness = TestHarness::builder()
        .with_adapter(Arc::new(payproglobal_adapter("http://localhost")))
        .build();

    let (order_id, outcome, reference) = start_checkout(&harness, GatewayKind::PayProGlobal).await;
    let TransitionOutcome::CheckoutStarted { checkout_url: Some(url), transaction_id: None, .. } = outcome else {
        panic!("expected a redirect checkout, got {:?}", outcome);
    };
    // The buyer's browser carries the reference to the hosted page and back.
    let echoed = query_value(&url, "x-order-reference").unwrap();
    assert_eq!(echoed, reference);

    let (body, signature) = payproglobal_ipn(json!({
        "ipnTypeName": "OrderCharged",
        "orderId": 9001,
        "subscriptionId": 678,
        "customFields": format!("x-order-reference={}", echoed),
    }));
    let reconciler = harness.reconciler();
    let handled = reconciler
        .handle(GatewayKind::PayProGlobal, &body, &signature)
        .await
        .unwrap();
    assert_eq!(handled, WebhookOutcome::Processed);
    assert_eq!(order_status(&harness, order_id).await, OrderStatus::Completed);

    let outcome = harness.orchestrator.upgrade("user_1", "pro").await.unwrap();
    let TransitionOutcome::AwaitingPayment { order_id, checkout_url: Some(url) } = outcome else {
        panic!("expected a payment link, got {:?}", outcome);
    };
    assert_eq!(order_status(&harness, order_id).await, OrderStatus::Pending);
    let echoed = query_value(&url, "x-order-reference").unwrap();
    assert_eq!(echoed, order_reference(&harness, order_id).await);
    assert_eq!(query_value(&url, "x-upgrade-subscription").as_deref(), Some("678"));

    let (body, signature) = payproglobal_ipn(json!({
        "ipnTypeName": "OrderCharged",
        "orderId": 9002,
        "subscriptionId": 678,
        "customFields": format!("x-order-reference={}", echoed),
    }));
    let handled = reconciler
        .handle(GatewayKind::PayProGlobal, &body, &signature)
        .await
        .unwrap();
    assert_eq!(handled, WebhookOutcome::Processed);
    assert_eq!(order_status(&harness, order_id).await, OrderStatus::Completed);
    assert_eq!(active_package(&harness).await, "pro");
}

#[tokio::test]
async fn test_payproglobal_free_downgrade_terminates_subscription() {
    let server = MockServer::start_async().await;
    let terminate = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/Subscriptions/Terminate")
                .body_contains(r#""subscriptionId":"ppg_1""#);
            then.status(200).json_body(json!({ "isSuccess": true }));
        })
        .await;

    let harness = TestHarness::builder()
        .with_adapter(Arc::new(payproglobal_adapter(&server.base_url())))
        .build();
    harness
        .subscribe(
            "user_1",
            "pro",
            GatewayKind::PayProGlobal,
            "ppg_1",
            Some(chrono::Utc::now() + chrono::Duration::days(10)),
        )
        .await
        .unwrap();

    let outcome = harness.orchestrator.downgrade("user_1", "free").await.unwrap();
    let TransitionOutcome::DowngradeScheduled { order_id, .. } = outcome else {
        panic!("expected a scheduled downgrade, got {:?}", outcome);
    };
    terminate.assert_async().await;

    let ledger = harness.ledger("user_1").await.unwrap();
    let order = ledger.order(order_id).unwrap();
    assert_eq!(order.status, OrderStatus::ScheduledDowngrade);
    assert!(order.metadata.termination_date.is_some());
    assert_eq!(ledger.active_license().unwrap().package_id, "pro");
}
