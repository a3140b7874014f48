use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::gateway::{
    BillingPeriod, CancellationReceipt, CheckoutHandle, CheckoutRequest, GatewayAdapter,
    GatewayError, GatewayEvent, GatewayKind, PlanChange, PlanChangeRequest,
};

/// Signature accepted by [`MockGateway::verify_webhook`].
pub const MOCK_WEBHOOK_SIGNATURE: &str = "mock-signature";

/// Header the mock reads its signature from.
pub const MOCK_SIGNATURE_HEADER: &str = "X-Mock-Signature";

/// Scriptable stand-in for a vendor adapter.
///
/// Behaves like the gateway it impersonates: PayProGlobal checkouts are
/// redirects and its upgrades hand back a checkout URL, the others assign
/// transaction ids up front. Webhook bodies are a JSON array of
/// [`GatewayEvent`] values.
pub struct MockGateway {
    kind: GatewayKind,
    state: Mutex<MockGatewayState>,
}

#[derive(Default)]
struct MockGatewayState {
    calls: Vec<GatewayCall>,
    checkout_error: Option<GatewayError>,
    fail_plan_changes: bool,
    fail_cancellation: bool,
    next_billing_at: Option<DateTime<Utc>>,
    cancellation_effective_at: Option<DateTime<Utc>>,
    sequence: u32,
}

/// One recorded adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
    pub operation: &'static str,
    /// Order reference for checkouts, subscription id otherwise.
    pub target: String,
    pub product_id: Option<String>,
}

impl MockGateway {
    pub fn new(kind: GatewayKind) -> Self {
        Self {
            kind,
            state: Mutex::new(MockGatewayState::default()),
        }
    }

    /// Make every checkout fail with `error`.
    #[must_use]
    pub fn with_checkout_error(self, error: GatewayError) -> Self {
        self.state().checkout_error = Some(error);
        self
    }

    #[must_use]
    pub fn with_next_billing_at(self, at: DateTime<Utc>) -> Self {
        self.state().next_billing_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_cancellation_effective_at(self, at: DateTime<Utc>) -> Self {
        self.state().cancellation_effective_at = Some(at);
        self
    }

    /// Upgrades and downgrades return `None` from now on.
    pub fn fail_plan_changes(&self, fail: bool) {
        self.state().fail_plan_changes = fail;
    }

    pub fn fail_cancellation(&self, fail: bool) {
        self.state().fail_cancellation = fail;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockGatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, operation: &'static str, target: &str, product_id: Option<&str>) -> u32 {
        let mut state = self.state();
        state.sequence += 1;
        state.calls.push(GatewayCall {
            operation,
            target: target.to_string(),
            product_id: product_id.map(str::to_string),
        });
        state.sequence
    }
}

#[async_trait]
impl GatewayAdapter for MockGateway {
    fn kind(&self) -> GatewayKind {
        self.kind
    }

    fn signature_header(&self) -> Option<&'static str> {
        Some(MOCK_SIGNATURE_HEADER)
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutHandle, GatewayError> {
        let seq = self.record("create_checkout", &request.reference, Some(&request.product_id));
        if let Some(error) = self.state().checkout_error.clone() {
            return Err(error);
        }

        let checkout_url = format!("https://checkout.mock/{}/{}", self.kind, request.reference);
        Ok(match self.kind {
            GatewayKind::PayProGlobal => CheckoutHandle::Redirect { checkout_url },
            _ => CheckoutHandle::Transaction {
                transaction_id: format!("{}_txn_{}", self.kind, seq),
                checkout_url: Some(checkout_url),
            },
        })
    }

    async fn upgrade(&self, request: &PlanChangeRequest) -> Option<PlanChange> {
        let subscription_id = request.subscription_id.as_str();
        let product_id = request.product_id.as_str();
        let seq = self.record("upgrade", subscription_id, Some(product_id));
        let state = self.state();
        if state.fail_plan_changes {
            return None;
        }

        Some(match self.kind {
            GatewayKind::PayProGlobal => PlanChange {
                subscription_id: subscription_id.to_string(),
                checkout_url: Some(format!(
                    "https://checkout.mock/upgrade/{}/{}",
                    product_id, request.reference
                )),
                ..PlanChange::default()
            },
            _ => PlanChange {
                subscription_id: subscription_id.to_string(),
                transaction_id: Some(format!("{}_chg_{}", self.kind, seq)),
                checkout_url: None,
                next_billing_at: state.next_billing_at,
            },
        })
    }

    async fn downgrade(&self, request: &PlanChangeRequest) -> Option<PlanChange> {
        let subscription_id = request.subscription_id.as_str();
        let product_id = request.product_id.as_str();
        let seq = self.record("downgrade", subscription_id, Some(product_id));
        let state = self.state();
        if state.fail_plan_changes {
            return None;
        }

        Some(match self.kind {
            GatewayKind::PayProGlobal => PlanChange {
                subscription_id: subscription_id.to_string(),
                ..PlanChange::default()
            },
            _ => PlanChange {
                subscription_id: subscription_id.to_string(),
                transaction_id: Some(format!("{}_chg_{}", self.kind, seq)),
                checkout_url: None,
                next_billing_at: state.next_billing_at,
            },
        })
    }

    async fn cancel(&self, subscription_id: &str, period: BillingPeriod) -> Option<CancellationReceipt> {
        self.record("cancel", subscription_id, None);
        let state = self.state();
        if state.fail_cancellation {
            return None;
        }

        Some(CancellationReceipt {
            subscription_id: subscription_id.to_string(),
            immediate: period == BillingPeriod::Immediate,
            effective_at: state.cancellation_effective_at,
        })
    }

    fn verify_webhook(&self, _raw: &[u8], signature: &str) -> bool {
        signature == MOCK_WEBHOOK_SIGNATURE
    }

    fn parse_webhook(&self, raw: &[u8]) -> Result<Vec<GatewayEvent>, GatewayError> {
        serde_json::from_slice(raw).map_err(|e| GatewayError::InvalidPayload(e.to_string()))
    }
}

/// Serialize events into a body [`MockGateway`] accepts.
pub fn webhook_body(events: &[GatewayEvent]) -> Vec<u8> {
    serde_json::to_vec(events).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn request() -> CheckoutRequest {
        CheckoutRequest {
            order_id: Uuid::new_v4(),
            reference: "ref-1".into(),
            user_id: "user_1".into(),
            email: "user@example.com".into(),
            package_id: "pro".into(),
            package_name: "Pro".into(),
            product_id: "prod-pro".into(),
            amount: Decimal::new(2900, 2),
            currency: "USD".into(),
        }
    }

    #[tokio::test]
    async fn test_checkout_shape_follows_gateway() {
        let paddle = MockGateway::new(GatewayKind::Paddle);
        let handle = paddle.create_checkout(&request()).await.unwrap();
        assert_eq!(handle.transaction_id(), Some("paddle_txn_1"));

        let paypro = MockGateway::new(GatewayKind::PayProGlobal);
        let handle = paypro.create_checkout(&request()).await.unwrap();
        assert!(handle.transaction_id().is_none());
        assert_eq!(
            handle.checkout_url(),
            Some("https://checkout.mock/payproglobal/ref-1")
        );
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let gateway = MockGateway::new(GatewayKind::FastSpring);
        gateway.fail_plan_changes(true);
        gateway.fail_cancellation(true);

        let request = PlanChangeRequest {
            order_id: Uuid::new_v4(),
            reference: "ref-2".into(),
            subscription_id: "S1".into(),
            product_id: "prod".into(),
        };
        assert!(gateway.upgrade(&request).await.is_none());
        assert!(gateway.cancel("S1", BillingPeriod::EndOfPeriod).await.is_none());
        assert_eq!(gateway.call_count("upgrade"), 1);
        assert_eq!(gateway.call_count("cancel"), 1);
    }

    #[test]
    fn test_webhook_round_trip() {
        let gateway = MockGateway::new(GatewayKind::Paddle);
        let events = vec![GatewayEvent::SubscriptionCanceled {
            subscription_id: "S1".into(),
        }];
        let body = webhook_body(&events);

        assert!(gateway.verify_webhook(&body, MOCK_WEBHOOK_SIGNATURE));
        assert!(!gateway.verify_webhook(&body, "forged"));
        assert_eq!(gateway.parse_webhook(&body).unwrap(), events);
        assert!(matches!(
            gateway.parse_webhook(b"not json"),
            Err(GatewayError::InvalidPayload(_))
        ));
    }
}
