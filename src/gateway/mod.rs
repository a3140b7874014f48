//! Payment gateway adapters.
//!
//! Each supported gateway is wrapped behind [`GatewayAdapter`]. Adapters know
//! *how* to talk to their vendor; whether a transition is immediate, awaits a
//! webhook or is scheduled is decided by the orchestrator's policy table.
//!
//! Expected remote failures on plan changes and cancellations are logged by
//! the adapter and returned as `None`; callers never see transport errors.

mod fastspring;
mod paddle;
mod payproglobal;
mod registry;
pub mod signature;

pub use fastspring::{FastSpringAdapter, FastSpringConfig};
pub use paddle::{PaddleAdapter, PaddleConfig};
pub use payproglobal::{PayProGlobalAdapter, PayProGlobalConfig};
pub use registry::{GatewayRegistry, ProductBindings};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a supported gateway.
///
/// Parsed once when configuration is loaded; never derived from free text
/// at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    FastSpring,
    Paddle,
    PayProGlobal,
}

impl GatewayKind {
    pub const ALL: [GatewayKind; 3] = [Self::FastSpring, Self::Paddle, Self::PayProGlobal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastSpring => "fastspring",
            Self::Paddle => "paddle",
            Self::PayProGlobal => "payproglobal",
        }
    }
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "fastspring" => Ok(Self::FastSpring),
            "paddle" => Ok(Self::Paddle),
            "payproglobal" => Ok(Self::PayProGlobal),
            _ => Err(GatewayError::UnknownGateway(s.to_string())),
        }
    }
}

/// Gateway-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown gateway '{0}'")]
    UnknownGateway(String),

    #[error("gateway rejected request during {operation}: HTTP {status}: {message}")]
    Rejected {
        operation: &'static str,
        status: u16,
        message: String,
    },

    #[error("gateway unreachable during {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    #[error("unexpected gateway response during {operation}: {message}")]
    InvalidResponse {
        operation: &'static str,
        message: String,
    },

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("gateway misconfigured: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// Network failures, timeouts, 429 and 5xx.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Rejected { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn from_reqwest(operation: &'static str, err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Rejected {
                operation,
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Self::Transport {
                operation,
                message: err.to_string(),
            },
        }
    }
}

/// Which side of the billing period a cancellation should take effect on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Immediate,
    EndOfPeriod,
}

impl BillingPeriod {
    /// Vendor wire code: `1` is end of period, `0` immediate.
    pub fn code(&self) -> u8 {
        match self {
            Self::Immediate => 0,
            Self::EndOfPeriod => 1,
        }
    }
}

/// Everything an adapter needs to open a checkout.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub order_id: Uuid,
    /// Opaque reference echoed back in webhook custom data.
    pub reference: String,
    pub user_id: String,
    pub email: String,
    pub package_id: String,
    pub package_name: String,
    pub product_id: String,
    pub amount: Decimal,
    pub currency: String,
}

/// Everything an adapter needs to change the plan on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanChangeRequest {
    pub order_id: Uuid,
    /// Opaque reference echoed back when the change is paid by checkout.
    pub reference: String,
    pub subscription_id: String,
    pub product_id: String,
}

/// Result of opening a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutHandle {
    /// The gateway assigned a transaction id up front; completion still
    /// arrives by webhook.
    Transaction {
        transaction_id: String,
        checkout_url: Option<String>,
    },
    /// The user must be redirected; completion is learned from the webhook.
    Redirect { checkout_url: String },
}

impl CheckoutHandle {
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            Self::Transaction { transaction_id, .. } => Some(transaction_id),
            Self::Redirect { .. } => None,
        }
    }

    pub fn checkout_url(&self) -> Option<&str> {
        match self {
            Self::Transaction { checkout_url, .. } => checkout_url.as_deref(),
            Self::Redirect { checkout_url } => Some(checkout_url),
        }
    }
}

/// Successful upgrade or downgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanChange {
    pub subscription_id: String,
    pub transaction_id: Option<String>,
    /// Set when the change must be paid through a new checkout.
    pub checkout_url: Option<String>,
    pub next_billing_at: Option<DateTime<Utc>>,
}

/// Successful cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationReceipt {
    pub subscription_id: String,
    pub immediate: bool,
    /// When billing stops, if the gateway reported it.
    pub effective_at: Option<DateTime<Utc>>,
}

/// Gateway notification normalised across vendors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    PaymentCompleted {
        transaction_id: Option<String>,
        order_reference: Option<String>,
        subscription_id: Option<String>,
        period_end: Option<DateTime<Utc>>,
    },
    SubscriptionRenewed {
        subscription_id: String,
        transaction_id: Option<String>,
        period_end: Option<DateTime<Utc>>,
    },
    SubscriptionCanceled {
        subscription_id: String,
    },
    Ignored {
        kind: String,
    },
}

impl GatewayEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::PaymentCompleted { .. } => "payment_completed",
            Self::SubscriptionRenewed { .. } => "subscription_renewed",
            Self::SubscriptionCanceled { .. } => "subscription_canceled",
            Self::Ignored { kind } => kind,
        }
    }
}

/// Uniform capability set over one external billing API.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn kind(&self) -> GatewayKind;

    /// Request header carrying the webhook signature, if the vendor sends one.
    /// Form-signed vendors embed the signature in the body instead.
    fn signature_header(&self) -> Option<&'static str>;

    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutHandle, GatewayError>;

    /// Immediate prorated plan change. `None` on failure.
    async fn upgrade(&self, request: &PlanChangeRequest) -> Option<PlanChange>;

    /// `None` on failure. Variants that cannot downgrade synchronously
    /// return a no-op success without contacting the vendor.
    async fn downgrade(&self, request: &PlanChangeRequest) -> Option<PlanChange>;

    /// `None` on failure.
    async fn cancel(&self, subscription_id: &str, period: BillingPeriod) -> Option<CancellationReceipt>;

    /// Constant-time signature check over the raw body. Never panics.
    fn verify_webhook(&self, raw: &[u8], signature: &str) -> bool;

    /// Decode a verified payload into zero or more events, in delivery order.
    fn parse_webhook(&self, raw: &[u8]) -> Result<Vec<GatewayEvent>, GatewayError>;
}

pub(crate) fn http_client(timeout: Duration, user_agent: &str) -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
        .map_err(|e| GatewayError::Configuration(format!("failed to build HTTP client: {}", e)))
}

/// Send a request and decode a JSON body, mapping non-2xx to `Rejected`.
pub(crate) async fn send_json(
    operation: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value, GatewayError> {
    let response = request
        .send()
        .await
        .map_err(|e| GatewayError::from_reqwest(operation, e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| GatewayError::from_reqwest(operation, e))?;

    if !status.is_success() {
        return Err(GatewayError::Rejected {
            operation,
            status: status.as_u16(),
            message: body.chars().take(512).collect(),
        });
    }

    if body.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }

    serde_json::from_str(&body).map_err(|e| GatewayError::InvalidResponse {
        operation,
        message: e.to_string(),
    })
}

/// Log a swallowed plan-change or cancellation failure.
pub(crate) fn log_call_failure(
    gateway: GatewayKind,
    operation: &'static str,
    subscription_id: &str,
    error: &GatewayError,
) {
    tracing::error!(
        target: "tollway::gateway",
        gateway = %gateway,
        operation = operation,
        subscription_id = %subscription_id,
        transient = error.is_transient(),
        error = %error,
        "Gateway call failed"
    );
}

/// Parse either epoch milliseconds or an RFC 3339 string.
pub(crate) fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc())
            }),
        _ => None,
    }
}
