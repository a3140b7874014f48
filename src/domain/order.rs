use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::package::Package;
use crate::gateway::GatewayKind;

/// Order lifecycle state.
///
/// `pending` moves to `completed` or `failed`; scheduled downgrades and
/// cancellations park in their own state until a webhook or the sweep
/// completes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
    ScheduledDowngrade,
    CancellationScheduled,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::ScheduledDowngrade => "scheduled_downgrade",
            Self::CancellationScheduled => "cancellation_scheduled",
            Self::Canceled => "canceled",
        }
    }

    /// States a webhook or the sweep may still move forward.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::ScheduledDowngrade | Self::CancellationScheduled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "scheduled_downgrade" => Ok(Self::ScheduledDowngrade),
            "cancellation_scheduled" => Ok(Self::CancellationScheduled),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    New,
    Upgrade,
    Downgrade,
    Cancellation,
    Addon,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
            Self::Cancellation => "cancellation",
            Self::Addon => "addon",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "upgrade" => Ok(Self::Upgrade),
            "downgrade" => Ok(Self::Downgrade),
            "cancellation" => Ok(Self::Cancellation),
            "addon" => Ok(Self::Addon),
            other => Err(format!("unknown order type: {}", other)),
        }
    }
}

/// Transition details carried alongside an order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderMetadata {
    /// Opaque reference embedded in gateway custom data at checkout time.
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_package_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_package_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_package_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_activation_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One purchase or lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: String,
    pub package_id: String,
    /// Package name at the time the order was placed.
    pub package_name: String,
    pub gateway: Option<GatewayKind>,
    pub amount: Decimal,
    pub currency: String,
    pub status: OrderStatus,
    pub order_type: OrderType,
    pub(crate) transaction_id: Option<String>,
    pub metadata: OrderMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// New `pending` order for `package`, priced at the package price.
    pub fn new(
        user_id: impl Into<String>,
        package: &Package,
        order_type: OrderType,
        gateway: Option<GatewayKind>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            package_id: package.id.clone(),
            package_name: package.name.clone(),
            gateway,
            amount: package.price,
            currency: package.currency.clone(),
            status: OrderStatus::Pending,
            order_type,
            transaction_id: None,
            metadata: OrderMetadata {
                reference: Uuid::new_v4().to_string(),
                ..OrderMetadata::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = amount;
        self
    }

    pub fn with_metadata(mut self, metadata: OrderMetadata) -> Self {
        let reference = std::mem::take(&mut self.metadata.reference);
        self.metadata = metadata;
        if self.metadata.reference.is_empty() {
            self.metadata.reference = reference;
        }
        self
    }

    /// Rebuild an order from persisted columns.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: Uuid,
        user_id: String,
        package_id: String,
        package_name: String,
        gateway: Option<GatewayKind>,
        amount: Decimal,
        currency: String,
        status: OrderStatus,
        order_type: OrderType,
        transaction_id: Option<String>,
        metadata: OrderMetadata,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            package_id,
            package_name,
            gateway,
            amount,
            currency,
            status,
            order_type,
            transaction_id,
            metadata,
            created_at,
            updated_at,
        }
    }

    /// Gateway-assigned idempotency key. Immutable once set.
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn reference(&self) -> &str {
        &self.metadata.reference
    }

    pub fn is_completed(&self) -> bool {
        self.status == OrderStatus::Completed
    }

    pub(crate) fn transition(&mut self, status: OrderStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Completed,
            OrderStatus::Failed,
            OrderStatus::ScheduledDowngrade,
            OrderStatus::CancellationScheduled,
            OrderStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
        assert!("refunded".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_new_order_gets_reference_and_package_price() {
        let package = Package::new("pro", "Pro", Decimal::new(2900, 2));
        let order = Order::new("user_1", &package, OrderType::Upgrade, Some(GatewayKind::Paddle), Utc::now());

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.amount, Decimal::new(2900, 2));
        assert_eq!(order.package_name, "Pro");
        assert!(!order.reference().is_empty());
        assert!(order.transaction_id().is_none());
    }

    #[test]
    fn test_with_metadata_keeps_reference() {
        let package = Package::free("Free");
        let order = Order::new("user_1", &package, OrderType::Downgrade, None, Utc::now());
        let reference = order.reference().to_string();

        let order = order.with_metadata(OrderMetadata {
            target_package_name: Some("Free".to_string()),
            ..OrderMetadata::default()
        });

        assert_eq!(order.reference(), reference);
        assert_eq!(order.metadata.target_package_name.as_deref(), Some("Free"));
    }

    #[test]
    fn test_metadata_extra_fields_flatten() {
        let json = serde_json::json!({
            "reference": "ref-1",
            "target_package_name": "Free",
            "coupon": "SPRING"
        });
        let metadata: OrderMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(metadata.reference, "ref-1");
        assert_eq!(metadata.extra.get("coupon"), Some(&serde_json::json!("SPRING")));
    }

    #[test]
    fn test_open_states() {
        assert!(OrderStatus::Pending.is_open());
        assert!(OrderStatus::ScheduledDowngrade.is_open());
        assert!(OrderStatus::CancellationScheduled.is_open());
        assert!(!OrderStatus::Completed.is_open());
        assert!(!OrderStatus::Canceled.is_open());
    }
}
