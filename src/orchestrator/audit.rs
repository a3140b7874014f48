//! Audit trail for subscription lifecycle transitions.

use std::fmt;

use async_trait::async_trait;

use crate::gateway::GatewayKind;

/// Audit event types for lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAuditEvent {
    CheckoutStarted {
        user_id: String,
        order_id: String,
        package_id: String,
        gateway: GatewayKind,
    },
    /// Upgrade or downgrade accepted by the gateway.
    PlanChangeRequested {
        user_id: String,
        order_id: String,
        from_package: String,
        to_package: String,
        gateway: GatewayKind,
    },
    DowngradeScheduled {
        user_id: String,
        order_id: String,
        to_package: String,
        activation_date: String,
    },
    OrderCompleted {
        user_id: String,
        order_id: String,
        package_id: String,
    },
    OrderFailed {
        user_id: String,
        order_id: String,
        reason: String,
    },
    CancellationRequested {
        user_id: String,
        subscription_id: String,
        immediate: bool,
    },
    CancellationConfirmed {
        user_id: String,
        orders_canceled: usize,
    },
    FreeTierAssigned {
        user_id: String,
        order_id: String,
    },
    WebhookRejected {
        gateway: GatewayKind,
    },
    WebhookUnmatched {
        gateway: GatewayKind,
        event_type: String,
        identifier: String,
    },
}

impl LifecycleAuditEvent {
    pub fn event_kind(&self) -> &'static str {
        match self {
            Self::CheckoutStarted { .. } => "checkout_started",
            Self::PlanChangeRequested { .. } => "plan_change_requested",
            Self::DowngradeScheduled { .. } => "downgrade_scheduled",
            Self::OrderCompleted { .. } => "order_completed",
            Self::OrderFailed { .. } => "order_failed",
            Self::CancellationRequested { .. } => "cancellation_requested",
            Self::CancellationConfirmed { .. } => "cancellation_confirmed",
            Self::FreeTierAssigned { .. } => "free_tier_assigned",
            Self::WebhookRejected { .. } => "webhook_rejected",
            Self::WebhookUnmatched { .. } => "webhook_unmatched",
        }
    }
}

impl fmt::Display for LifecycleAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckoutStarted { user_id, order_id, package_id, gateway } => {
                write!(f, "Checkout started: user={}, order={}, package={}, gateway={}", user_id, order_id, package_id, gateway)
            }
            Self::PlanChangeRequested { user_id, order_id, from_package, to_package, gateway } => {
                write!(f, "Plan change requested: user={}, order={}, from={}, to={}, gateway={}", user_id, order_id, from_package, to_package, gateway)
            }
            Self::DowngradeScheduled { user_id, order_id, to_package, activation_date } => {
                write!(f, "Downgrade scheduled: user={}, order={}, to={}, at={}", user_id, order_id, to_package, activation_date)
            }
            Self::OrderCompleted { user_id, order_id, package_id } => {
                write!(f, "Order completed: user={}, order={}, package={}", user_id, order_id, package_id)
            }
            Self::OrderFailed { user_id, order_id, reason } => {
                write!(f, "Order failed: user={}, order={}, reason={}", user_id, order_id, reason)
            }
            Self::CancellationRequested { user_id, subscription_id, immediate } => {
                write!(f, "Cancellation requested: user={}, sub={}, immediate={}", user_id, subscription_id, immediate)
            }
            Self::CancellationConfirmed { user_id, orders_canceled } => {
                write!(f, "Cancellation confirmed: user={}, orders_canceled={}", user_id, orders_canceled)
            }
            Self::FreeTierAssigned { user_id, order_id } => {
                write!(f, "Free tier assigned: user={}, order={}", user_id, order_id)
            }
            Self::WebhookRejected { gateway } => {
                write!(f, "Webhook rejected: gateway={}", gateway)
            }
            Self::WebhookUnmatched { gateway, event_type, identifier } => {
                write!(f, "Webhook unmatched: gateway={}, type={}, id={}", gateway, event_type, identifier)
            }
        }
    }
}

/// Destination for lifecycle audit events.
///
/// Implementations must not fail the transition they record.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: LifecycleAuditEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditSink;

#[async_trait]
impl AuditSink for NoOpAuditSink {
    async fn record(&self, _event: LifecycleAuditEvent) {}
}

/// Logs events at INFO under `tollway::audit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: LifecycleAuditEvent) {
        tracing::info!(
            target: "tollway::audit",
            event_type = event.event_kind(),
            "{}", event
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let event = LifecycleAuditEvent::CancellationRequested {
            user_id: "user_1".into(),
            subscription_id: "S1".into(),
            immediate: false,
        };
        assert_eq!(event.event_kind(), "cancellation_requested");
        assert_eq!(
            event.to_string(),
            "Cancellation requested: user=user_1, sub=S1, immediate=false"
        );
    }

    #[tokio::test]
    async fn test_sinks_accept_events() {
        let event = LifecycleAuditEvent::WebhookRejected {
            gateway: GatewayKind::Paddle,
        };
        NoOpAuditSink.record(event.clone()).await;
        TracingAuditSink.record(event).await;
    }
}
