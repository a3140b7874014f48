//! Per-gateway transition rules.
//!
//! Adapters never decide whether a plan change applies now, after payment or
//! at period end. That choice lives in this table, looked up by
//! [`GatewayKind`].

use serde::Serialize;

use crate::gateway::{BillingPeriod, GatewayKind};

/// How a checkout hands control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutModel {
    /// The gateway returns a transaction handle synchronously.
    SynchronousHandle,
    /// The user is redirected; the transaction id arrives by webhook.
    RedirectOnly,
}

/// When a requested plan change takes effect locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Execution {
    /// Applied as soon as the gateway call succeeds.
    Immediate,
    /// Recorded as pending; a payment webhook completes it.
    AwaitWebhook,
    /// Recorded with an activation date; the scheduler or a renewal applies it.
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationTiming {
    /// Access continues until the paid period ends.
    EndOfPeriod,
    /// The gateway terminates right away; access is revoked with it.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GatewayPolicy {
    pub gateway: GatewayKind,
    pub checkout: CheckoutModel,
    pub upgrade: Execution,
    pub downgrade: Execution,
    pub cancellation: CancellationTiming,
}

impl GatewayPolicy {
    pub const fn for_gateway(gateway: GatewayKind) -> Self {
        match gateway {
            GatewayKind::FastSpring | GatewayKind::Paddle => Self {
                gateway,
                checkout: CheckoutModel::SynchronousHandle,
                upgrade: Execution::Immediate,
                downgrade: Execution::Immediate,
                cancellation: CancellationTiming::EndOfPeriod,
            },
            GatewayKind::PayProGlobal => Self {
                gateway,
                checkout: CheckoutModel::RedirectOnly,
                upgrade: Execution::AwaitWebhook,
                downgrade: Execution::Scheduled,
                cancellation: CancellationTiming::Immediate,
            },
        }
    }

    /// Downgrades to a free package never touch the gateway; they wait for
    /// the paid period to run out.
    pub fn downgrade_execution(&self, target_is_free: bool) -> Execution {
        if target_is_free {
            Execution::Scheduled
        } else {
            self.downgrade
        }
    }

    pub fn cancellation_period(&self) -> BillingPeriod {
        match self.cancellation {
            CancellationTiming::EndOfPeriod => BillingPeriod::EndOfPeriod,
            CancellationTiming::Immediate => BillingPeriod::Immediate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synchronous_gateways_apply_changes_immediately() {
        for kind in [GatewayKind::FastSpring, GatewayKind::Paddle] {
            let policy = GatewayPolicy::for_gateway(kind);
            assert_eq!(policy.checkout, CheckoutModel::SynchronousHandle);
            assert_eq!(policy.upgrade, Execution::Immediate);
            assert_eq!(policy.downgrade_execution(false), Execution::Immediate);
            assert_eq!(policy.cancellation_period(), BillingPeriod::EndOfPeriod);
        }
    }

    #[test]
    fn test_redirect_gateway_defers_changes() {
        let policy = GatewayPolicy::for_gateway(GatewayKind::PayProGlobal);
        assert_eq!(policy.checkout, CheckoutModel::RedirectOnly);
        assert_eq!(policy.upgrade, Execution::AwaitWebhook);
        assert_eq!(policy.downgrade_execution(false), Execution::Scheduled);
        assert_eq!(policy.cancellation_period(), BillingPeriod::Immediate);
    }

    #[test]
    fn test_free_target_is_always_scheduled() {
        for kind in GatewayKind::ALL {
            assert_eq!(
                GatewayPolicy::for_gateway(kind).downgrade_execution(true),
                Execution::Scheduled
            );
        }
    }
}
