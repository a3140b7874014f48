//! Free-tier single-use guard and the abuse-gate seam.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Package, SubscriberAccount, UserLedger};

/// Evidence that a user already had the free tier.
///
/// Each signal is checked independently; any single one is enough to refuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreeTierSignal {
    ExplicitFlag,
    FreePackageHistory,
    CurrentFreePackage,
    ZeroAmountOrder,
}

impl fmt::Display for FreeTierSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExplicitFlag => "free plan already used",
            Self::FreePackageHistory => "previous order for the free package",
            Self::CurrentFreePackage => "currently on the free package",
            Self::ZeroAmountOrder => "previous zero-amount order",
        })
    }
}

/// First signal showing the free tier was already used, if any.
pub fn free_tier_usage(
    ledger: &UserLedger,
    current_package: Option<&Package>,
    free_package_name: &str,
) -> Option<FreeTierSignal> {
    if ledger.account.has_used_free_plan {
        return Some(FreeTierSignal::ExplicitFlag);
    }
    if ledger.has_order_for_package_named(free_package_name) {
        return Some(FreeTierSignal::FreePackageHistory);
    }
    if current_package.is_some_and(|p| p.name.eq_ignore_ascii_case(free_package_name)) {
        return Some(FreeTierSignal::CurrentFreePackage);
    }
    if ledger.has_zero_amount_completed_order() {
        return Some(FreeTierSignal::ZeroAmountOrder);
    }
    None
}

/// Identifiers of the request asking for the free tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub email: Option<String>,
    pub device_fingerprint: Option<String>,
    pub fingerprint_cookie: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_device_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.device_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_fingerprint_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.fingerprint_cookie = Some(cookie.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbuseDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl AbuseDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// External free-tier abuse check. Opaque to the orchestrator.
#[async_trait]
pub trait AbuseGate: Send + Sync {
    async fn allowed(&self, account: &SubscriberAccount, context: &RequestContext) -> AbuseDecision;

    /// Bar the request's identifiers from further free-tier use.
    async fn block_identifiers(&self, account: &SubscriberAccount, context: &RequestContext);
}

/// Gate that never blocks. Used when abuse prevention is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllGate;

#[async_trait]
impl AbuseGate for AllowAllGate {
    async fn allowed(&self, _account: &SubscriberAccount, _context: &RequestContext) -> AbuseDecision {
        AbuseDecision::allow()
    }

    async fn block_identifiers(&self, _account: &SubscriberAccount, _context: &RequestContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Order, OrderStatus, OrderType};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn ledger() -> UserLedger {
        UserLedger::new(SubscriberAccount::new("user_1", "user@example.com"))
    }

    #[test]
    fn test_fresh_user_has_no_signal() {
        assert_eq!(free_tier_usage(&ledger(), None, "Free"), None);
    }

    #[test]
    fn test_each_signal_is_detected_on_its_own() {
        let now = Utc::now();
        let free = Package::free("Free");

        let mut flagged = ledger();
        flagged.account.has_used_free_plan = true;
        assert_eq!(free_tier_usage(&flagged, None, "Free"), Some(FreeTierSignal::ExplicitFlag));

        // A failed order still counts as history.
        let mut history = ledger();
        history
            .push_order(Order::new("user_1", &free, OrderType::New, None, now).with_status(OrderStatus::Failed))
            .unwrap();
        assert_eq!(free_tier_usage(&history, None, "free"), Some(FreeTierSignal::FreePackageHistory));

        assert_eq!(
            free_tier_usage(&ledger(), Some(&free), "Free"),
            Some(FreeTierSignal::CurrentFreePackage)
        );

        let promo = Package::new("promo", "Promo", Decimal::new(1500, 2));
        let mut zero = ledger();
        zero.push_order(
            Order::new("user_1", &promo, OrderType::New, None, now)
                .with_amount(Decimal::ZERO)
                .with_status(OrderStatus::Completed),
        )
        .unwrap();
        assert_eq!(free_tier_usage(&zero, None, "Free"), Some(FreeTierSignal::ZeroAmountOrder));
    }

    #[tokio::test]
    async fn test_allow_all_gate() {
        let account = SubscriberAccount::new("user_1", "user@example.com");
        let decision = AllowAllGate.allowed(&account, &RequestContext::new().with_ip("10.0.0.1")).await;
        assert!(decision.allowed);
    }
}
