use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::package::Package;
use crate::gateway::GatewayKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Active,
    /// Cancellation requested; access continues until `expires_at`.
    CancelledAtPeriodEnd,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::CancelledAtPeriodEnd => "cancelled_at_period_end",
        }
    }
}

impl fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LicenseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "cancelled_at_period_end" => Ok(Self::CancelledAtPeriodEnd),
            other => Err(format!("unknown license status: {}", other)),
        }
    }
}

/// Entitlement grant for one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub id: Uuid,
    pub user_id: String,
    pub package_id: String,
    pub gateway: Option<GatewayKind>,
    pub gateway_subscription_id: Option<String>,
    /// Code issued by the provisioning API.
    pub license_key: Option<String>,
    pub activated_at: DateTime<Utc>,
    /// `None` means non-expiring.
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub status: LicenseStatus,
}

impl License {
    /// Active license for `package`, expiring after the package duration.
    pub fn issue(
        user_id: impl Into<String>,
        package: &Package,
        gateway: Option<GatewayKind>,
        subscription_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            package_id: package.id.clone(),
            gateway,
            gateway_subscription_id: subscription_id,
            license_key: None,
            activated_at: now,
            expires_at: package
                .duration_days
                .map(|days| now + Duration::days(i64::from(days))),
            is_active: true,
            status: LicenseStatus::Active,
        }
    }

    pub fn with_license_key(mut self, key: Option<String>) -> Self {
        self.license_key = key;
        self
    }

    pub fn with_expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_issue_uses_package_duration() {
        let now = Utc::now();
        let package = Package::new("starter", "Starter", Decimal::new(900, 2)).with_duration_days(Some(30));
        let license = License::issue("user_1", &package, Some(GatewayKind::FastSpring), Some("S1".into()), now);

        assert!(license.is_active);
        assert_eq!(license.status, LicenseStatus::Active);
        assert_eq!(license.expires_at, Some(now + Duration::days(30)));
        assert!(!license.is_expired(now));
        assert!(license.is_expired(now + Duration::days(31)));
    }

    #[test]
    fn test_free_license_never_expires() {
        let now = Utc::now();
        let license = License::issue("user_1", &Package::free("Free"), None, None, now);
        assert_eq!(license.expires_at, None);
        assert!(!license.is_expired(now + Duration::days(10_000)));
    }
}
