use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::GatewayKind;

/// Subscription-relevant slice of a user record.
///
/// Only the orchestrator and the webhook reconciler write these fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberAccount {
    pub user_id: String,
    pub email: String,
    pub package_id: Option<String>,
    pub gateway: Option<GatewayKind>,
    pub subscription_id: Option<String>,
    pub license_id: Option<Uuid>,
    pub is_subscribed: bool,
    pub has_used_free_plan: bool,
    pub free_plan_used_at: Option<DateTime<Utc>>,
    /// Tenant created in the provisioning API on first activation.
    pub tenant_id: Option<String>,
}

impl SubscriberAccount {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            package_id: None,
            gateway: None,
            subscription_id: None,
            license_id: None,
            is_subscribed: false,
            has_used_free_plan: false,
            free_plan_used_at: None,
            tenant_id: None,
        }
    }

    pub(crate) fn clear_subscription(&mut self) {
        self.package_id = None;
        self.gateway = None;
        self.subscription_id = None;
        self.license_id = None;
        self.is_subscribed = false;
    }
}
