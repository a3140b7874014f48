use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::retry::Retryable;

/// Failure talking to the tenant/license API.
///
/// `terminal` mirrors the API's "show this to the user, do not retry" flag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provisioning {operation} failed: {message}")]
pub struct ProvisioningError {
    pub operation: &'static str,
    pub message: String,
    pub status: Option<u16>,
    pub terminal: bool,
    /// Human-readable reason suitable for the end user.
    pub user_message: Option<String>,
}

impl ProvisioningError {
    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
            status: None,
            terminal: false,
            user_message: None,
        }
    }

    pub fn terminal(
        operation: &'static str,
        message: impl Into<String>,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            message: message.into(),
            status: None,
            terminal: true,
            user_message: Some(user_message.into()),
        }
    }

    /// The client itself is misconfigured; retrying cannot help.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self {
            operation: "configure",
            message: message.into(),
            status: None,
            terminal: true,
            user_message: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Classify an HTTP failure: 4xx other than 408/429 is terminal.
    pub fn from_status(operation: &'static str, status: u16, body: &str) -> Self {
        let user_message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.get("message")
                    .or_else(|| v.get("error"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            });
        let terminal = (400..500).contains(&status) && status != 408 && status != 429;

        Self {
            operation,
            message: format!("HTTP {}: {}", status, body.chars().take(256).collect::<String>()),
            status: Some(status),
            terminal,
            user_message: if terminal { user_message } else { None },
        }
    }
}

impl Retryable for ProvisioningError {
    fn is_terminal(&self) -> bool {
        self.terminal
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRequest {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseCode {
    pub code: String,
    #[serde(default)]
    pub sku: String,
}

/// External tenant and license-issuing API.
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn create_tenant(&self, request: &TenantRequest) -> Result<Tenant, ProvisioningError>;

    /// Grant the user's login access to the tenant.
    async fn bind_credential(&self, tenant_id: &str, email: &str) -> Result<(), ProvisioningError>;

    /// Unassigned license codes for a product SKU.
    async fn list_license_codes(&self, sku: &str) -> Result<Vec<LicenseCode>, ProvisioningError>;

    async fn attach_license(&self, tenant_id: &str, code: &str) -> Result<(), ProvisioningError>;
}
