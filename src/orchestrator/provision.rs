use std::sync::Arc;

use crate::domain::{Package, SubscriberAccount};
use crate::provisioning::{ProvisioningClient, TenantRequest};
use crate::retry::RetryExecutor;

use super::error::LifecycleError;

/// Tenant and license code obtained for one activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub tenant_id: String,
    pub license_key: Option<String>,
}

/// Runs provisioning calls through the retry executor.
///
/// Never called while a store transaction is open; backoff sleeps happen
/// here, before any local state is touched.
#[derive(Clone)]
pub struct Provisioner {
    client: Arc<dyn ProvisioningClient>,
    retry: RetryExecutor,
}

impl Provisioner {
    pub fn new(client: Arc<dyn ProvisioningClient>, retry: RetryExecutor) -> Self {
        Self { client, retry }
    }

    /// Existing tenant id, or a freshly created tenant with the user's
    /// credential bound to it. The flag is `true` when a tenant was created.
    pub async fn ensure_tenant(
        &self,
        account: &SubscriberAccount,
    ) -> Result<(String, bool), LifecycleError> {
        if let Some(tenant_id) = &account.tenant_id {
            return Ok((tenant_id.clone(), false));
        }

        let client = &self.client;
        let request = TenantRequest {
            user_id: account.user_id.clone(),
            email: account.email.clone(),
            display_name: account.email.clone(),
        };
        let request = &request;

        let tenant = self
            .retry
            .execute("create_tenant", move || client.create_tenant(request))
            .await
            .map_err(|e| {
                tracing::error!(
                    target: "tollway::provisioning",
                    user_id = %account.user_id,
                    attempts = e.attempts(),
                    error = %e,
                    "Tenant creation failed"
                );
                LifecycleError::from(e)
            })?;

        let tenant_id = tenant.id.as_str();
        let email = account.email.as_str();
        self.retry
            .execute("bind_credential", move || client.bind_credential(tenant_id, email))
            .await
            .map_err(|e| {
                tracing::error!(
                    target: "tollway::provisioning",
                    user_id = %account.user_id,
                    tenant_id = %tenant_id,
                    error = %e,
                    "Credential binding failed"
                );
                LifecycleError::from(e)
            })?;

        Ok((tenant.id, true))
    }

    /// Reserve a license code for `package` and attach it to the tenant.
    ///
    /// Packages without a license SKU need no code.
    pub async fn issue_license(
        &self,
        tenant_id: &str,
        package: &Package,
    ) -> Result<Option<String>, LifecycleError> {
        let Some(sku) = package.license_sku.as_deref() else {
            return Ok(None);
        };
        let client = &self.client;

        let codes = self
            .retry
            .execute("list_license_codes", move || client.list_license_codes(sku))
            .await?;

        let Some(code) = codes.into_iter().next() else {
            tracing::error!(
                target: "tollway::provisioning",
                tenant_id = %tenant_id,
                package = %package.name,
                sku = %sku,
                "No license codes available"
            );
            return Err(LifecycleError::ProvisioningRejected {
                operation: "list_license_codes",
                message: format!("no license codes available for sku '{}'", sku),
                user_message: Some(
                    "No licenses are currently available for this package. Please contact support."
                        .to_string(),
                ),
            });
        };

        let code_ref = code.code.as_str();
        self.retry
            .execute("attach_license", move || client.attach_license(tenant_id, code_ref))
            .await
            .map_err(|e| {
                tracing::error!(
                    target: "tollway::provisioning",
                    tenant_id = %tenant_id,
                    package = %package.name,
                    error = %e,
                    "License attachment failed"
                );
                LifecycleError::from(e)
            })?;

        Ok(Some(code.code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::ErrorCategory;
    use crate::provisioning::ProvisioningError;
    use crate::retry::RetryPolicy;
    use crate::testing::MockProvisioningClient;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn provisioner(client: Arc<MockProvisioningClient>) -> Provisioner {
        Provisioner::new(
            client,
            RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(1))),
        )
    }

    #[tokio::test]
    async fn test_existing_tenant_is_reused() {
        let client = Arc::new(MockProvisioningClient::new());
        let mut account = SubscriberAccount::new("user_1", "user@example.com");
        account.tenant_id = Some("tenant-9".into());

        let (tenant, created) = provisioner(client.clone()).ensure_tenant(&account).await.unwrap();
        assert_eq!(tenant, "tenant-9");
        assert!(!created);
        assert_eq!(client.tenants_created(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let client = Arc::new(MockProvisioningClient::new());
        client.fail_next("create_tenant", ProvisioningError::transient("create_tenant", "HTTP 503"), 2);
        let account = SubscriberAccount::new("user_1", "user@example.com");

        let (_, created) = provisioner(client.clone()).ensure_tenant(&account).await.unwrap();
        assert!(created);
        assert_eq!(client.calls("create_tenant"), 3);
        assert_eq!(client.calls("bind_credential"), 1);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let client = Arc::new(MockProvisioningClient::new());
        client.fail_next(
            "bind_credential",
            ProvisioningError::terminal("bind_credential", "HTTP 409", "Email already registered"),
            1,
        );
        let account = SubscriberAccount::new("user_1", "user@example.com");

        let err = provisioner(client.clone()).ensure_tenant(&account).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::TerminalExternal);
        assert_eq!(err.user_message(), "Email already registered");
        assert_eq!(client.calls("bind_credential"), 1);
    }

    #[tokio::test]
    async fn test_issue_license_attaches_first_code() {
        let client = Arc::new(MockProvisioningClient::new().with_codes("PRO", ["CODE-1", "CODE-2"]));
        let pro = Package::new("pro", "Pro", Decimal::new(2900, 2)).with_license_sku("PRO");

        let key = provisioner(client.clone()).issue_license("tenant-1", &pro).await.unwrap();
        assert_eq!(key.as_deref(), Some("CODE-1"));
        assert_eq!(client.attached("tenant-1"), vec!["CODE-1".to_string()]);
    }

    #[tokio::test]
    async fn test_issue_license_without_codes_is_terminal() {
        let client = Arc::new(MockProvisioningClient::new());
        let pro = Package::new("pro", "Pro", Decimal::new(2900, 2)).with_license_sku("PRO");

        let err = provisioner(client).issue_license("tenant-1", &pro).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ProvisioningRejected { .. }));
    }
}
