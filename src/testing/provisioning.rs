use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::provisioning::{LicenseCode, ProvisioningClient, ProvisioningError, Tenant, TenantRequest};

/// In-memory provisioning API.
///
/// Hands out tenants `tenant-1`, `tenant-2`, ... and license codes from
/// per-SKU pools seeded with [`with_codes`](Self::with_codes). An attached
/// code leaves the pool. Failures can be scripted per operation.
#[derive(Default)]
pub struct MockProvisioningClient {
    state: Mutex<ProvisioningState>,
}

#[derive(Default)]
struct ProvisioningState {
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, (ProvisioningError, usize)>,
    codes: HashMap<String, Vec<String>>,
    attached: HashMap<String, Vec<String>>,
    bound: Vec<(String, String)>,
    tenants: usize,
}

impl MockProvisioningClient {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_codes<I, C>(self, sku: impl Into<String>, codes: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.state()
            .codes
            .entry(sku.into())
            .or_default()
            .extend(codes.into_iter().map(Into::into));
        self
    }

    /// Fail the next `times` calls to `operation` with `error`.
    pub fn fail_next(&self, operation: &'static str, error: ProvisioningError, times: usize) {
        self.state().failures.insert(operation, (error, times));
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn tenants_created(&self) -> usize {
        self.state().tenants
    }

    /// Codes attached to `tenant_id`, in attachment order.
    pub fn attached(&self, tenant_id: &str) -> Vec<String> {
        self.state().attached.get(tenant_id).cloned().unwrap_or_default()
    }

    /// Emails bound to `tenant_id`.
    pub fn bound_emails(&self, tenant_id: &str) -> Vec<String> {
        self.state()
            .bound
            .iter()
            .filter(|(tenant, _)| tenant == tenant_id)
            .map(|(_, email)| email.clone())
            .collect()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProvisioningState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call and return the scripted failure, if one is due.
    fn begin(state: &mut ProvisioningState, operation: &'static str) -> Result<(), ProvisioningError> {
        *state.calls.entry(operation).or_default() += 1;
        if let Some((error, remaining)) = state.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProvisioningClient for MockProvisioningClient {
    async fn create_tenant(&self, request: &TenantRequest) -> Result<Tenant, ProvisioningError> {
        let mut state = self.state();
        Self::begin(&mut state, "create_tenant")?;
        state.tenants += 1;
        Ok(Tenant {
            id: format!("tenant-{}", state.tenants),
            name: request.display_name.clone(),
        })
    }

    async fn bind_credential(&self, tenant_id: &str, email: &str) -> Result<(), ProvisioningError> {
        let mut state = self.state();
        Self::begin(&mut state, "bind_credential")?;
        state.bound.push((tenant_id.to_string(), email.to_string()));
        Ok(())
    }

    async fn list_license_codes(&self, sku: &str) -> Result<Vec<LicenseCode>, ProvisioningError> {
        let mut state = self.state();
        Self::begin(&mut state, "list_license_codes")?;
        Ok(state
            .codes
            .get(sku)
            .map(|codes| {
                codes
                    .iter()
                    .map(|code| LicenseCode {
                        code: code.clone(),
                        sku: sku.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn attach_license(&self, tenant_id: &str, code: &str) -> Result<(), ProvisioningError> {
        let mut state = self.state();
        Self::begin(&mut state, "attach_license")?;
        for pool in state.codes.values_mut() {
            pool.retain(|c| c != code);
        }
        state
            .attached
            .entry(tenant_id.to_string())
            .or_default()
            .push(code.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attached_codes_leave_the_pool() {
        let client = MockProvisioningClient::new().with_codes("PRO", ["A", "B"]);
        client.attach_license("tenant-1", "A").await.unwrap();

        let remaining = client.list_license_codes("PRO").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].code, "B");
        assert_eq!(client.attached("tenant-1"), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_scripted_failures_run_out() {
        let client = MockProvisioningClient::new();
        client.fail_next("create_tenant", ProvisioningError::transient("create_tenant", "down"), 1);
        let request = TenantRequest {
            user_id: "user_1".into(),
            email: "user@example.com".into(),
            display_name: "user".into(),
        };

        assert!(client.create_tenant(&request).await.is_err());
        let tenant = client.create_tenant(&request).await.unwrap();
        assert_eq!(tenant.id, "tenant-1");
        assert_eq!(client.calls("create_tenant"), 2);
    }
}
