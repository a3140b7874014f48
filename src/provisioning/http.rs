use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use super::client::{LicenseCode, ProvisioningClient, ProvisioningError, Tenant, TenantRequest};

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Connection settings for the tenant/license API.
#[derive(Debug, Clone)]
pub struct HttpProvisioningConfig {
    pub base_url: String,
    pub subscription_key: SecretString,
    pub timeout: Duration,
    /// Extra attempts for idempotent GET lookups. Writes are never replayed here.
    pub http_retries: u32,
}

impl HttpProvisioningConfig {
    pub fn new(base_url: impl Into<String>, subscription_key: impl Into<SecretString>) -> Self {
        Self {
            base_url: base_url.into(),
            subscription_key: subscription_key.into(),
            timeout: Duration::from_secs(20),
            http_retries: 2,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_http_retries(mut self, retries: u32) -> Self {
        self.http_retries = retries;
        self
    }
}

/// REST client for the provisioning API.
///
/// Only classifies failures; application-level retries belong to the
/// caller's [`RetryExecutor`](crate::retry::RetryExecutor).
#[derive(Clone, Debug)]
pub struct HttpProvisioningClient {
    config: HttpProvisioningConfig,
    client: reqwest::Client,
}

impl HttpProvisioningClient {
    /// # Errors
    ///
    /// Fails when the base URL does not parse or the HTTP client cannot be
    /// built with the configured timeout.
    pub fn new(config: HttpProvisioningConfig) -> Result<Self, ProvisioningError> {
        url::Url::parse(&config.base_url).map_err(|e| {
            ProvisioningError::configuration(format!("invalid base url '{}': {}", config.base_url, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("tollway-provisioning")
            .build()
            .map_err(|e| ProvisioningError::configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, ProvisioningError> {
        let response = request
            .header(SUBSCRIPTION_KEY_HEADER, self.config.subscription_key.expose_secret())
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() { "timed out" } else { "unreachable" };
                ProvisioningError::transient(operation, format!("{}: {}", kind, e))
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProvisioningError::transient(operation, e.to_string()))?;

        if !status.is_success() {
            return Err(ProvisioningError::from_status(operation, status.as_u16(), &body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| ProvisioningError::transient(operation, format!("invalid JSON: {}", e)))
    }

    /// GET with bounded HTTP-level retries on transient failures.
    async fn get(&self, operation: &'static str, path: &str, query: &[(&str, &str)]) -> Result<Value, ProvisioningError> {
        let mut attempt = 0;
        loop {
            let request = self.client.get(self.url(path)).query(query);
            match self.send(operation, request).await {
                Err(e) if !e.terminal && attempt < self.config.http_retries => {
                    attempt += 1;
                    tracing::debug!(
                        target: "tollway::provisioning",
                        operation = operation,
                        attempt = attempt,
                        error = %e,
                        "Retrying idempotent lookup"
                    );
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl ProvisioningClient for HttpProvisioningClient {
    async fn create_tenant(&self, request: &TenantRequest) -> Result<Tenant, ProvisioningError> {
        let body = json!({
            "name": request.display_name,
            "ownerEmail": request.email,
            "externalId": request.user_id,
        });
        let response = self
            .send("create_tenant", self.client.post(self.url("/tenants")).json(&body))
            .await?;

        let tenant: Tenant = serde_json::from_value(response).map_err(|e| {
            ProvisioningError::transient("create_tenant", format!("unexpected response: {}", e))
        })?;

        tracing::info!(
            target: "tollway::provisioning",
            user_id = %request.user_id,
            tenant_id = %tenant.id,
            "Tenant created"
        );
        Ok(tenant)
    }

    async fn bind_credential(&self, tenant_id: &str, email: &str) -> Result<(), ProvisioningError> {
        let url = self.url(&format!("/tenants/{}/users", tenant_id));
        self.send(
            "bind_credential",
            self.client.post(url).json(&json!({ "email": email, "role": "owner" })),
        )
        .await?;
        Ok(())
    }

    async fn list_license_codes(&self, sku: &str) -> Result<Vec<LicenseCode>, ProvisioningError> {
        let response = self
            .get("list_license_codes", "/licenses", &[("sku", sku), ("status", "available")])
            .await?;

        // Accept both a bare array and an `{ "items": [...] }` envelope.
        let items = match response {
            Value::Array(items) => Value::Array(items),
            Value::Object(mut obj) => obj.remove("items").unwrap_or(Value::Array(Vec::new())),
            _ => Value::Array(Vec::new()),
        };

        serde_json::from_value(items).map_err(|e| {
            ProvisioningError::transient("list_license_codes", format!("unexpected response: {}", e))
        })
    }

    async fn attach_license(&self, tenant_id: &str, code: &str) -> Result<(), ProvisioningError> {
        let url = self.url(&format!("/tenants/{}/licenses", tenant_id));
        self.send("attach_license", self.client.post(url).json(&json!({ "code": code })))
            .await?;
        tracing::info!(
            target: "tollway::provisioning",
            tenant_id = %tenant_id,
            "License attached"
        );
        Ok(())
    }
}
