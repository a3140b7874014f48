//! Packages, seeded users and a wired orchestrator for tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::gateway::MockGateway;
use super::provisioning::MockProvisioningClient;
use crate::domain::{License, Order, OrderStatus, OrderType, Package, SubscriberAccount, UserLedger};
use crate::gateway::{GatewayAdapter, GatewayKind, GatewayRegistry, ProductBindings};
use crate::orchestrator::{
    AbuseDecision, AbuseGate, AuditSink, LifecycleAuditEvent, LifecycleError, OrchestratorSettings,
    Provisioner, RequestContext, SubscriptionOrchestrator,
};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::store::{InMemorySubscriptionStore, SubscriptionStore};
use crate::webhooks::WebhookReconciler;

/// Helper functions for the standard test catalogue
pub mod packages {
    use super::*;

    /// 9.00 USD, 30 days, SKU `STARTER`.
    pub fn starter() -> Package {
        Package::new("starter", "Starter", Decimal::new(900, 2)).with_license_sku("STARTER")
    }

    /// 29.00 USD, 30 days, SKU `PRO`.
    pub fn pro() -> Package {
        Package::new("pro", "Pro", Decimal::new(2900, 2)).with_license_sku("PRO")
    }

    pub fn free() -> Package {
        Package::free(crate::domain::FREE_PACKAGE_NAME)
    }

    pub fn all() -> Vec<Package> {
        vec![starter(), pro(), free()]
    }
}

/// `starter` and `pro` bound on every gateway as `<gateway>-<package>`.
pub fn product_bindings() -> ProductBindings {
    let mut bindings = ProductBindings::new();
    for kind in GatewayKind::ALL {
        for package in ["starter", "pro"] {
            bindings = bindings.bind(package, kind, format!("{}-{}", kind, package));
        }
    }
    bindings
}

/// Audit sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<LifecycleAuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleAuditEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(LifecycleAuditEvent::event_kind).collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, event: LifecycleAuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Abuse gate backed by a deny list of IPs, fingerprints and cookies.
///
/// `block_identifiers` adds the request's identifiers to the list.
#[derive(Default)]
pub struct DenyListGate {
    denied: Mutex<HashSet<String>>,
}

impl DenyListGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, identifier: impl Into<String>) {
        self.denied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identifier.into());
    }

    fn identifiers(context: &RequestContext) -> impl Iterator<Item = &String> {
        [&context.ip, &context.device_fingerprint, &context.fingerprint_cookie]
            .into_iter()
            .flatten()
    }
}

#[async_trait]
impl AbuseGate for DenyListGate {
    async fn allowed(&self, _account: &SubscriberAccount, context: &RequestContext) -> AbuseDecision {
        let denied = self.denied.lock().unwrap_or_else(PoisonError::into_inner);
        match Self::identifiers(context).find(|id| denied.contains(*id)) {
            Some(id) => AbuseDecision::deny(format!("identifier '{}' already used the free tier", id)),
            None => AbuseDecision::allow(),
        }
    }

    async fn block_identifiers(&self, _account: &SubscriberAccount, context: &RequestContext) {
        let mut denied = self.denied.lock().unwrap_or_else(PoisonError::into_inner);
        denied.extend(Self::identifiers(context).cloned());
    }
}

/// In-memory store, mock gateways and mock provisioning wired into an
/// orchestrator with a 1 ms retry backoff.
pub struct TestHarness {
    pub store: Arc<InMemorySubscriptionStore>,
    pub provisioning: Arc<MockProvisioningClient>,
    pub audit: Arc<RecordingAuditSink>,
    pub orchestrator: Arc<SubscriptionOrchestrator<InMemorySubscriptionStore>>,
    gateways: Vec<Arc<MockGateway>>,
}

impl TestHarness {
    /// Harness with a single mock gateway of `kind`.
    pub fn new(kind: GatewayKind) -> Self {
        Self::builder().with_gateway(MockGateway::new(kind)).build()
    }

    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::default()
    }

    pub fn gateway(&self, kind: GatewayKind) -> Option<Arc<MockGateway>> {
        self.gateways.iter().find(|g| g.kind() == kind).cloned()
    }

    pub fn reconciler(&self) -> WebhookReconciler<InMemorySubscriptionStore> {
        WebhookReconciler::new(self.orchestrator.clone())
    }

    /// Register `user_id` with an `<user_id>@example.com` address.
    pub async fn register(&self, user_id: &str) -> Result<(), LifecycleError> {
        let account = SubscriberAccount::new(user_id, format!("{}@example.com", user_id));
        self.orchestrator.register_account(&account).await
    }

    /// Seed a user already paying for `package_id` on `gateway`.
    ///
    /// The user gets a tenant, a completed order and an active license
    /// expiring at `expires_at`.
    pub async fn subscribe(
        &self,
        user_id: &str,
        package_id: &str,
        gateway: GatewayKind,
        subscription_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<License, LifecycleError> {
        let package = self
            .store
            .get_package(package_id)
            .await?
            .ok_or_else(|| LifecycleError::PackageNotFound {
                package_id: package_id.to_string(),
            })?;

        let mut ledger = match self.store.get_ledger(user_id).await? {
            Some(ledger) => ledger,
            None => UserLedger::new(SubscriberAccount::new(user_id, format!("{}@example.com", user_id))),
        };
        ledger.account.tenant_id.get_or_insert_with(|| format!("tenant-{}", user_id));

        let now = Utc::now();
        let order = Order::new(user_id, &package, OrderType::New, Some(gateway), now)
            .with_status(OrderStatus::Completed);
        ledger.push_order(order)?;

        let license = License::issue(user_id, &package, Some(gateway), Some(subscription_id.to_string()), now)
            .with_license_key(Some(format!("SEED-{}", user_id)))
            .with_expires_at(expires_at);
        ledger.activate_license(license.clone());

        self.store.put_ledger(ledger)?;
        Ok(license)
    }

    pub async fn ledger(&self, user_id: &str) -> Option<UserLedger> {
        self.store.get_ledger(user_id).await.ok().flatten()
    }
}

/// Builder for [`TestHarness`]
#[derive(Default)]
pub struct TestHarnessBuilder {
    gateways: Vec<MockGateway>,
    adapters: Vec<Arc<dyn GatewayAdapter>>,
    settings: OrchestratorSettings,
    abuse_gate: Option<Arc<dyn AbuseGate>>,
    provisioning: Option<MockProvisioningClient>,
    default_gateway: Option<GatewayKind>,
}

impl TestHarnessBuilder {
    pub fn with_gateway(mut self, gateway: MockGateway) -> Self {
        self.gateways.push(gateway);
        self
    }

    /// Register a real adapter, e.g. one pointed at a local HTTP mock.
    ///
    /// It is not returned by [`TestHarness::gateway`].
    pub fn with_adapter(mut self, adapter: Arc<dyn GatewayAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_default_gateway(mut self, kind: GatewayKind) -> Self {
        self.default_gateway = Some(kind);
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_abuse_gate(mut self, gate: Arc<dyn AbuseGate>) -> Self {
        self.abuse_gate = Some(gate);
        self
    }

    /// Replace the default provisioning mock (20 codes per paid SKU).
    pub fn with_provisioning(mut self, provisioning: MockProvisioningClient) -> Self {
        self.provisioning = Some(provisioning);
        self
    }

    pub fn build(self) -> TestHarness {
        let store = Arc::new(InMemorySubscriptionStore::new().with_packages(packages::all()));
        let provisioning = Arc::new(self.provisioning.unwrap_or_else(|| {
            MockProvisioningClient::new()
                .with_codes("STARTER", (1..=20).map(|n| format!("STARTER-{:03}", n)))
                .with_codes("PRO", (1..=20).map(|n| format!("PRO-{:03}", n)))
        }));
        let audit = Arc::new(RecordingAuditSink::new());

        let gateways: Vec<Arc<MockGateway>> = self.gateways.into_iter().map(Arc::new).collect();
        let mut registry = GatewayRegistry::new(product_bindings());
        for gateway in &gateways {
            registry.register(gateway.clone());
        }
        for adapter in self.adapters {
            registry.register(adapter);
        }
        if let Some(kind) = self.default_gateway {
            registry = registry.with_default_gateway(kind);
        }

        let provisioner = Provisioner::new(
            provisioning.clone(),
            RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(1))),
        );
        let mut orchestrator = SubscriptionOrchestrator::new(store.clone(), registry, provisioner)
            .with_audit_sink(audit.clone())
            .with_settings(self.settings);
        if let Some(gate) = self.abuse_gate {
            orchestrator = orchestrator.with_abuse_gate(gate);
        }

        TestHarness {
            store,
            provisioning,
            audit,
            orchestrator: Arc::new(orchestrator),
            gateways,
        }
    }
}
