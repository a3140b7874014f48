use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{
    License, LicenseStatus, Order, OrderMetadata, OrderStatus, OrderType, Package, SubscriberAccount,
    UserLedger, FREE_PACKAGE_NAME,
};
use crate::gateway::{
    CancellationReceipt, CheckoutRequest, GatewayAdapter, GatewayKind, GatewayRegistry, PlanChange,
    PlanChangeRequest,
};
use crate::store::SubscriptionStore;

use super::audit::{AuditSink, LifecycleAuditEvent, NoOpAuditSink};
use super::error::LifecycleError;
use super::free_tier::{free_tier_usage, AbuseGate, AllowAllGate, FreeTierSignal, RequestContext};
use super::policy::{CancellationTiming, Execution, GatewayPolicy};
use super::provision::{Grant, Provisioner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Name of the package handed out by free-tier assignment.
    pub free_package_name: String,
    /// Consult the abuse gate before granting the free tier.
    pub abuse_prevention: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            free_package_name: FREE_PACKAGE_NAME.to_string(),
            abuse_prevention: false,
        }
    }
}

/// Result of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    CheckoutStarted {
        order_id: Uuid,
        transaction_id: Option<String>,
        checkout_url: Option<String>,
    },
    /// A new license is active.
    Activated { order_id: Uuid, license_id: Uuid },
    /// The gateway accepted the change; a payment webhook will complete it.
    AwaitingPayment {
        order_id: Uuid,
        checkout_url: Option<String>,
    },
    DowngradeScheduled {
        order_id: Uuid,
        activation_date: DateTime<Utc>,
    },
    CancellationScheduled {
        order_id: Uuid,
        termination_date: Option<DateTime<Utc>>,
    },
    /// Access revoked.
    Canceled { order_id: Uuid, orders_canceled: usize },
    Renewed {
        license_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
    },
    /// The order was already completed, or is being completed right now.
    Duplicate { order_id: Uuid },
    /// The order left the completable states before this event arrived.
    Stale { order_id: Uuid, status: OrderStatus },
}

/// Gateway-reported details for completing an order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub transaction_id: Option<String>,
    pub subscription_id: Option<String>,
    pub period_end: Option<DateTime<Utc>>,
}

/// Marks an order as being completed by this process.
struct InFlight<'a> {
    orders: &'a Mutex<HashSet<Uuid>>,
    order_id: Uuid,
}

impl<'a> InFlight<'a> {
    fn claim(orders: &'a Mutex<HashSet<Uuid>>, order_id: Uuid) -> Option<Self> {
        let mut claimed = orders.lock().unwrap_or_else(PoisonError::into_inner);
        claimed
            .insert(order_id)
            .then_some(Self { orders, order_id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.orders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.order_id);
    }
}

/// Drives upgrade, downgrade, cancellation and free-tier assignment.
///
/// Gateway and provisioning calls always happen outside
/// [`SubscriptionStore::transact`]; each transition commits its local state
/// in a single transaction once the remote side has a definitive result.
pub struct SubscriptionOrchestrator<S: SubscriptionStore> {
    store: Arc<S>,
    gateways: GatewayRegistry,
    provisioner: Provisioner,
    abuse_gate: Arc<dyn AbuseGate>,
    audit: Arc<dyn AuditSink>,
    settings: OrchestratorSettings,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl<S: SubscriptionStore> SubscriptionOrchestrator<S> {
    pub fn new(store: Arc<S>, gateways: GatewayRegistry, provisioner: Provisioner) -> Self {
        Self {
            store,
            gateways,
            provisioner,
            abuse_gate: Arc::new(AllowAllGate),
            audit: Arc::new(NoOpAuditSink),
            settings: OrchestratorSettings::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn with_abuse_gate(mut self, gate: Arc<dyn AbuseGate>) -> Self {
        self.abuse_gate = gate;
        self
    }

    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn gateways(&self) -> &GatewayRegistry {
        &self.gateways
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub(crate) async fn audit(&self, event: LifecycleAuditEvent) {
        self.audit.record(event).await;
    }

    /// Make a user known to the orchestrator. Existing state is kept.
    pub async fn register_account(&self, account: &SubscriberAccount) -> Result<(), LifecycleError> {
        self.store.ensure_account(account).await?;
        Ok(())
    }

    /// Start a purchase of `package_id`.
    ///
    /// Free packages short-circuit to [`assign_free_tier`](Self::assign_free_tier)
    /// without touching any gateway.
    pub async fn checkout(
        &self,
        user_id: &str,
        package_id: &str,
        gateway: Option<GatewayKind>,
        context: &RequestContext,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let package = self.package(package_id).await?;
        if self.is_free(&package) {
            return self.assign_free_tier(user_id, context).await;
        }

        let ledger = self.ledger(user_id).await?;
        let kind = gateway
            .or_else(|| self.gateways.default_gateway())
            .ok_or_else(|| LifecycleError::MissingGateway {
                user_id: user_id.to_string(),
            })?;
        let adapter = self.adapter(kind)?;
        let product_id = self.product(&package.id, kind)?;

        let order_type = if ledger.active_license().is_some() {
            OrderType::Addon
        } else {
            OrderType::New
        };
        let order = Order::new(user_id, &package, order_type, Some(kind), Utc::now());
        let order_id = order.id;
        let request = CheckoutRequest {
            order_id,
            reference: order.reference().to_string(),
            user_id: user_id.to_string(),
            email: ledger.account.email.clone(),
            package_id: package.id.clone(),
            package_name: package.name.clone(),
            product_id,
            amount: package.price,
            currency: package.currency.clone(),
        };

        self.store
            .transact(user_id, move |ledger| {
                ledger.push_order(order).map_err(LifecycleError::from)
            })
            .await?;

        let handle = match adapter.create_checkout(&request).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(
                    target: "tollway::orchestrator",
                    user_id = %user_id,
                    order_id = %order_id,
                    package = %package.name,
                    gateway = %kind,
                    error = %err,
                    "Checkout failed"
                );
                self.fail_order(user_id, order_id, err.to_string()).await;
                return Err(LifecycleError::from_gateway(kind, err));
            }
        };

        let transaction_id = handle.transaction_id().map(str::to_string);
        let checkout_url = handle.checkout_url().map(str::to_string);
        {
            let transaction_id = transaction_id.clone();
            let checkout_url = checkout_url.clone();
            self.store
                .transact(user_id, move |ledger| {
                    if let Some(txid) = &transaction_id {
                        ledger.assign_transaction_id(order_id, txid)?;
                    }
                    if let Some(order) = ledger.order_mut(order_id) {
                        order.metadata.checkout_url = checkout_url;
                    }
                    Ok::<_, LifecycleError>(())
                })
                .await?;
        }

        tracing::info!(
            target: "tollway::orchestrator",
            user_id = %user_id,
            order_id = %order_id,
            package = %package.name,
            gateway = %kind,
            transaction_id = ?transaction_id,
            "Checkout started"
        );
        self.audit(LifecycleAuditEvent::CheckoutStarted {
            user_id: user_id.to_string(),
            order_id: order_id.to_string(),
            package_id: package.id.clone(),
            gateway: kind,
        })
        .await;

        Ok(TransitionOutcome::CheckoutStarted {
            order_id,
            transaction_id,
            checkout_url,
        })
    }

    /// Move the user to a strictly more expensive package.
    pub async fn upgrade(
        &self,
        user_id: &str,
        target_package_id: &str,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let target = self.package(target_package_id).await?;
        let ledger = self.ledger(user_id).await?;
        let current = self.current_package(&ledger).await?;

        if target.price <= current.price {
            return Err(LifecycleError::NotAnUpgrade {
                current: current.name,
                target: target.name,
            });
        }

        self.ensure_billing_continues(&ledger)?;

        let kind = self.account_gateway(&ledger)?;
        let adapter = self.adapter(kind)?;
        let subscription_id = self.subscription_id(&ledger)?;
        let product_id = self.product(&target.id, kind)?;
        let policy = GatewayPolicy::for_gateway(kind);

        let request = self
            .open_plan_change(user_id, OrderType::Upgrade, &current, &target, kind, subscription_id, product_id)
            .await?;

        let change = adapter.upgrade(&request).await;
        self.apply_plan_change(user_id, request.order_id, "upgrade", kind, policy.upgrade, change, &current, &target)
            .await
    }

    /// Move the user to a strictly cheaper package.
    ///
    /// Gateways that cannot swap plans synchronously, and any free target,
    /// get a `scheduled_downgrade` order activated when the paid period ends.
    /// A free target has no product to swap to, so the paid subscription is
    /// cancelled at the gateway when the downgrade is requested.
    pub async fn downgrade(
        &self,
        user_id: &str,
        target_package_id: &str,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let target = self.package(target_package_id).await?;
        let ledger = self.ledger(user_id).await?;
        let current = self.current_package(&ledger).await?;

        if target.price >= current.price {
            return Err(LifecycleError::NotADowngrade {
                current: current.name,
                target: target.name,
            });
        }

        self.ensure_billing_continues(&ledger)?;

        let kind = self.account_gateway(&ledger)?;
        let policy = GatewayPolicy::for_gateway(kind);
        let free_target = self.is_free(&target);

        match policy.downgrade_execution(free_target) {
            Execution::Scheduled if free_target => {
                let (_, receipt) = self.cancel_at_gateway(&ledger, &current, kind).await?;
                self.schedule_downgrade(&ledger, &current, &target, kind, Some(&receipt))
                    .await
            }
            Execution::Scheduled => {
                self.schedule_downgrade(&ledger, &current, &target, kind, None)
                    .await
            }
            execution => {
                let adapter = self.adapter(kind)?;
                let subscription_id = self.subscription_id(&ledger)?;
                let product_id = self.product(&target.id, kind)?;

                let request = self
                    .open_plan_change(user_id, OrderType::Downgrade, &current, &target, kind, subscription_id, product_id)
                    .await?;

                let change = adapter.downgrade(&request).await;
                self.apply_plan_change(user_id, request.order_id, "downgrade", kind, execution, change, &current, &target)
                    .await
            }
        }
    }

    /// Stop the user's subscription.
    ///
    /// End-of-period gateways keep access until the gateway confirms
    /// termination; immediate gateways revoke access in the same call.
    pub async fn cancel(&self, user_id: &str) -> Result<TransitionOutcome, LifecycleError> {
        let ledger = self.ledger(user_id).await?;
        self.ensure_billing_continues(&ledger)?;

        let current = self.current_package(&ledger).await?;
        let kind = self.account_gateway(&ledger)?;
        let (subscription_id, receipt) = self.cancel_at_gateway(&ledger, &current, kind).await?;
        let immediate = receipt.immediate;

        let now = Utc::now();
        let order = Order::new(user_id, &current, OrderType::Cancellation, Some(kind), now)
            .with_amount(Decimal::ZERO);
        let order_id = order.id;

        if immediate {
            let order = order
                .with_status(OrderStatus::Completed)
                .with_metadata(OrderMetadata {
                    original_package_id: Some(current.id.clone()),
                    gateway_subscription_id: Some(subscription_id.clone()),
                    termination_date: Some(now),
                    ..OrderMetadata::default()
                });

            let orders_canceled = self
                .store
                .transact(user_id, move |ledger| {
                    ledger.push_order(order)?;
                    Ok::<_, LifecycleError>(ledger.terminate_subscription(now))
                })
                .await?;

            tracing::info!(
                target: "tollway::orchestrator",
                user_id = %user_id,
                order_id = %order_id,
                subscription_id = %subscription_id,
                gateway = %kind,
                orders_canceled = orders_canceled,
                "Subscription canceled immediately"
            );
            self.audit(LifecycleAuditEvent::CancellationConfirmed {
                user_id: user_id.to_string(),
                orders_canceled,
            })
            .await;

            return Ok(TransitionOutcome::Canceled {
                order_id,
                orders_canceled,
            });
        }

        let termination_date = receipt
            .effective_at
            .or_else(|| ledger.active_license().and_then(|l| l.expires_at));
        let order = order
            .with_status(OrderStatus::CancellationScheduled)
            .with_metadata(OrderMetadata {
                original_package_id: Some(current.id.clone()),
                gateway_subscription_id: Some(subscription_id.clone()),
                termination_date,
                ..OrderMetadata::default()
            });

        self.store
            .transact(user_id, move |ledger| {
                if let Some(license) = ledger.active_license_mut() {
                    license.status = LicenseStatus::CancelledAtPeriodEnd;
                }
                ledger.push_order(order)?;
                Ok::<_, LifecycleError>(())
            })
            .await?;

        tracing::info!(
            target: "tollway::orchestrator",
            user_id = %user_id,
            order_id = %order_id,
            subscription_id = %subscription_id,
            gateway = %kind,
            termination_date = ?termination_date,
            "Cancellation scheduled"
        );

        Ok(TransitionOutcome::CancellationScheduled {
            order_id,
            termination_date,
        })
    }

    /// First signal showing the user already had the free tier.
    pub async fn has_used_free_tier(&self, user_id: &str) -> Result<Option<FreeTierSignal>, LifecycleError> {
        let ledger = self.ledger(user_id).await?;
        let current = self.current_package_opt(&ledger).await?;
        Ok(free_tier_usage(&ledger, current.as_ref(), &self.settings.free_package_name))
    }

    /// Grant the non-expiring free package, once per user.
    pub async fn assign_free_tier(
        &self,
        user_id: &str,
        context: &RequestContext,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let ledger = self.ledger(user_id).await?;
        let current = self.current_package_opt(&ledger).await?;
        let free_name = self.settings.free_package_name.clone();

        if let Some(signal) = free_tier_usage(&ledger, current.as_ref(), &free_name) {
            tracing::warn!(
                target: "tollway::orchestrator",
                user_id = %user_id,
                signal = %signal,
                "Free tier refused"
            );
            return Err(LifecycleError::FreeTierAlreadyUsed {
                user_id: user_id.to_string(),
                signal,
            });
        }

        if self.settings.abuse_prevention {
            let decision = self.abuse_gate.allowed(&ledger.account, context).await;
            if !decision.allowed {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "request blocked".to_string());
                tracing::warn!(
                    target: "tollway::security",
                    user_id = %user_id,
                    ip = ?context.ip,
                    reason = %reason,
                    "Free tier blocked by abuse gate"
                );
                return Err(LifecycleError::FreeTierBlocked {
                    user_id: user_id.to_string(),
                    reason,
                });
            }
        }

        let free = self.free_package().await?;
        let grant = self.provision(&ledger.account, &free).await?;

        let now = Utc::now();
        let order = Order::new(user_id, &free, OrderType::New, None, now)
            .with_amount(Decimal::ZERO)
            .with_status(OrderStatus::Completed);
        let order_id = order.id;
        let license = License::issue(user_id, &free, None, None, now)
            .with_license_key(grant.license_key)
            .with_expires_at(None);
        let license_id = license.id;
        let tenant_id = grant.tenant_id;

        self.store
            .transact(user_id, move |ledger| {
                // Concurrent assignment may have won the race since the check above.
                if let Some(signal) = free_tier_usage(ledger, current.as_ref(), &free_name) {
                    return Err(LifecycleError::FreeTierAlreadyUsed {
                        user_id: ledger.user_id().to_string(),
                        signal,
                    });
                }
                ledger.push_order(order)?;
                ledger.activate_license(license);
                ledger.account.has_used_free_plan = true;
                ledger.account.free_plan_used_at = Some(now);
                ledger.account.tenant_id = Some(tenant_id);
                Ok(())
            })
            .await?;

        if self.settings.abuse_prevention {
            self.abuse_gate.block_identifiers(&ledger.account, context).await;
        }

        tracing::info!(
            target: "tollway::orchestrator",
            user_id = %user_id,
            order_id = %order_id,
            package = %free.name,
            "Free tier assigned"
        );
        self.audit(LifecycleAuditEvent::FreeTierAssigned {
            user_id: user_id.to_string(),
            order_id: order_id.to_string(),
        })
        .await;

        Ok(TransitionOutcome::Activated {
            order_id,
            license_id,
        })
    }

    /// Complete a `pending` or `scheduled_downgrade` order.
    ///
    /// Shared by the webhook reconciler and the scheduled sweep. Completing an
    /// already completed order is a no-op. A transient provisioning failure
    /// leaves the order open so a redelivery or the next sweep can retry.
    pub async fn complete_order(
        &self,
        user_id: &str,
        order_id: Uuid,
        completion: Completion,
    ) -> Result<TransitionOutcome, LifecycleError> {
        self.complete(user_id, order_id, completion, false).await
    }

    /// Gateway confirmed that billing stopped.
    ///
    /// A confirmation for a subscription ended by a downgrade to a free
    /// package activates that downgrade once it is due and is otherwise
    /// acknowledged as a duplicate. Returns `None` when nothing matches.
    pub async fn confirm_cancellation(
        &self,
        user_id: &str,
        subscription_id: Option<&str>,
    ) -> Result<Option<TransitionOutcome>, LifecycleError> {
        if let Some(outcome) = self.finalize_cancellation(user_id, subscription_id, None).await? {
            return Ok(Some(outcome));
        }

        let ledger = self.ledger(user_id).await?;
        let Some(order) = ledger.downgrade_ending_subscription().filter(|o| {
            match (subscription_id, o.metadata.gateway_subscription_id.as_deref()) {
                (Some(wanted), Some(recorded)) => wanted == recorded,
                _ => true,
            }
        }) else {
            return Ok(None);
        };

        if ledger.ready_downgrade(Utc::now()).is_some_and(|due| due.id == order.id) {
            return self
                .complete(user_id, order.id, Completion::default(), false)
                .await
                .map(Some);
        }
        Ok(Some(TransitionOutcome::Duplicate { order_id: order.id }))
    }

    /// A new billing period started for `subscription_id`.
    ///
    /// Activates a due scheduled downgrade if there is one; otherwise extends
    /// the active license. Returns `None` when the subscription is not the
    /// user's current one.
    pub async fn record_renewal(
        &self,
        user_id: &str,
        subscription_id: &str,
        transaction_id: Option<String>,
        period_end: Option<DateTime<Utc>>,
    ) -> Result<Option<TransitionOutcome>, LifecycleError> {
        let now = Utc::now();
        let ledger = self.ledger(user_id).await?;

        let due_downgrade = ledger.ready_downgrade(now).filter(|o| {
            o.metadata
                .gateway_subscription_id
                .as_deref()
                .map_or(true, |sub| sub == subscription_id)
        });
        if let Some(order) = due_downgrade {
            let completion = Completion {
                transaction_id,
                subscription_id: Some(subscription_id.to_string()),
                period_end,
            };
            return self.complete(user_id, order.id, completion, false).await.map(Some);
        }

        let sub = subscription_id.to_string();
        let outcome = self
            .store
            .transact(user_id, move |ledger| {
                let account_sub = ledger.account.subscription_id.clone();
                let Some(license) = ledger.active_license_mut() else {
                    return Ok::<_, LifecycleError>(None);
                };
                let license_sub = license
                    .gateway_subscription_id
                    .clone()
                    .or(account_sub);
                if license_sub.as_deref() != Some(sub.as_str()) {
                    return Ok(None);
                }
                if let Some(end) = period_end {
                    if license.expires_at.map_or(true, |current| end > current) {
                        license.expires_at = Some(end);
                    }
                }
                Ok(Some(TransitionOutcome::Renewed {
                    license_id: license.id,
                    expires_at: license.expires_at,
                }))
            })
            .await?;

        if outcome.is_some() {
            tracing::info!(
                target: "tollway::orchestrator",
                user_id = %user_id,
                subscription_id = %subscription_id,
                period_end = ?period_end,
                "Subscription renewed"
            );
        }
        Ok(outcome)
    }

    /// Apply whatever scheduled work is due for one user.
    pub async fn process_due_transitions(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<TransitionOutcome>, LifecycleError> {
        let ledger = self.ledger(user_id).await?;
        let mut outcomes = Vec::new();

        if let Some(order) = ledger.ready_downgrade(now) {
            outcomes.push(
                self.complete(user_id, order.id, Completion::default(), false)
                    .await?,
            );
        }

        if ledger.due_cancellation(now).is_some() {
            if let Some(outcome) = self.finalize_cancellation(user_id, None, Some(now)).await? {
                outcomes.push(outcome);
            }
        }

        Ok(outcomes)
    }

    // Helpers

    async fn ledger(&self, user_id: &str) -> Result<UserLedger, LifecycleError> {
        self.store
            .get_ledger(user_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                what: format!("user '{}'", user_id),
            })
    }

    async fn package(&self, package_id: &str) -> Result<Package, LifecycleError> {
        self.store
            .get_package(package_id)
            .await?
            .ok_or_else(|| LifecycleError::PackageNotFound {
                package_id: package_id.to_string(),
            })
    }

    async fn current_package_opt(&self, ledger: &UserLedger) -> Result<Option<Package>, LifecycleError> {
        match &ledger.account.package_id {
            Some(id) => Ok(self.store.get_package(id).await?),
            None => Ok(None),
        }
    }

    async fn current_package(&self, ledger: &UserLedger) -> Result<Package, LifecycleError> {
        let package_id = ledger
            .account
            .package_id
            .as_deref()
            .ok_or_else(|| LifecycleError::NoActivePackage {
                user_id: ledger.user_id().to_string(),
            })?;
        self.package(package_id).await
    }

    /// The configured free package, created on first use.
    async fn free_package(&self) -> Result<Package, LifecycleError> {
        let name = &self.settings.free_package_name;
        if let Some(package) = self.store.find_package_by_name(name).await? {
            return Ok(package);
        }
        let package = Package::free(name.clone());
        self.store.save_package(&package).await?;
        Ok(package)
    }

    fn is_free(&self, package: &Package) -> bool {
        package.is_free() || package.name.eq_ignore_ascii_case(&self.settings.free_package_name)
    }

    fn account_gateway(&self, ledger: &UserLedger) -> Result<GatewayKind, LifecycleError> {
        ledger
            .account
            .gateway
            .ok_or_else(|| LifecycleError::MissingGateway {
                user_id: ledger.user_id().to_string(),
            })
    }

    fn subscription_id(&self, ledger: &UserLedger) -> Result<String, LifecycleError> {
        ledger
            .subscription_id()
            .map(str::to_string)
            .ok_or_else(|| LifecycleError::MissingSubscriptionId {
                user_id: ledger.user_id().to_string(),
            })
    }

    fn ensure_billing_continues(&self, ledger: &UserLedger) -> Result<(), LifecycleError> {
        if ledger.is_terminating() {
            return Err(LifecycleError::CancellationPending {
                user_id: ledger.user_id().to_string(),
            });
        }
        Ok(())
    }

    /// Stop billing at the gateway with the gateway's cancellation timing.
    async fn cancel_at_gateway(
        &self,
        ledger: &UserLedger,
        current: &Package,
        kind: GatewayKind,
    ) -> Result<(String, CancellationReceipt), LifecycleError> {
        let user_id = ledger.user_id();
        let adapter = self.adapter(kind)?;
        let subscription_id = self.subscription_id(ledger)?;
        let policy = GatewayPolicy::for_gateway(kind);

        let Some(mut receipt) = adapter.cancel(&subscription_id, policy.cancellation_period()).await else {
            tracing::error!(
                target: "tollway::orchestrator",
                user_id = %user_id,
                subscription_id = %subscription_id,
                package = %current.name,
                gateway = %kind,
                "Cancellation rejected by gateway"
            );
            return Err(LifecycleError::GatewayChangeFailed {
                gateway: kind,
                operation: "cancel",
            });
        };

        receipt.immediate |= policy.cancellation == CancellationTiming::Immediate;
        self.audit(LifecycleAuditEvent::CancellationRequested {
            user_id: user_id.to_string(),
            subscription_id: subscription_id.clone(),
            immediate: receipt.immediate,
        })
        .await;

        Ok((subscription_id, receipt))
    }

    fn adapter(&self, kind: GatewayKind) -> Result<Arc<dyn GatewayAdapter>, LifecycleError> {
        self.gateways
            .get(kind)
            .ok_or(LifecycleError::GatewayNotConfigured { gateway: kind })
    }

    fn product(&self, package_id: &str, kind: GatewayKind) -> Result<String, LifecycleError> {
        self.gateways
            .bindings()
            .product_for(package_id, kind)
            .map(str::to_string)
            .ok_or_else(|| LifecycleError::ProductNotBound {
                package_id: package_id.to_string(),
                gateway: kind,
            })
    }

    /// Tenant plus license code. A newly created tenant is saved right away so
    /// a later failure does not orphan it.
    async fn provision(&self, account: &SubscriberAccount, package: &Package) -> Result<Grant, LifecycleError> {
        let (tenant_id, created) = self.provisioner.ensure_tenant(account).await?;
        if created {
            let saved = tenant_id.clone();
            self.store
                .transact(&account.user_id, move |ledger| {
                    ledger.account.tenant_id.get_or_insert(saved);
                    Ok::<_, LifecycleError>(())
                })
                .await?;
        }

        let license_key = self.provisioner.issue_license(&tenant_id, package).await?;
        Ok(Grant {
            tenant_id,
            license_key,
        })
    }

    /// Record a pending plan-change order and build the gateway request for it.
    #[allow(clippy::too_many_arguments)]
    async fn open_plan_change(
        &self,
        user_id: &str,
        order_type: OrderType,
        current: &Package,
        target: &Package,
        kind: GatewayKind,
        subscription_id: String,
        product_id: String,
    ) -> Result<PlanChangeRequest, LifecycleError> {
        let order = Order::new(user_id, target, order_type, Some(kind), Utc::now()).with_metadata(
            OrderMetadata {
                original_package_id: Some(current.id.clone()),
                target_package_id: Some(target.id.clone()),
                target_package_name: Some(target.name.clone()),
                target_price: Some(target.price),
                gateway_subscription_id: Some(subscription_id.clone()),
                ..OrderMetadata::default()
            },
        );
        let request = PlanChangeRequest {
            order_id: order.id,
            reference: order.reference().to_string(),
            subscription_id,
            product_id,
        };
        self.store
            .transact(user_id, move |ledger| {
                ledger.push_order(order).map_err(LifecycleError::from)
            })
            .await?;
        Ok(request)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_plan_change(
        &self,
        user_id: &str,
        order_id: Uuid,
        operation: &'static str,
        kind: GatewayKind,
        execution: Execution,
        change: Option<PlanChange>,
        current: &Package,
        target: &Package,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let Some(change) = change else {
            tracing::error!(
                target: "tollway::orchestrator",
                user_id = %user_id,
                order_id = %order_id,
                package = %target.name,
                gateway = %kind,
                operation = operation,
                "Plan change rejected by gateway"
            );
            self.fail_order(user_id, order_id, format!("gateway did not apply {}", operation))
                .await;
            return Err(LifecycleError::GatewayChangeFailed {
                gateway: kind,
                operation,
            });
        };

        self.audit(LifecycleAuditEvent::PlanChangeRequested {
            user_id: user_id.to_string(),
            order_id: order_id.to_string(),
            from_package: current.id.clone(),
            to_package: target.id.clone(),
            gateway: kind,
        })
        .await;

        let subscription_id = Some(change.subscription_id).filter(|s| !s.is_empty());

        match execution {
            Execution::Immediate => {
                let completion = Completion {
                    transaction_id: change.transaction_id,
                    subscription_id,
                    period_end: change.next_billing_at,
                };
                self.complete(user_id, order_id, completion, true).await
            }
            Execution::AwaitWebhook | Execution::Scheduled => {
                let checkout_url = change.checkout_url;
                let transaction_id = change.transaction_id;
                let url = checkout_url.clone();
                self.store
                    .transact(user_id, move |ledger| {
                        if let Some(txid) = &transaction_id {
                            ledger.assign_transaction_id(order_id, txid)?;
                        }
                        if let Some(order) = ledger.order_mut(order_id) {
                            order.metadata.checkout_url = url;
                        }
                        Ok::<_, LifecycleError>(())
                    })
                    .await?;

                tracing::info!(
                    target: "tollway::orchestrator",
                    user_id = %user_id,
                    order_id = %order_id,
                    package = %target.name,
                    gateway = %kind,
                    operation = operation,
                    "Plan change awaiting payment"
                );
                Ok(TransitionOutcome::AwaitingPayment {
                    order_id,
                    checkout_url,
                })
            }
        }
    }

    /// `cancellation` is the gateway's receipt when billing was stopped for
    /// this downgrade; its date becomes the order's termination date.
    async fn schedule_downgrade(
        &self,
        ledger: &UserLedger,
        current: &Package,
        target: &Package,
        kind: GatewayKind,
        cancellation: Option<&CancellationReceipt>,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let user_id = ledger.user_id();
        let now = Utc::now();
        // Non-expiring licenses have no period to wait for.
        let activation_date = ledger
            .active_license()
            .and_then(|l| l.expires_at)
            .or_else(|| cancellation.and_then(|r| r.effective_at))
            .unwrap_or(now);
        let termination_date = cancellation.map(|r| r.effective_at.unwrap_or(activation_date));

        let order = Order::new(user_id, target, OrderType::Downgrade, Some(kind), now)
            .with_status(OrderStatus::ScheduledDowngrade)
            .with_metadata(OrderMetadata {
                original_package_id: Some(current.id.clone()),
                target_package_id: Some(target.id.clone()),
                target_package_name: Some(target.name.clone()),
                target_price: Some(target.price),
                scheduled_activation_date: Some(activation_date),
                termination_date,
                gateway_subscription_id: ledger.subscription_id().map(str::to_string),
                ..OrderMetadata::default()
            });
        let order_id = order.id;

        self.store
            .transact(user_id, move |ledger| {
                if termination_date.is_some() {
                    if let Some(license) = ledger.active_license_mut() {
                        license.status = LicenseStatus::CancelledAtPeriodEnd;
                    }
                }
                // A newer request replaces any downgrade still waiting.
                if let Some(previous) = ledger.scheduled_downgrade().map(|o| o.id) {
                    if let Some(previous) = ledger.order_mut(previous) {
                        previous.transition(OrderStatus::Canceled, now);
                    }
                }
                ledger.push_order(order).map_err(LifecycleError::from)
            })
            .await?;

        tracing::info!(
            target: "tollway::orchestrator",
            user_id = %user_id,
            order_id = %order_id,
            package = %target.name,
            gateway = %kind,
            activation_date = %activation_date,
            termination_date = ?termination_date,
            "Downgrade scheduled"
        );
        self.audit(LifecycleAuditEvent::DowngradeScheduled {
            user_id: user_id.to_string(),
            order_id: order_id.to_string(),
            to_package: target.id.clone(),
            activation_date: activation_date.to_rfc3339(),
        })
        .await;

        Ok(TransitionOutcome::DowngradeScheduled {
            order_id,
            activation_date,
        })
    }

    async fn complete(
        &self,
        user_id: &str,
        order_id: Uuid,
        completion: Completion,
        fail_on_transient: bool,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let Some(_claim) = InFlight::claim(&self.in_flight, order_id) else {
            tracing::debug!(
                target: "tollway::orchestrator",
                user_id = %user_id,
                order_id = %order_id,
                "Order completion already in progress"
            );
            return Ok(TransitionOutcome::Duplicate { order_id });
        };

        let ledger = self.ledger(user_id).await?;
        let order = ledger
            .order(order_id)
            .cloned()
            .ok_or_else(|| LifecycleError::NotFound {
                what: format!("order {}", order_id),
            })?;

        if order.is_completed() {
            return Ok(TransitionOutcome::Duplicate { order_id });
        }
        if !matches!(order.status, OrderStatus::Pending | OrderStatus::ScheduledDowngrade) {
            return Ok(TransitionOutcome::Stale {
                order_id,
                status: order.status,
            });
        }

        let package = self.package(&order.package_id).await?;
        let free_target = self.is_free(&package);

        let grant = match self.provision(&ledger.account, &package).await {
            Ok(grant) => grant,
            Err(err) => {
                tracing::error!(
                    target: "tollway::orchestrator",
                    user_id = %user_id,
                    order_id = %order_id,
                    package = %package.name,
                    gateway = ?order.gateway,
                    subscription_id = ?completion.subscription_id,
                    retryable = err.is_retryable(),
                    error = %err,
                    "Provisioning failed after gateway success"
                );
                if fail_on_transient || !err.is_retryable() {
                    self.fail_order(user_id, order_id, err.to_string()).await;
                }
                return Err(err);
            }
        };

        let now = Utc::now();
        let (gateway, subscription_id) = if free_target {
            (None, None)
        } else {
            let subscription_id = completion
                .subscription_id
                .clone()
                .or_else(|| order.metadata.gateway_subscription_id.clone())
                .or_else(|| ledger.subscription_id().map(str::to_string));
            (order.gateway, subscription_id)
        };

        let mut license = License::issue(user_id, &package, gateway, subscription_id.clone(), now)
            .with_license_key(grant.license_key);
        if let (Some(end), false) = (completion.period_end, free_target) {
            license = license.with_expires_at(Some(end));
        }
        let license_id = license.id;
        let tenant_id = grant.tenant_id;
        let transaction_id = completion.transaction_id;

        let outcome = self
            .store
            .transact(user_id, move |ledger| {
                let (status, has_txid) = match ledger.order(order_id) {
                    Some(order) => (order.status, order.transaction_id().is_some()),
                    None => return Err(LifecycleError::NotFound {
                        what: format!("order {}", order_id),
                    }),
                };
                // Re-checked under the lock: a concurrent delivery may have won.
                if status == OrderStatus::Completed {
                    return Ok(TransitionOutcome::Duplicate { order_id });
                }
                if !matches!(status, OrderStatus::Pending | OrderStatus::ScheduledDowngrade) {
                    return Ok(TransitionOutcome::Stale { order_id, status });
                }

                if let (Some(txid), false) = (&transaction_id, has_txid) {
                    ledger.assign_transaction_id(order_id, txid)?;
                }
                if let Some(order) = ledger.order_mut(order_id) {
                    if order.metadata.gateway_subscription_id.is_none() {
                        order.metadata.gateway_subscription_id = subscription_id;
                    }
                }
                ledger.activate_license(license);
                ledger.account.tenant_id = Some(tenant_id);
                ledger.complete_order(order_id, now)?;
                Ok(TransitionOutcome::Activated {
                    order_id,
                    license_id,
                })
            })
            .await?;

        if let TransitionOutcome::Activated { .. } = outcome {
            tracing::info!(
                target: "tollway::orchestrator",
                user_id = %user_id,
                order_id = %order_id,
                package = %package.name,
                gateway = ?order.gateway,
                license_id = %license_id,
                "Order completed"
            );
            self.audit(LifecycleAuditEvent::OrderCompleted {
                user_id: user_id.to_string(),
                order_id: order_id.to_string(),
                package_id: package.id.clone(),
            })
            .await;
        }

        Ok(outcome)
    }

    async fn finalize_cancellation(
        &self,
        user_id: &str,
        subscription_id: Option<&str>,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<Option<TransitionOutcome>, LifecycleError> {
        let now = Utc::now();
        let sub = subscription_id.map(str::to_string);

        let outcome = self
            .store
            .transact(user_id, move |ledger| {
                let matches_sub = |order: &Order| match (&sub, &order.metadata.gateway_subscription_id) {
                    (Some(wanted), Some(recorded)) => wanted == recorded,
                    _ => true,
                };

                let pending = match due_at {
                    Some(at) => ledger.due_cancellation(at),
                    None => ledger.pending_cancellation(),
                }
                .filter(|o| matches_sub(*o))
                .map(|o| o.id);

                if let Some(order_id) = pending {
                    let orders_canceled = ledger.terminate_subscription(now);
                    return Ok::<_, LifecycleError>(Some(TransitionOutcome::Canceled {
                        order_id,
                        orders_canceled,
                    }));
                }

                // Immediate cancellations are already final when the
                // gateway's confirmation arrives.
                let finished = ledger
                    .orders
                    .iter()
                    .find(|o| {
                        o.order_type == OrderType::Cancellation && o.is_completed() && matches_sub(*o)
                    })
                    .map(|o| TransitionOutcome::Duplicate { order_id: o.id });
                Ok(finished)
            })
            .await?;

        if let Some(TransitionOutcome::Canceled { order_id, orders_canceled }) = &outcome {
            tracing::info!(
                target: "tollway::orchestrator",
                user_id = %user_id,
                order_id = %order_id,
                subscription_id = ?subscription_id,
                orders_canceled = orders_canceled,
                "Cancellation confirmed"
            );
            self.audit(LifecycleAuditEvent::CancellationConfirmed {
                user_id: user_id.to_string(),
                orders_canceled: *orders_canceled,
            })
            .await;
        }

        Ok(outcome)
    }

    async fn fail_order(&self, user_id: &str, order_id: Uuid, reason: String) {
        let now = Utc::now();
        let recorded = reason.clone();
        let result = self
            .store
            .transact(user_id, move |ledger| {
                ledger
                    .fail_order(order_id, recorded, now)
                    .map_err(LifecycleError::from)
            })
            .await;

        if let Err(err) = result {
            tracing::error!(
                target: "tollway::orchestrator",
                user_id = %user_id,
                order_id = %order_id,
                error = %err,
                "Could not record order failure"
            );
        }

        self.audit(LifecycleAuditEvent::OrderFailed {
            user_id: user_id.to_string(),
            order_id: order_id.to_string(),
            reason,
        })
        .await;
    }
}
