//! Per-user aggregate of account, licenses and orders.
//!
//! Every subscription mutation goes through a [`UserLedger`] loaded under the
//! user's lock, so the single-active-license and transaction id rules are
//! enforced here rather than at each call site.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::account::SubscriberAccount;
use super::license::License;
use super::order::{Order, OrderStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("transaction id '{transaction_id}' is already recorded on order {order_id}")]
    DuplicateTransaction { transaction_id: String, order_id: Uuid },

    #[error("order {order_id} already carries transaction id '{existing}'")]
    TransactionIdImmutable { order_id: Uuid, existing: String },

    #[error("order {0} not found")]
    OrderNotFound(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserLedger {
    pub account: SubscriberAccount,
    pub licenses: Vec<License>,
    pub orders: Vec<Order>,
}

impl UserLedger {
    pub fn new(account: SubscriberAccount) -> Self {
        Self {
            account,
            licenses: Vec::new(),
            orders: Vec::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.account.user_id
    }

    pub fn active_license(&self) -> Option<&License> {
        self.licenses.iter().find(|l| l.is_active)
    }

    pub fn active_license_mut(&mut self) -> Option<&mut License> {
        self.licenses.iter_mut().find(|l| l.is_active)
    }

    /// Subscription id to use when talking to the gateway.
    ///
    /// The active license is authoritative; the account pointer is only
    /// consulted when the license predates subscription tracking.
    pub fn subscription_id(&self) -> Option<&str> {
        self.active_license()
            .and_then(|l| l.gateway_subscription_id.as_deref())
            .or(self.account.subscription_id.as_deref())
    }

    pub fn order(&self, id: Uuid) -> Option<&Order> {
        self.orders.iter().find(|o| o.id == id)
    }

    pub fn order_mut(&mut self, id: Uuid) -> Option<&mut Order> {
        self.orders.iter_mut().find(|o| o.id == id)
    }

    pub fn order_by_transaction_id(&self, transaction_id: &str) -> Option<&Order> {
        self.orders
            .iter()
            .find(|o| o.transaction_id() == Some(transaction_id))
    }

    pub fn order_by_reference(&self, reference: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.reference() == reference)
    }

    pub fn push_order(&mut self, order: Order) -> Result<(), LedgerError> {
        if let Some(txid) = order.transaction_id() {
            if let Some(existing) = self.order_by_transaction_id(txid) {
                return Err(LedgerError::DuplicateTransaction {
                    transaction_id: txid.to_string(),
                    order_id: existing.id,
                });
            }
        }
        self.orders.push(order);
        Ok(())
    }

    /// Record the gateway transaction id on an order.
    ///
    /// Re-assigning the same id is a no-op; a different id is rejected.
    pub fn assign_transaction_id(
        &mut self,
        order_id: Uuid,
        transaction_id: &str,
    ) -> Result<(), LedgerError> {
        if let Some(other) = self.order_by_transaction_id(transaction_id) {
            if other.id != order_id {
                return Err(LedgerError::DuplicateTransaction {
                    transaction_id: transaction_id.to_string(),
                    order_id: other.id,
                });
            }
        }

        let order = self
            .order_mut(order_id)
            .ok_or(LedgerError::OrderNotFound(order_id))?;

        match order.transaction_id.as_deref() {
            Some(existing) if existing == transaction_id => Ok(()),
            Some(existing) => Err(LedgerError::TransactionIdImmutable {
                order_id,
                existing: existing.to_string(),
            }),
            None => {
                order.transaction_id = Some(transaction_id.to_string());
                Ok(())
            }
        }
    }

    /// Make `license` the only active license and point the account at it.
    pub fn activate_license(&mut self, license: License) {
        for existing in self.licenses.iter_mut().filter(|l| l.is_active) {
            existing.is_active = false;
        }

        self.account.package_id = Some(license.package_id.clone());
        self.account.gateway = license.gateway;
        self.account.subscription_id = license.gateway_subscription_id.clone();
        self.account.license_id = Some(license.id);
        self.account.is_subscribed = true;

        self.licenses.push(license);
    }

    pub fn complete_order(&mut self, order_id: Uuid, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let order = self
            .order_mut(order_id)
            .ok_or(LedgerError::OrderNotFound(order_id))?;
        order.transition(OrderStatus::Completed, now);
        Ok(())
    }

    pub fn fail_order(
        &mut self,
        order_id: Uuid,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let order = self
            .order_mut(order_id)
            .ok_or(LedgerError::OrderNotFound(order_id))?;
        order.metadata.failure_reason = Some(reason.into());
        order.transition(OrderStatus::Failed, now);
        Ok(())
    }

    /// Gateway confirmed billing has stopped.
    ///
    /// Deactivates every license, clears the account pointers, completes the
    /// scheduled cancellation and cancels whatever else was still open.
    /// Returns the number of orders moved to `canceled`.
    pub fn terminate_subscription(&mut self, now: DateTime<Utc>) -> usize {
        for license in self.licenses.iter_mut().filter(|l| l.is_active) {
            license.is_active = false;
        }
        self.account.clear_subscription();

        let mut canceled = 0;
        for order in self.orders.iter_mut() {
            match order.status {
                OrderStatus::CancellationScheduled => order.transition(OrderStatus::Completed, now),
                OrderStatus::Pending | OrderStatus::ScheduledDowngrade => {
                    order.transition(OrderStatus::Canceled, now);
                    canceled += 1;
                }
                _ => {}
            }
        }
        canceled
    }

    pub fn pending_cancellation(&self) -> Option<&Order> {
        self.orders
            .iter()
            .find(|o| o.status == OrderStatus::CancellationScheduled)
    }

    pub fn scheduled_downgrade(&self) -> Option<&Order> {
        self.orders
            .iter()
            .find(|o| o.status == OrderStatus::ScheduledDowngrade)
    }

    /// Scheduled downgrade that already ended billing at the gateway.
    ///
    /// Downgrades to a free package cancel the paid subscription when they
    /// are requested and record when billing stops.
    pub fn downgrade_ending_subscription(&self) -> Option<&Order> {
        self.scheduled_downgrade()
            .filter(|o| o.metadata.termination_date.is_some())
    }

    /// Whether billing is already set to stop, by cancellation or by a
    /// downgrade to a free package.
    pub fn is_terminating(&self) -> bool {
        self.pending_cancellation().is_some() || self.downgrade_ending_subscription().is_some()
    }

    /// A scheduled downgrade whose activation date has arrived.
    ///
    /// A missing activation date counts as due.
    pub fn due_scheduled_downgrade(&self, now: DateTime<Utc>) -> Option<&Order> {
        self.scheduled_downgrade().filter(|o| {
            o.metadata
                .scheduled_activation_date
                .map_or(true, |at| at <= now)
        })
    }

    /// A scheduled cancellation whose termination date has passed.
    ///
    /// Without a known termination date only the gateway's confirmation
    /// can end the subscription.
    pub fn due_cancellation(&self, now: DateTime<Utc>) -> Option<&Order> {
        self.pending_cancellation().filter(|o| {
            o.metadata
                .termination_date
                .is_some_and(|at| at <= now)
        })
    }

    /// Scheduled downgrade the sweep should activate now.
    ///
    /// Also due once the active license has lapsed, even if the recorded
    /// activation date is later.
    pub fn ready_downgrade(&self, now: DateTime<Utc>) -> Option<&Order> {
        let license_lapsed = self.active_license().is_some_and(|l| l.is_expired(now));
        self.due_scheduled_downgrade(now)
            .or_else(|| self.scheduled_downgrade().filter(|_| license_lapsed))
    }

    /// Whether the periodic sweep has work for this user.
    pub fn has_due_transition(&self, now: DateTime<Utc>) -> bool {
        self.ready_downgrade(now).is_some() || self.due_cancellation(now).is_some()
    }

    pub fn has_zero_amount_completed_order(&self) -> bool {
        self.orders
            .iter()
            .any(|o| o.is_completed() && o.amount.is_zero())
    }

    pub fn has_order_for_package_named(&self, name: &str) -> bool {
        self.orders
            .iter()
            .any(|o| o.package_name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderType, Package};
    use crate::gateway::GatewayKind;
    use chrono::Duration;
    use rust_decimal::Decimal;

    fn ledger() -> UserLedger {
        UserLedger::new(SubscriberAccount::new("user_1", "user@example.com"))
    }

    fn starter() -> Package {
        Package::new("starter", "Starter", Decimal::new(900, 2))
    }

    #[test]
    fn test_activate_license_deactivates_previous() {
        let now = Utc::now();
        let mut ledger = ledger();
        let first = License::issue("user_1", &starter(), Some(GatewayKind::Paddle), Some("S1".into()), now);
        let pro = Package::new("pro", "Pro", Decimal::new(2900, 2));
        let second = License::issue("user_1", &pro, Some(GatewayKind::Paddle), Some("S1".into()), now);
        let second_id = second.id;

        ledger.activate_license(first);
        ledger.activate_license(second);

        let active: Vec<_> = ledger.licenses.iter().filter(|l| l.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second_id);
        assert_eq!(ledger.account.package_id.as_deref(), Some("pro"));
        assert_eq!(ledger.account.license_id, Some(second_id));
        assert!(ledger.account.is_subscribed);
    }

    #[test]
    fn test_transaction_id_is_immutable() {
        let now = Utc::now();
        let mut ledger = ledger();
        let order = Order::new("user_1", &starter(), OrderType::New, Some(GatewayKind::FastSpring), now);
        let order_id = order.id;
        ledger.push_order(order).unwrap();

        ledger.assign_transaction_id(order_id, "T1").unwrap();
        ledger.assign_transaction_id(order_id, "T1").unwrap();

        let err = ledger.assign_transaction_id(order_id, "T2").unwrap_err();
        assert!(matches!(err, LedgerError::TransactionIdImmutable { .. }));
        assert_eq!(ledger.order(order_id).unwrap().transaction_id(), Some("T1"));
    }

    #[test]
    fn test_transaction_id_unique_per_user() {
        let now = Utc::now();
        let mut ledger = ledger();
        let first = Order::new("user_1", &starter(), OrderType::New, None, now);
        let second = Order::new("user_1", &starter(), OrderType::New, None, now);
        let (first_id, second_id) = (first.id, second.id);
        ledger.push_order(first).unwrap();
        ledger.push_order(second).unwrap();

        ledger.assign_transaction_id(first_id, "T1").unwrap();
        let err = ledger.assign_transaction_id(second_id, "T1").unwrap_err();
        assert_eq!(
            err,
            LedgerError::DuplicateTransaction {
                transaction_id: "T1".to_string(),
                order_id: first_id
            }
        );
    }

    #[test]
    fn test_terminate_subscription() {
        let now = Utc::now();
        let mut ledger = ledger();
        ledger.activate_license(License::issue("user_1", &starter(), Some(GatewayKind::Paddle), Some("S1".into()), now));

        let cancellation = Order::new("user_1", &starter(), OrderType::Cancellation, Some(GatewayKind::Paddle), now)
            .with_status(OrderStatus::CancellationScheduled);
        let pending = Order::new("user_1", &starter(), OrderType::Upgrade, Some(GatewayKind::Paddle), now);
        let completed = Order::new("user_1", &starter(), OrderType::New, Some(GatewayKind::Paddle), now)
            .with_status(OrderStatus::Completed);
        let ids = (cancellation.id, pending.id, completed.id);
        for order in [cancellation, pending, completed] {
            ledger.push_order(order).unwrap();
        }

        assert_eq!(ledger.terminate_subscription(now), 1);
        assert!(ledger.active_license().is_none());
        assert!(!ledger.account.is_subscribed);
        assert_eq!(ledger.account.package_id, None);
        assert_eq!(ledger.order(ids.0).unwrap().status, OrderStatus::Completed);
        assert_eq!(ledger.order(ids.1).unwrap().status, OrderStatus::Canceled);
        assert_eq!(ledger.order(ids.2).unwrap().status, OrderStatus::Completed);
    }

    #[test]
    fn test_due_scheduled_downgrade() {
        let now = Utc::now();
        let mut ledger = ledger();
        let mut order = Order::new("user_1", &Package::free("Free"), OrderType::Downgrade, None, now)
            .with_status(OrderStatus::ScheduledDowngrade);
        order.metadata.scheduled_activation_date = Some(now + Duration::days(3));
        ledger.push_order(order).unwrap();

        assert!(ledger.scheduled_downgrade().is_some());
        assert!(ledger.due_scheduled_downgrade(now).is_none());
        assert!(ledger.due_scheduled_downgrade(now + Duration::days(3)).is_some());
    }

    #[test]
    fn test_free_downgrade_with_termination_counts_as_terminating() {
        let now = Utc::now();
        let mut ledger = ledger();
        let mut order = Order::new("user_1", &Package::free("Free"), OrderType::Downgrade, None, now)
            .with_status(OrderStatus::ScheduledDowngrade);
        order.metadata.scheduled_activation_date = Some(now + Duration::days(3));
        let order_id = order.id;
        ledger.push_order(order).unwrap();
        assert!(!ledger.is_terminating());

        ledger.order_mut(order_id).unwrap().metadata.termination_date = Some(now + Duration::days(3));
        assert!(ledger.is_terminating());
        assert_eq!(ledger.downgrade_ending_subscription().map(|o| o.id), Some(order_id));
    }

    #[test]
    fn test_subscription_id_prefers_license() {
        let now = Utc::now();
        let mut ledger = ledger();
        ledger.account.subscription_id = Some("ACCOUNT".into());
        assert_eq!(ledger.subscription_id(), Some("ACCOUNT"));

        ledger.activate_license(License::issue("user_1", &starter(), Some(GatewayKind::Paddle), Some("LICENSE".into()), now));
        ledger.account.subscription_id = Some("STALE".into());
        assert_eq!(ledger.subscription_id(), Some("LICENSE"));
    }
}
