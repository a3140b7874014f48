//! Persistence for packages and per-user subscription state.
//!
//! All mutations go through [`SubscriptionStore::transact`], which hands the
//! caller the user's [`UserLedger`] under the user's lock and commits it only
//! if the closure returns `Ok`.

mod in_memory;
#[cfg(feature = "database")]
mod sea_orm_store;

pub use in_memory::InMemorySubscriptionStore;
#[cfg(feature = "database")]
pub use sea_orm_store::SeaOrmSubscriptionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Order, Package, SubscriberAccount, UserLedger};
use crate::error::{Result, TollwayError};
use crate::gateway::GatewayKind;

#[async_trait]
pub trait SubscriptionStore: Send + Sync + 'static {
    // Packages

    async fn get_package(&self, package_id: &str) -> Result<Option<Package>>;

    async fn find_package_by_name(&self, name: &str) -> Result<Option<Package>>;

    async fn list_packages(&self) -> Result<Vec<Package>>;

    async fn save_package(&self, package: &Package) -> Result<()>;

    // Accounts

    /// Insert the account if the user is unknown. Existing state is kept.
    async fn ensure_account(&self, account: &SubscriberAccount) -> Result<()>;

    async fn get_ledger(&self, user_id: &str) -> Result<Option<UserLedger>>;

    // Lookups used by webhook matching

    async fn find_order_by_transaction_id(
        &self,
        gateway: GatewayKind,
        transaction_id: &str,
    ) -> Result<Option<Order>>;

    async fn find_order_by_reference(&self, reference: &str) -> Result<Option<Order>>;

    /// User whose active license or account carries this subscription id.
    async fn find_user_by_subscription_id(
        &self,
        gateway: GatewayKind,
        subscription_id: &str,
    ) -> Result<Option<String>>;

    /// Users with a scheduled downgrade or cancellation that is due.
    async fn users_with_due_transitions(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

    /// Run `f` against the user's ledger under an exclusive lock.
    ///
    /// Changes are committed atomically when `f` returns `Ok` and discarded
    /// otherwise. Transaction ids must stay unique across all users; a commit
    /// that would violate this fails with [`TollwayError::Conflict`].
    async fn transact<T, E, F>(&self, user_id: &str, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut UserLedger) -> std::result::Result<T, E> + Send,
        T: Send,
        E: From<TollwayError> + Send;
}

/// First order in `ledger` whose transaction id is already claimed elsewhere.
pub(crate) fn conflicting_transaction<'a, I>(ledger: &UserLedger, others: I) -> Option<String>
where
    I: IntoIterator<Item = &'a Order>,
{
    let mut claimed = std::collections::HashSet::new();
    for order in others {
        if order.user_id != ledger.user_id() {
            if let (Some(gateway), Some(txid)) = (order.gateway, order.transaction_id()) {
                claimed.insert((gateway, txid.to_string()));
            }
        }
    }

    ledger.orders.iter().find_map(|order| match (order.gateway, order.transaction_id()) {
        (Some(gateway), Some(txid)) if claimed.contains(&(gateway, txid.to_string())) => {
            Some(txid.to_string())
        }
        _ => None,
    })
}
