use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{conflicting_transaction, SubscriptionStore};
use crate::domain::{Order, Package, SubscriberAccount, UserLedger};
use crate::error::{Result, TollwayError};
use crate::gateway::GatewayKind;

/// In-memory store for tests and single-process deployments.
///
/// A transaction holds the ledger map's write lock for the duration of the
/// (synchronous) closure, which serializes all writers.
#[derive(Clone, Default)]
pub struct InMemorySubscriptionStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    packages: RwLock<HashMap<String, Package>>,
    ledgers: RwLock<HashMap<String, UserLedger>>,
}

fn poisoned<T>(_: T) -> TollwayError {
    TollwayError::internal("subscription store lock poisoned")
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the catalogue.
    pub fn with_packages(self, packages: impl IntoIterator<Item = Package>) -> Self {
        if let Ok(mut map) = self.inner.packages.write() {
            for package in packages {
                map.insert(package.id.clone(), package);
            }
        }
        self
    }

    /// Replace a user's ledger wholesale. Intended for test setup.
    pub fn put_ledger(&self, ledger: UserLedger) -> Result<()> {
        self.inner
            .ledgers
            .write()
            .map_err(poisoned)?
            .insert(ledger.user_id().to_string(), ledger);
        Ok(())
    }

    fn find_order<P>(&self, predicate: P) -> Result<Option<Order>>
    where
        P: Fn(&Order) -> bool,
    {
        let ledgers = self.inner.ledgers.read().map_err(poisoned)?;
        Ok(ledgers
            .values()
            .flat_map(|l| l.orders.iter())
            .find(|o| predicate(*o))
            .cloned())
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get_package(&self, package_id: &str) -> Result<Option<Package>> {
        Ok(self.inner.packages.read().map_err(poisoned)?.get(package_id).cloned())
    }

    async fn find_package_by_name(&self, name: &str) -> Result<Option<Package>> {
        let packages = self.inner.packages.read().map_err(poisoned)?;
        Ok(packages
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn list_packages(&self) -> Result<Vec<Package>> {
        let packages = self.inner.packages.read().map_err(poisoned)?;
        let mut list: Vec<Package> = packages.values().cloned().collect();
        list.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn save_package(&self, package: &Package) -> Result<()> {
        self.inner
            .packages
            .write()
            .map_err(poisoned)?
            .insert(package.id.clone(), package.clone());
        Ok(())
    }

    async fn ensure_account(&self, account: &SubscriberAccount) -> Result<()> {
        self.inner
            .ledgers
            .write()
            .map_err(poisoned)?
            .entry(account.user_id.clone())
            .or_insert_with(|| UserLedger::new(account.clone()));
        Ok(())
    }

    async fn get_ledger(&self, user_id: &str) -> Result<Option<UserLedger>> {
        Ok(self.inner.ledgers.read().map_err(poisoned)?.get(user_id).cloned())
    }

    async fn find_order_by_transaction_id(
        &self,
        gateway: GatewayKind,
        transaction_id: &str,
    ) -> Result<Option<Order>> {
        self.find_order(|o| o.gateway == Some(gateway) && o.transaction_id() == Some(transaction_id))
    }

    async fn find_order_by_reference(&self, reference: &str) -> Result<Option<Order>> {
        self.find_order(|o| o.reference() == reference)
    }

    async fn find_user_by_subscription_id(
        &self,
        gateway: GatewayKind,
        subscription_id: &str,
    ) -> Result<Option<String>> {
        let ledgers = self.inner.ledgers.read().map_err(poisoned)?;
        Ok(ledgers
            .values()
            .find(|l| {
                l.licenses.iter().any(|lic| {
                    lic.gateway == Some(gateway)
                        && lic.gateway_subscription_id.as_deref() == Some(subscription_id)
                }) || (l.account.gateway == Some(gateway)
                    && l.account.subscription_id.as_deref() == Some(subscription_id))
            })
            .map(|l| l.user_id().to_string()))
    }

    async fn users_with_due_transitions(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let ledgers = self.inner.ledgers.read().map_err(poisoned)?;
        let mut users: Vec<String> = ledgers
            .values()
            .filter(|l| l.has_due_transition(now))
            .map(|l| l.user_id().to_string())
            .collect();
        users.sort();
        Ok(users)
    }

    async fn transact<T, E, F>(&self, user_id: &str, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut UserLedger) -> std::result::Result<T, E> + Send,
        T: Send,
        E: From<TollwayError> + Send,
    {
        let mut ledgers = self.inner.ledgers.write().map_err(|e| E::from(poisoned(e)))?;

        let mut working = ledgers
            .get(user_id)
            .cloned()
            .ok_or_else(|| E::from(TollwayError::not_found(format!("user '{}'", user_id))))?;

        let output = f(&mut working)?;

        let others = ledgers
            .values()
            .filter(|l| l.user_id() != user_id)
            .flat_map(|l| l.orders.iter());
        if let Some(txid) = conflicting_transaction(&working, others) {
            return Err(E::from(TollwayError::conflict(format!(
                "transaction id '{}' already belongs to another order",
                txid
            ))));
        }

        ledgers.insert(user_id.to_string(), working);
        Ok(output)
    }
}
