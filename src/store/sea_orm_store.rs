//! SeaORM-backed subscription storage.
//!
//! Works against PostgreSQL and SQLite. Call
//! [`ensure_schema`](SeaOrmSubscriptionStore::ensure_schema) once at startup
//! to create the tables if they are missing.
//!
//! # Example
//!
//! ```rust,ignore
//! use tollway::SeaOrmSubscriptionStore;
//!
//! let db = sea_orm::Database::connect(&database_url).await?;
//! let store = SeaOrmSubscriptionStore::new(db);
//! store.ensure_schema().await?;
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Index, OnConflict},
    ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Schema, Set, TransactionTrait,
};

use super::{conflicting_transaction, SubscriptionStore};
use crate::domain::{
    License, LicenseStatus, Order, OrderMetadata, OrderStatus, OrderType, Package, SubscriberAccount,
    UserLedger,
};
use crate::error::{Result, TollwayError};
use crate::gateway::GatewayKind;

// =============================================================================
// SeaORM Entities
// =============================================================================

mod entity {
    pub mod package {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "tollway_packages")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            pub name: String,
            /// Decimal rendered as text so both backends keep the exact scale.
            pub price: String,
            pub currency: String,
            pub duration_days: Option<i32>,
            pub license_sku: Option<String>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod account {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "tollway_accounts")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: String,
            pub email: String,
            pub package_id: Option<String>,
            pub gateway: Option<String>,
            pub subscription_id: Option<String>,
            pub license_id: Option<Uuid>,
            pub is_subscribed: bool,
            pub has_used_free_plan: bool,
            pub free_plan_used_at: Option<DateTimeUtc>,
            pub tenant_id: Option<String>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod license {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "tollway_licenses")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: Uuid,
            #[sea_orm(indexed)]
            pub user_id: String,
            /// Index within the user's ledger.
            pub position: i32,
            pub package_id: String,
            pub gateway: Option<String>,
            pub gateway_subscription_id: Option<String>,
            pub license_key: Option<String>,
            pub activated_at: DateTimeUtc,
            pub expires_at: Option<DateTimeUtc>,
            pub is_active: bool,
            pub status: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod order {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
        #[sea_orm(table_name = "tollway_orders")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: Uuid,
            #[sea_orm(indexed)]
            pub user_id: String,
            /// Index within the user's ledger.
            pub position: i32,
            pub package_id: String,
            pub package_name: String,
            pub gateway: Option<String>,
            pub amount: String,
            pub currency: String,
            pub status: String,
            pub order_type: String,
            pub transaction_id: Option<String>,
            #[sea_orm(unique)]
            pub reference: String,
            #[sea_orm(column_type = "Json")]
            pub metadata: Json,
            pub created_at: DateTimeUtc,
            pub updated_at: DateTimeUtc,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{account, license, order, package};

// =============================================================================
// Conversions
// =============================================================================

fn corrupt(what: &str, detail: impl std::fmt::Display) -> TollwayError {
    TollwayError::Database(format!("invalid stored {}: {}", what, detail))
}

fn parse_gateway(value: Option<String>) -> Result<Option<GatewayKind>> {
    value
        .map(|v| GatewayKind::from_str(&v).map_err(|e| corrupt("gateway", e)))
        .transpose()
}

fn to_position(index: usize) -> Result<i32> {
    i32::try_from(index).map_err(|_| corrupt("position", index))
}

fn model_to_package(model: package::Model) -> Result<Package> {
    let duration_days = model
        .duration_days
        .map(|d| u32::try_from(d).map_err(|_| corrupt("duration_days", d)))
        .transpose()?;

    Ok(Package {
        price: Decimal::from_str(&model.price).map_err(|e| corrupt("price", e))?,
        id: model.id,
        name: model.name,
        currency: model.currency,
        duration_days,
        license_sku: model.license_sku,
    })
}

fn package_to_active_model(package: &Package) -> Result<package::ActiveModel> {
    let duration_days = package
        .duration_days
        .map(|d| i32::try_from(d).map_err(|_| TollwayError::bad_request("duration_days out of range")))
        .transpose()?;

    Ok(package::ActiveModel {
        id: Set(package.id.clone()),
        name: Set(package.name.clone()),
        price: Set(package.price.to_string()),
        currency: Set(package.currency.clone()),
        duration_days: Set(duration_days),
        license_sku: Set(package.license_sku.clone()),
    })
}

fn model_to_account(model: account::Model) -> Result<SubscriberAccount> {
    Ok(SubscriberAccount {
        gateway: parse_gateway(model.gateway)?,
        user_id: model.user_id,
        email: model.email,
        package_id: model.package_id,
        subscription_id: model.subscription_id,
        license_id: model.license_id,
        is_subscribed: model.is_subscribed,
        has_used_free_plan: model.has_used_free_plan,
        free_plan_used_at: model.free_plan_used_at,
        tenant_id: model.tenant_id,
    })
}

fn account_to_active_model(account: &SubscriberAccount) -> account::ActiveModel {
    account::ActiveModel {
        user_id: Set(account.user_id.clone()),
        email: Set(account.email.clone()),
        package_id: Set(account.package_id.clone()),
        gateway: Set(account.gateway.map(|g| g.as_str().to_string())),
        subscription_id: Set(account.subscription_id.clone()),
        license_id: Set(account.license_id),
        is_subscribed: Set(account.is_subscribed),
        has_used_free_plan: Set(account.has_used_free_plan),
        free_plan_used_at: Set(account.free_plan_used_at),
        tenant_id: Set(account.tenant_id.clone()),
    }
}

fn model_to_license(model: license::Model) -> Result<License> {
    Ok(License {
        gateway: parse_gateway(model.gateway)?,
        status: LicenseStatus::from_str(&model.status).map_err(|e| corrupt("license status", e))?,
        id: model.id,
        user_id: model.user_id,
        package_id: model.package_id,
        gateway_subscription_id: model.gateway_subscription_id,
        license_key: model.license_key,
        activated_at: model.activated_at,
        expires_at: model.expires_at,
        is_active: model.is_active,
    })
}

fn license_to_active_model(license: &License, position: i32) -> license::ActiveModel {
    license::ActiveModel {
        id: Set(license.id),
        user_id: Set(license.user_id.clone()),
        position: Set(position),
        package_id: Set(license.package_id.clone()),
        gateway: Set(license.gateway.map(|g| g.as_str().to_string())),
        gateway_subscription_id: Set(license.gateway_subscription_id.clone()),
        license_key: Set(license.license_key.clone()),
        activated_at: Set(license.activated_at),
        expires_at: Set(license.expires_at),
        is_active: Set(license.is_active),
        status: Set(license.status.as_str().to_string()),
    }
}

fn model_to_order(model: order::Model) -> Result<Order> {
    let metadata: OrderMetadata =
        serde_json::from_value(model.metadata).map_err(|e| corrupt("order metadata", e))?;

    Ok(Order::restore(
        model.id,
        model.user_id,
        model.package_id,
        model.package_name,
        parse_gateway(model.gateway)?,
        Decimal::from_str(&model.amount).map_err(|e| corrupt("amount", e))?,
        model.currency,
        OrderStatus::from_str(&model.status).map_err(|e| corrupt("order status", e))?,
        OrderType::from_str(&model.order_type).map_err(|e| corrupt("order type", e))?,
        model.transaction_id,
        metadata,
        model.created_at,
        model.updated_at,
    ))
}

fn order_to_active_model(order: &Order, position: i32) -> Result<order::ActiveModel> {
    Ok(order::ActiveModel {
        id: Set(order.id),
        user_id: Set(order.user_id.clone()),
        position: Set(position),
        package_id: Set(order.package_id.clone()),
        package_name: Set(order.package_name.clone()),
        gateway: Set(order.gateway.map(|g| g.as_str().to_string())),
        amount: Set(order.amount.to_string()),
        currency: Set(order.currency.clone()),
        status: Set(order.status.as_str().to_string()),
        order_type: Set(order.order_type.as_str().to_string()),
        transaction_id: Set(order.transaction_id().map(str::to_string)),
        reference: Set(order.reference().to_string()),
        metadata: Set(serde_json::to_value(&order.metadata)?),
        created_at: Set(order.created_at),
        updated_at: Set(order.updated_at),
    })
}

// =============================================================================
// SeaOrmSubscriptionStore
// =============================================================================

/// Subscription store backed by a SeaORM connection.
///
/// [`transact`](SubscriptionStore::transact) runs inside a database
/// transaction and takes a row lock on the user's account (`SELECT ... FOR
/// UPDATE` on PostgreSQL; SQLite serializes writers on its own).
#[derive(Clone, Debug)]
pub struct SeaOrmSubscriptionStore {
    db: DatabaseConnection,
}

impl SeaOrmSubscriptionStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Create the tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);

        let tables = [
            schema.create_table_from_entity(package::Entity).if_not_exists().to_owned(),
            schema.create_table_from_entity(account::Entity).if_not_exists().to_owned(),
            schema.create_table_from_entity(license::Entity).if_not_exists().to_owned(),
            schema.create_table_from_entity(order::Entity).if_not_exists().to_owned(),
        ];
        for table in &tables {
            self.db.execute(backend.build(table)).await?;
        }

        // NULL transaction ids never collide, so pending orders are unaffected.
        let unique_transaction = Index::create()
            .if_not_exists()
            .name("idx_tollway_orders_gateway_transaction")
            .table(order::Entity)
            .col(order::Column::Gateway)
            .col(order::Column::TransactionId)
            .unique()
            .to_owned();
        self.db.execute(backend.build(&unique_transaction)).await?;

        tracing::debug!(target: "tollway::store", "Subscription schema ensured");
        Ok(())
    }

    async fn load_ledger<C>(conn: &C, account: account::Model) -> Result<UserLedger>
    where
        C: ConnectionTrait,
    {
        let licenses = license::Entity::find()
            .filter(license::Column::UserId.eq(account.user_id.as_str()))
            .order_by_asc(license::Column::Position)
            .all(conn)
            .await?;
        let orders = order::Entity::find()
            .filter(order::Column::UserId.eq(account.user_id.as_str()))
            .order_by_asc(order::Column::Position)
            .all(conn)
            .await?;

        let mut ledger = UserLedger::new(model_to_account(account)?);
        ledger.licenses = licenses.into_iter().map(model_to_license).collect::<Result<_>>()?;
        ledger.orders = orders.into_iter().map(model_to_order).collect::<Result<_>>()?;
        Ok(ledger)
    }

    /// Orders of other users claiming any of the ledger's transaction ids.
    async fn claimed_elsewhere(txn: &DatabaseTransaction, ledger: &UserLedger) -> Result<Vec<Order>> {
        let mut claimed = Vec::new();
        for order in &ledger.orders {
            let (Some(gateway), Some(txid)) = (order.gateway, order.transaction_id()) else {
                continue;
            };
            let found = order::Entity::find()
                .filter(order::Column::Gateway.eq(gateway.as_str()))
                .filter(order::Column::TransactionId.eq(txid))
                .filter(order::Column::UserId.ne(ledger.user_id()))
                .all(txn)
                .await?;
            for model in found {
                claimed.push(model_to_order(model)?);
            }
        }
        Ok(claimed)
    }

    /// Upsert every row of `after` that differs from `before`.
    async fn write_ledger(txn: &DatabaseTransaction, before: &UserLedger, after: &UserLedger) -> Result<()> {
        if before.account != after.account {
            account::Entity::insert(account_to_active_model(&after.account))
                .on_conflict(
                    OnConflict::column(account::Column::UserId)
                        .update_columns([
                            account::Column::Email,
                            account::Column::PackageId,
                            account::Column::Gateway,
                            account::Column::SubscriptionId,
                            account::Column::LicenseId,
                            account::Column::IsSubscribed,
                            account::Column::HasUsedFreePlan,
                            account::Column::FreePlanUsedAt,
                            account::Column::TenantId,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(txn)
                .await?;
        }

        for (index, license) in after.licenses.iter().enumerate() {
            if before.licenses.iter().any(|l| l == license) {
                continue;
            }
            license::Entity::insert(license_to_active_model(license, to_position(index)?))
                .on_conflict(
                    OnConflict::column(license::Column::Id)
                        .update_columns([
                            license::Column::Position,
                            license::Column::PackageId,
                            license::Column::Gateway,
                            license::Column::GatewaySubscriptionId,
                            license::Column::LicenseKey,
                            license::Column::ActivatedAt,
                            license::Column::ExpiresAt,
                            license::Column::IsActive,
                            license::Column::Status,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(txn)
                .await?;
        }

        for (index, order) in after.orders.iter().enumerate() {
            if before.orders.iter().any(|o| o == order) {
                continue;
            }
            order::Entity::insert(order_to_active_model(order, to_position(index)?)?)
                .on_conflict(
                    OnConflict::column(order::Column::Id)
                        .update_columns([
                            order::Column::Position,
                            order::Column::PackageId,
                            order::Column::PackageName,
                            order::Column::Gateway,
                            order::Column::Amount,
                            order::Column::Currency,
                            order::Column::Status,
                            order::Column::OrderType,
                            order::Column::TransactionId,
                            order::Column::Reference,
                            order::Column::Metadata,
                            order::Column::UpdatedAt,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(txn)
                .await?;
        }

        Ok(())
    }

    async fn find_order_where<F>(&self, filter: F) -> Result<Option<Order>>
    where
        F: FnOnce(sea_orm::Select<order::Entity>) -> sea_orm::Select<order::Entity>,
    {
        filter(order::Entity::find())
            .one(&self.db)
            .await?
            .map(model_to_order)
            .transpose()
    }
}

#[async_trait]
impl SubscriptionStore for SeaOrmSubscriptionStore {
    async fn get_package(&self, package_id: &str) -> Result<Option<Package>> {
        package::Entity::find_by_id(package_id.to_string())
            .one(&self.db)
            .await?
            .map(model_to_package)
            .transpose()
    }

    async fn find_package_by_name(&self, name: &str) -> Result<Option<Package>> {
        // Catalogues are small; match case-insensitively in memory.
        Ok(self
            .list_packages()
            .await?
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name)))
    }

    async fn list_packages(&self) -> Result<Vec<Package>> {
        let mut packages = package::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(model_to_package)
            .collect::<Result<Vec<_>>>()?;
        packages.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.id.cmp(&b.id)));
        Ok(packages)
    }

    async fn save_package(&self, package: &Package) -> Result<()> {
        package::Entity::insert(package_to_active_model(package)?)
            .on_conflict(
                OnConflict::column(package::Column::Id)
                    .update_columns([
                        package::Column::Name,
                        package::Column::Price,
                        package::Column::Currency,
                        package::Column::DurationDays,
                        package::Column::LicenseSku,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        tracing::debug!(target: "tollway::store", package_id = %package.id, "Saved package");
        Ok(())
    }

    async fn ensure_account(&self, account: &SubscriberAccount) -> Result<()> {
        let inserted = account::Entity::insert(account_to_active_model(account))
            .on_conflict(OnConflict::column(account::Column::UserId).do_nothing().to_owned())
            .exec_without_returning(&self.db)
            .await?;

        if inserted > 0 {
            tracing::debug!(target: "tollway::store", user_id = %account.user_id, "Created subscriber account");
        }
        Ok(())
    }

    async fn get_ledger(&self, user_id: &str) -> Result<Option<UserLedger>> {
        match account::Entity::find_by_id(user_id.to_string()).one(&self.db).await? {
            Some(account) => Ok(Some(Self::load_ledger(&self.db, account).await?)),
            None => Ok(None),
        }
    }

    async fn find_order_by_transaction_id(
        &self,
        gateway: GatewayKind,
        transaction_id: &str,
    ) -> Result<Option<Order>> {
        self.find_order_where(|q| {
            q.filter(order::Column::Gateway.eq(gateway.as_str()))
                .filter(order::Column::TransactionId.eq(transaction_id))
        })
        .await
    }

    async fn find_order_by_reference(&self, reference: &str) -> Result<Option<Order>> {
        self.find_order_where(|q| q.filter(order::Column::Reference.eq(reference)))
            .await
    }

    async fn find_user_by_subscription_id(
        &self,
        gateway: GatewayKind,
        subscription_id: &str,
    ) -> Result<Option<String>> {
        let license = license::Entity::find()
            .filter(license::Column::Gateway.eq(gateway.as_str()))
            .filter(license::Column::GatewaySubscriptionId.eq(subscription_id))
            .one(&self.db)
            .await?;
        if let Some(license) = license {
            return Ok(Some(license.user_id));
        }

        Ok(account::Entity::find()
            .filter(account::Column::Gateway.eq(gateway.as_str()))
            .filter(account::Column::SubscriptionId.eq(subscription_id))
            .one(&self.db)
            .await?
            .map(|a| a.user_id))
    }

    async fn users_with_due_transitions(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let candidates: Vec<String> = order::Entity::find()
            .select_only()
            .column(order::Column::UserId)
            .filter(order::Column::Status.is_in([
                OrderStatus::ScheduledDowngrade.as_str(),
                OrderStatus::CancellationScheduled.as_str(),
            ]))
            .distinct()
            .into_tuple::<String>()
            .all(&self.db)
            .await?;

        let mut users = Vec::new();
        for user_id in candidates {
            if let Some(ledger) = self.get_ledger(&user_id).await? {
                if ledger.has_due_transition(now) {
                    users.push(user_id);
                }
            }
        }
        users.sort();
        Ok(users)
    }

    async fn transact<T, E, F>(&self, user_id: &str, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut UserLedger) -> std::result::Result<T, E> + Send,
        T: Send,
        E: From<TollwayError> + Send,
    {
        let txn = self.db.begin().await.map_err(|e| E::from(TollwayError::from(e)))?;

        let account = account::Entity::find_by_id(user_id.to_string())
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(|e| E::from(TollwayError::from(e)))?;
        let Some(account) = account else {
            let _ = txn.rollback().await;
            return Err(E::from(TollwayError::not_found(format!("user '{}'", user_id))));
        };

        let before = Self::load_ledger(&txn, account).await.map_err(E::from)?;
        let mut working = before.clone();

        let output = match f(&mut working) {
            Ok(output) => output,
            Err(err) => {
                let _ = txn.rollback().await;
                return Err(err);
            }
        };

        if working != before {
            let others = Self::claimed_elsewhere(&txn, &working).await.map_err(E::from)?;
            if let Some(txid) = conflicting_transaction(&working, &others) {
                let _ = txn.rollback().await;
                return Err(E::from(TollwayError::conflict(format!(
                    "transaction id '{}' already belongs to another order",
                    txid
                ))));
            }

            Self::write_ledger(&txn, &before, &working)
                .await
                .map_err(E::from)?;
        }

        txn.commit().await.map_err(|e| E::from(TollwayError::from(e)))?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ConnectOptions, Database};

    async fn store() -> SeaOrmSubscriptionStore {
        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1).sqlx_logging(false);
        let db = Database::connect(options).await.unwrap();

        let store = SeaOrmSubscriptionStore::new(db);
        store.ensure_schema().await.unwrap();
        for package in [
            Package::new("starter", "Starter", Decimal::new(900, 2)).with_license_sku("STARTER"),
            Package::free("Free"),
        ] {
            store.save_package(&package).await.unwrap();
        }
        store
    }

    async fn with_user(store: &SeaOrmSubscriptionStore, user_id: &str) {
        store
            .ensure_account(&SubscriberAccount::new(user_id, format!("{}@example.com", user_id)))
            .await
            .unwrap();
    }

    fn place_order(
        package: Package,
        txid: &'static str,
    ) -> impl FnOnce(&mut UserLedger) -> std::result::Result<uuid::Uuid, TollwayError> + Send {
        move |ledger| {
            let order = Order::new(
                ledger.user_id(),
                &package,
                OrderType::New,
                Some(GatewayKind::Paddle),
                Utc::now(),
            );
            let id = order.id;
            ledger.push_order(order).map_err(|e| TollwayError::conflict(e.to_string()))?;
            ledger
                .assign_transaction_id(id, txid)
                .map_err(|e| TollwayError::conflict(e.to_string()))?;
            Ok(id)
        }
    }

    #[test]
    fn test_package_conversion_keeps_decimal_scale() {
        let package = Package::new("pro", "Pro", Decimal::new(2900, 2));
        let model = package::Model {
            id: "pro".into(),
            name: "Pro".into(),
            price: package.price.to_string(),
            currency: "USD".into(),
            duration_days: Some(30),
            license_sku: None,
        };

        assert_eq!(model.price, "29.00");
        assert_eq!(model_to_package(model).unwrap(), package);
    }

    #[test]
    fn test_corrupt_rows_are_rejected() {
        let model = package::Model {
            id: "x".into(),
            name: "X".into(),
            price: "not-a-number".into(),
            currency: "USD".into(),
            duration_days: Some(-1),
            license_sku: None,
        };
        assert!(matches!(model_to_package(model), Err(TollwayError::Database(_))));
        assert!(parse_gateway(Some("stripe".into())).is_err());
        assert_eq!(parse_gateway(Some("paddle".into())).unwrap(), Some(GatewayKind::Paddle));
    }

    #[tokio::test]
    async fn test_catalogue_round_trip() {
        let store = store().await;

        let packages = store.list_packages().await.unwrap();
        assert_eq!(packages.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), ["free", "starter"]);

        let free = store.find_package_by_name("FREE").await.unwrap().unwrap();
        assert!(free.is_free());
        assert_eq!(free.duration_days, None);
    }

    #[tokio::test]
    async fn test_ensure_account_keeps_existing_state() {
        let store = store().await;
        with_user(&store, "user_1").await;

        store
            .transact("user_1", |ledger| {
                ledger.account.tenant_id = Some("tenant-1".into());
                Ok::<_, TollwayError>(())
            })
            .await
            .unwrap();
        with_user(&store, "user_1").await;

        let ledger = store.get_ledger("user_1").await.unwrap().unwrap();
        assert_eq!(ledger.account.tenant_id.as_deref(), Some("tenant-1"));
    }

    #[tokio::test]
    async fn test_transact_persists_orders_and_rolls_back_on_err() {
        let store = store().await;
        with_user(&store, "user_1").await;
        let starter = store.get_package("starter").await.unwrap().unwrap();

        let order_id = store.transact("user_1", place_order(starter.clone(), "txn_1")).await.unwrap();

        let result: std::result::Result<(), TollwayError> = store
            .transact("user_1", |ledger| {
                ledger.account.is_subscribed = true;
                Err(TollwayError::bad_request("nope"))
            })
            .await;
        assert!(result.is_err());

        let ledger = store.get_ledger("user_1").await.unwrap().unwrap();
        assert!(!ledger.account.is_subscribed);
        assert_eq!(ledger.orders.len(), 1);
        assert_eq!(ledger.orders[0].id, order_id);

        let found = store
            .find_order_by_transaction_id(GatewayKind::Paddle, "txn_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, ledger.orders[0]);
        let by_reference = store.find_order_by_reference(found.reference()).await.unwrap();
        assert_eq!(by_reference.map(|o| o.id), Some(order_id));
        assert!(store
            .find_order_by_transaction_id(GatewayKind::FastSpring, "txn_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_transaction_id_unique_across_users() {
        let store = store().await;
        with_user(&store, "user_1").await;
        with_user(&store, "user_2").await;
        let starter = store.get_package("starter").await.unwrap().unwrap();

        store.transact("user_1", place_order(starter.clone(), "txn_1")).await.unwrap();
        let result = store.transact("user_2", place_order(starter, "txn_1")).await;

        assert!(matches!(result, Err(TollwayError::Conflict(_))));
        assert!(store.get_ledger("user_2").await.unwrap().unwrap().orders.is_empty());
    }

    #[tokio::test]
    async fn test_subscription_lookup_and_unknown_user() {
        let store = store().await;
        with_user(&store, "user_1").await;
        let starter = store.get_package("starter").await.unwrap().unwrap();

        store
            .transact("user_1", move |ledger| {
                let license = License::issue(
                    "user_1",
                    &starter,
                    Some(GatewayKind::FastSpring),
                    Some("sub_1".into()),
                    Utc::now(),
                );
                ledger.activate_license(license);
                Ok::<_, TollwayError>(())
            })
            .await
            .unwrap();

        let user = store
            .find_user_by_subscription_id(GatewayKind::FastSpring, "sub_1")
            .await
            .unwrap();
        assert_eq!(user.as_deref(), Some("user_1"));
        assert!(store
            .find_user_by_subscription_id(GatewayKind::Paddle, "sub_1")
            .await
            .unwrap()
            .is_none());

        let missing: std::result::Result<(), TollwayError> = store.transact("ghost", |_| Ok(())).await;
        assert!(matches!(missing, Err(TollwayError::NotFound(_))));
        assert!(store.users_with_due_transitions(Utc::now()).await.unwrap().is_empty());
    }
}
