//! Subscription records: packages, orders, licenses and the per-user ledger.

mod account;
mod ledger;
mod license;
mod order;
mod package;

pub use account::SubscriberAccount;
pub use ledger::{LedgerError, UserLedger};
pub use license::{License, LicenseStatus};
pub use order::{Order, OrderMetadata, OrderStatus, OrderType};
pub use package::{Package, FREE_PACKAGE_NAME};
