//! Tollway - gateway-agnostic subscription lifecycle orchestration
//!
//! Tollway drives a subscriber through checkout, upgrade, downgrade,
//! cancellation and free-tier assignment across several payment gateways,
//! provisions tenants and license keys in an external system, and reconciles
//! asynchronous gateway webhooks idempotently.
//!
//! # Components
//!
//! - **Gateways**: one [`GatewayAdapter`] per vendor (FastSpring, Paddle, PayProGlobal)
//! - **Orchestrator**: the only writer of subscription state, driven by a
//!   per-gateway transition policy
//! - **Webhooks**: signature-verified reconciliation behind `POST /api/webhooks/:gateway`
//! - **Scheduler**: periodic activation of due downgrades and cancellations
//! - **Stores**: in-memory for tests, SeaORM behind the `database` feature
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tollway::{AllowAllGate, ConfigBuilder, InMemorySubscriptionStore, Tollway};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     tollway::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let store = Arc::new(InMemorySubscriptionStore::new());
//!     let app = Tollway::from_config(config, store, Arc::new(AllowAllGate))?;
//!
//!     app.serve().await?;
//!     Ok(())
//! }
//! ```

mod app;
pub mod config;
pub mod domain;
mod error;
pub mod gateway;
pub mod orchestrator;
pub mod provisioning;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod utils;
pub mod webhooks;

// Re-exports for public API
pub use app::Tollway;
pub use config::{Config, ConfigBuilder, LoggingConfig, ServerConfig};
pub use domain::{License, Order, OrderStatus, OrderType, Package, SubscriberAccount, UserLedger};
pub use error::{Result, TollwayError};
pub use gateway::{GatewayAdapter, GatewayEvent, GatewayKind, GatewayRegistry, ProductBindings};
pub use orchestrator::{
    AbuseGate, AllowAllGate, Completion, LifecycleError, RequestContext, SubscriptionOrchestrator,
    TransitionOutcome,
};
pub use provisioning::{HttpProvisioningClient, ProvisioningClient};
pub use retry::{RetryExecutor, RetryPolicy};
pub use scheduler::{RunnerHandle, ScheduledTransitionRunner};
#[cfg(feature = "database")]
pub use store::SeaOrmSubscriptionStore;
pub use store::{InMemorySubscriptionStore, SubscriptionStore};
pub use webhooks::{WebhookOutcome, WebhookReconciler};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults
///
/// Call once, early in `main()`.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "tollway::webhooks=debug")
/// - `TOLLWAY_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing from a loaded [`Config`]
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
