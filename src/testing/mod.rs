//! Test doubles for Tollway services
//!
//! Always compiled so integration tests and downstream crates can use them:
//! - [`MockGateway`]: scriptable adapter with a fixed webhook signature
//! - [`MockProvisioningClient`]: in-memory tenants and license code pools
//! - [`TestHarness`]: in-memory store, mocks and orchestrator wired together
//!
//! # Example
//!
//! ```rust
//! use tollway::gateway::GatewayKind;
//! use tollway::testing::TestHarness;
//!
//! #[tokio::main]
//! async fn main() {
//!     let harness = TestHarness::new(GatewayKind::Paddle);
//!     harness
//!         .subscribe("user_1", "starter", GatewayKind::Paddle, "sub_1", None)
//!         .await
//!         .unwrap();
//!
//!     harness.orchestrator.upgrade("user_1", "pro").await.unwrap();
//! }
//! ```

mod fixtures;
mod gateway;
mod provisioning;

pub use fixtures::{
    packages, product_bindings, DenyListGate, RecordingAuditSink, TestHarness, TestHarnessBuilder,
};
pub use gateway::{webhook_body, GatewayCall, MockGateway, MOCK_SIGNATURE_HEADER, MOCK_WEBHOOK_SIGNATURE};
pub use provisioning::MockProvisioningClient;
