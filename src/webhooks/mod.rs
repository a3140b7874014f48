//! Inbound gateway notifications.
//!
//! [`WebhookReconciler`] verifies, parses and applies payment, renewal and
//! cancellation events; [`webhook_router`] mounts it over HTTP.

mod reconciler;
mod routes;

pub use reconciler::{WebhookOutcome, WebhookReconciler};
pub use routes::webhook_router;
