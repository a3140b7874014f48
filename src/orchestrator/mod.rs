//! Subscription lifecycle orchestration.
//!
//! [`SubscriptionOrchestrator`] is the only component that mutates
//! subscription state. It consults the [`GatewayPolicy`] table to decide
//! whether a change applies now, after payment, or at period end, runs
//! provisioning through the retry executor outside any store transaction,
//! and classifies every failure into a [`LifecycleError`].

mod audit;
mod error;
mod free_tier;
mod lifecycle;
mod policy;
mod provision;

pub use audit::{AuditSink, LifecycleAuditEvent, NoOpAuditSink, TracingAuditSink};
pub use error::{ErrorCategory, LifecycleError};
pub use free_tier::{
    free_tier_usage, AbuseDecision, AbuseGate, AllowAllGate, FreeTierSignal, RequestContext,
};
pub use lifecycle::{Completion, OrchestratorSettings, SubscriptionOrchestrator, TransitionOutcome};
pub use policy::{CancellationTiming, CheckoutModel, Execution, GatewayPolicy};
pub use provision::{Grant, Provisioner};
