//! Bounded retry with linear backoff.
//!
//! The decision of what to do after a failure is a pure function of the
//! attempt number and the error ([`next_action`]); [`RetryExecutor`] only
//! supplies the async loop around it.

mod executor;
mod policy;

pub use executor::{RetryError, RetryExecutor};
pub use policy::{next_action, RetryDecision, RetryPolicy, Retryable};
