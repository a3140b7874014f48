//! Time-driven lifecycle transitions.

mod runner;

pub use runner::{RunnerHandle, ScheduledTransitionRunner, SweepReport};
