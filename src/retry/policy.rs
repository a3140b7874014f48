use std::time::Duration;

/// Failure that knows whether retrying can help.
pub trait Retryable {
    /// `true` when the failure should be shown to the user right away and
    /// the remaining attempts must not be spent.
    fn is_terminal(&self) -> bool;
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    /// Terminal failure; stop without consuming further attempts.
    Abort,
    /// Attempt budget spent.
    GiveUp,
}

/// Decide the next step from the attempt that just failed (1-based).
pub fn next_action<E, B>(attempt: u32, max_attempts: u32, error: &E, backoff: B) -> RetryDecision
where
    E: Retryable + ?Sized,
    B: Fn(u32) -> Duration,
{
    if error.is_terminal() {
        RetryDecision::Abort
    } else if attempt >= max_attempts {
        RetryDecision::GiveUp
    } else {
        RetryDecision::RetryAfter(backoff(attempt))
    }
}

/// Bounded retry with linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_unit: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_unit,
        }
    }

    /// `attempt × backoff_unit`.
    pub fn linear_backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }

    pub fn next_action<E: Retryable + ?Sized>(&self, attempt: u32, error: &E) -> RetryDecision {
        next_action(attempt, self.max_attempts, error, |a| self.linear_backoff(a))
    }
}
