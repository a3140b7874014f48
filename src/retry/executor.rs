use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::policy::{next_action, RetryDecision, RetryPolicy, Retryable};

/// Why a retried operation ultimately failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    Terminal { error: E, attempts: u32 },
    Exhausted { error: E, attempts: u32 },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminal { error, .. } => write!(f, "{}", error),
            Self::Exhausted { error, attempts } => {
                write!(f, "gave up after {} attempts: {}", attempts, error)
            }
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for RetryError<E> {}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Terminal { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }

    pub fn error(&self) -> &E {
        match self {
            Self::Terminal { error, .. } | Self::Exhausted { error, .. } => error,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Terminal { error, .. } | Self::Exhausted { error, .. } => error,
        }
    }
}

/// Runs fallible async operations under a [`RetryPolicy`].
///
/// Backoff waits are `tokio` sleeps, so they park the task rather than a
/// thread. Callers must not hold locks or open transactions across
/// [`RetryExecutor::execute`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry `op` under the configured policy.
    pub async fn execute<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let policy = self.policy;
        self.execute_with(operation, op, policy.max_attempts, move |a| policy.linear_backoff(a))
            .await
    }

    /// Retry `op` with an explicit attempt budget and backoff function.
    pub async fn execute_with<T, E, F, Fut, B>(
        &self,
        operation: &str,
        mut op: F,
        max_attempts: u32,
        backoff: B,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
        B: Fn(u32) -> Duration,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            match next_action(attempt, max_attempts, &error, &backoff) {
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        target: "tollway::retry",
                        operation = operation,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Abort => {
                    tracing::debug!(
                        target: "tollway::retry",
                        operation = operation,
                        attempt = attempt,
                        error = %error,
                        "Terminal failure, not retrying"
                    );
                    return Err(RetryError::Terminal { error, attempts: attempt });
                }
                RetryDecision::GiveUp => {
                    tracing::warn!(
                        target: "tollway::retry",
                        operation = operation,
                        attempts = attempt,
                        error = %error,
                        "Retry budget exhausted"
                    );
                    return Err(RetryError::Exhausted { error, attempts: attempt });
                }
            }
        }
    }

    /// Run the retry loop on its own task.
    pub fn spawn<T, E, F, Fut>(&self, operation: impl Into<String>, op: F) -> JoinHandle<Result<T, RetryError<E>>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Retryable + fmt::Display + Send + 'static,
        T: Send + 'static,
    {
        let executor = *self;
        let operation = operation.into();
        tokio::spawn(async move { executor.execute(&operation, op).await })
    }
}
