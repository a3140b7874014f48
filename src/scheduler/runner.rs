use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::orchestrator::{LifecycleError, SubscriptionOrchestrator, TransitionOutcome};
use crate::store::SubscriptionStore;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub users: usize,
    pub activated: usize,
    pub canceled: usize,
    pub failed: usize,
}

/// Periodic sweep that activates due scheduled downgrades and finalises due
/// cancellations.
///
/// Downgrades go through the same completion path as a payment webhook; no
/// gateway is contacted.
pub struct ScheduledTransitionRunner<S: SubscriptionStore> {
    orchestrator: Arc<SubscriptionOrchestrator<S>>,
}

impl<S: SubscriptionStore> ScheduledTransitionRunner<S> {
    pub fn new(orchestrator: Arc<SubscriptionOrchestrator<S>>) -> Self {
        Self { orchestrator }
    }

    /// Process every user with work due at `now`.
    ///
    /// A failure for one user is logged and counted; the sweep moves on.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport, LifecycleError> {
        let users = self
            .orchestrator
            .store()
            .users_with_due_transitions(now)
            .await?;

        let mut report = SweepReport {
            users: users.len(),
            ..SweepReport::default()
        };

        for user_id in users {
            match self.orchestrator.process_due_transitions(&user_id, now).await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome {
                            TransitionOutcome::Activated { .. } => report.activated += 1,
                            TransitionOutcome::Canceled { .. } => report.canceled += 1,
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        target: "tollway::scheduler",
                        user_id = %user_id,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Scheduled transition failed"
                    );
                }
            }
        }

        if report.users > 0 {
            tracing::info!(
                target: "tollway::scheduler",
                users = report.users,
                activated = report.activated,
                canceled = report.canceled,
                failed = report.failed,
                "Sweep finished"
            );
        }
        Ok(report)
    }

    /// Run the sweep every `interval` on a background task until shutdown.
    pub fn spawn(self, interval: Duration) -> RunnerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move {
            tracing::info!(
                target: "tollway::scheduler",
                interval_secs = interval.as_secs(),
                "Scheduled transition runner started"
            );
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once(Utc::now()).await {
                            tracing::error!(
                                target: "tollway::scheduler",
                                error = %e,
                                "Sweep failed"
                            );
                        }
                    }
                }
            }

            tracing::info!(target: "tollway::scheduler", "Scheduled transition runner stopped");
        });

        RunnerHandle {
            handle,
            shutdown_tx,
        }
    }
}

/// Handle to a spawned runner.
pub struct RunnerHandle {
    handle: JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RunnerHandle {
    /// Stop the loop and wait for an in-progress sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
