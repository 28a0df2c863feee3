//! Reconciliation loop for converging node state.
//!
//! The reconciler:
//! - Wakes on a new desired state or after the attempt interval
//! - Runs the state achiever against the latest desired state it knows
//! - Forwards the actual state to the report loop when it changed
//!
//! The interval wake-up is what retries failed attributes while the control
//! plane has nothing new to say.

use std::time::Duration;

use tether_state::{
    clamp_attempt_interval, ActualState, CoalescingReceiver, CoalescingSender, DesiredState,
    SuperController, DEFAULT_ATTEMPT_INTERVAL,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between passes when no desired state arrives. Zero means
    /// the default; other values are clamped by [`Reconciler::new`].
    pub attempt_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            attempt_interval: DEFAULT_ATTEMPT_INTERVAL,
        }
    }
}

/// Reconciler for converging node state.
pub struct Reconciler {
    /// Sole owner of the achiever; passes never overlap.
    achiever: SuperController,

    /// Configuration.
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(achiever: SuperController, mut config: ReconcilerConfig) -> Self {
        config.attempt_interval = clamp_attempt_interval(config.attempt_interval);
        Self { achiever, config }
    }

    /// Run the reconciliation loop until cancelled.
    pub async fn run(
        mut self,
        mut desired_rx: CoalescingReceiver<DesiredState>,
        actual_tx: CoalescingSender<ActualState>,
        cancel: CancellationToken,
    ) {
        info!(
            attempt_interval_ms = self.config.attempt_interval.as_millis() as u64,
            "Starting reconciliation loop"
        );

        let mut desired = DesiredState::new();
        let mut desired_open = true;

        // Publish the resumed state so the control plane sees it before the
        // first pass.
        let mut last_forwarded = self.achiever.actual().clone();
        actual_tx.send(last_forwarded.clone());

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = desired_rx.recv(), if desired_open => match next {
                    Some(next) => {
                        debug!(attributes = next.len(), "Received desired state");
                        desired = next;
                    }
                    None => {
                        info!("Desired-state queue closed, retrying on interval only");
                        desired_open = false;
                        continue;
                    }
                },
                _ = tokio::time::sleep(self.config.attempt_interval) => {
                    debug!("Attempt interval elapsed");
                }
            }

            let actual = self.reconcile(&desired, &cancel).await;
            if actual != last_forwarded {
                actual_tx.send(actual.clone());
                last_forwarded = actual;
            }
        }

        info!("Reconciler shutting down");
    }

    /// Perform a single reconciliation pass.
    async fn reconcile(&mut self, desired: &DesiredState, cancel: &CancellationToken) -> ActualState {
        let (actual, result) = self.achiever.achieve_state(cancel, desired).await;

        if let Err(errors) = result {
            warn!(
                failures = errors.len(),
                errors = %errors,
                "Reconciliation pass had failures"
            );
        } else if actual.achieves(desired) {
            debug!(attributes = desired.len(), "Desired state achieved");
        }

        actual
    }
}
