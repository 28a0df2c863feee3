//! Desired-state fetch loop.
//!
//! Polls the control plane back to back and forwards the desired state to
//! the reconciler only when it differs from the last one forwarded. The
//! client call itself is the only place the loop waits; pacing comes from
//! the control plane holding the request open.

use std::sync::Arc;

use tether_state::{CoalescingSender, DesiredState};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::ControlPlane;

/// Run the fetch loop until cancelled.
pub async fn run_fetch_loop(
    client: Arc<dyn ControlPlane>,
    desired_tx: CoalescingSender<DesiredState>,
    cancel: CancellationToken,
) {
    info!("Starting desired-state fetch loop");

    let mut last_forwarded: Option<DesiredState> = None;
    let mut consecutive_failures = 0u32;

    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            fetched = client.get_desired_state() => fetched,
        };

        match fetched {
            Ok(desired) => {
                consecutive_failures = 0;
                if last_forwarded.as_ref() != Some(&desired) {
                    debug!(attributes = desired.len(), "Desired state changed");
                    desired_tx.send(desired.clone());
                    last_forwarded = Some(desired);
                }
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                if consecutive_failures <= 3 {
                    warn!(error = %e, consecutive_failures, "Desired state fetch failed");
                } else if consecutive_failures.is_power_of_two() {
                    error!(
                        error = %e,
                        consecutive_failures,
                        "Desired state fetch failed repeatedly"
                    );
                } else {
                    debug!(error = %e, consecutive_failures, "Desired state fetch failed");
                }
            }
        }

        // Keep a client that answers instantly from starving other tasks.
        tokio::task::yield_now().await;
    }

    info!("Fetch loop shutting down");
}
