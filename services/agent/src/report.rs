//! Actual-state report loop.
//!
//! Waits for actual-state snapshots from the reconciler and reports each one
//! that differs from the last successful report. A failed report is not
//! retried here; the next snapshot carries the same information.

use std::sync::Arc;

use tether_state::{ActualState, CoalescingReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ControlPlane;

/// Run the report loop until cancelled or the reconciler goes away.
pub async fn run_report_loop(
    client: Arc<dyn ControlPlane>,
    mut actual_rx: CoalescingReceiver<ActualState>,
    cancel: CancellationToken,
) {
    info!("Starting actual-state report loop");

    let mut last_reported: Option<ActualState> = None;

    loop {
        let actual = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = actual_rx.recv() => match next {
                Some(actual) => actual,
                None => {
                    info!("Actual-state queue closed");
                    break;
                }
            },
        };

        if last_reported.as_ref() == Some(&actual) {
            debug!("Actual state unchanged since last report");
            continue;
        }

        let reported = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            reported = client.report_actual_state(&actual) => reported,
        };

        match reported {
            Ok(()) => {
                debug!(attributes = actual.len(), "Actual state reported");
                last_reported = Some(actual);
            }
            Err(e) => warn!(error = %e, "Actual state report failed"),
        }
    }

    info!("Report loop shutting down");
}
