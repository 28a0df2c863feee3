//! Wiring of the agent's concurrent cycles.
//!
//! ```text
//! control plane ──fetch──▶ [desired] ──reconcile──▶ [actual] ──report──▶ control plane
//!                                      (achiever)
//! collector ──collect──▶ (mpsc, 10) ──report──▶ reporter
//! ```
//!
//! `[..]` are coalescing queues. All five tasks share one cancellation token
//! and are joined together, so the agent only returns once every task has
//! observed cancellation.

use std::sync::Arc;

use anyhow::Result;
use tether_state::{coalescing, SuperController};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::client::ControlPlane;
use crate::config::AgentConfig;
use crate::fetch::run_fetch_loop;
use crate::metrics::{
    run_metrics_collect_loop, run_metrics_report_loop, MetricsCollector, MetricsReporter,
    METRICS_BUFFER,
};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::report::run_report_loop;

/// A fully wired node agent, ready to run.
pub struct Agent {
    config: AgentConfig,
    client: Arc<dyn ControlPlane>,
    collector: Arc<dyn MetricsCollector>,
    reporter: Arc<dyn MetricsReporter>,
    achiever: SuperController,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        client: Arc<dyn ControlPlane>,
        collector: Arc<dyn MetricsCollector>,
        reporter: Arc<dyn MetricsReporter>,
        achiever: SuperController,
    ) -> Self {
        Self {
            config,
            client,
            collector,
            reporter,
            achiever,
        }
    }

    /// Run every cycle until `cancel` fires.
    ///
    /// If a task dies (a panic, such as a missing microcontroller factory),
    /// the remaining tasks are cancelled and an error is returned once all
    /// of them have stopped.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (desired_tx, desired_rx) = coalescing::channel();
        let (actual_tx, actual_rx) = coalescing::channel();
        let (metrics_tx, metrics_rx) = mpsc::channel(METRICS_BUFFER);

        let reconciler = Reconciler::new(
            self.achiever,
            ReconcilerConfig {
                attempt_interval: self.config.attempt_interval,
            },
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(
            run_fetch_loop(Arc::clone(&self.client), desired_tx, cancel.clone())
                .instrument(info_span!("fetch")),
        );
        tasks.spawn(
            reconciler
                .run(desired_rx, actual_tx, cancel.clone())
                .instrument(info_span!("reconcile")),
        );
        tasks.spawn(
            run_report_loop(Arc::clone(&self.client), actual_rx, cancel.clone())
                .instrument(info_span!("report")),
        );
        tasks.spawn(
            run_metrics_collect_loop(
                self.collector,
                metrics_tx,
                self.config.metrics_interval,
                cancel.clone(),
            )
            .instrument(info_span!("metrics_collect")),
        );
        tasks.spawn(
            run_metrics_report_loop(self.reporter, metrics_rx, cancel.clone())
                .instrument(info_span!("metrics_report")),
        );

        info!(node_id = %self.config.node_id, tasks = tasks.len(), "Agent started");

        let mut failures = 0usize;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Agent task died, shutting down");
                failures += 1;
                cancel.cancel();
            }
        }

        info!("All agent tasks stopped");

        if failures > 0 {
            anyhow::bail!("{failures} agent task(s) died");
        }
        Ok(())
    }
}
