//! Metrics collection and reporting cycles.
//!
//! Runs independently of state reconciliation with the same shape: a
//! collect loop on an idle interval feeds a small buffered channel, and a
//! report loop drains it. The collaborators here are deliberately simple;
//! the cycle plumbing is what the agent depends on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the channel between the collect and report loops.
pub const METRICS_BUFFER: usize = 10;

/// One metrics sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    /// Unix milliseconds of the collection.
    pub collected_at_ms: i64,
    pub values: BTreeMap<String, f64>,
}

#[async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn collect_metrics(&self) -> Result<Metrics>;
}

#[async_trait]
pub trait MetricsReporter: Send + Sync {
    async fn report_metrics(&self, metrics: &Metrics) -> Result<()>;
}

/// Collects agent process metrics (uptime and collection count).
pub struct ProcessMetricsCollector {
    started_at: Instant,
    collections: AtomicU64,
}

impl ProcessMetricsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            collections: AtomicU64::new(0),
        }
    }
}

impl Default for ProcessMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsCollector for ProcessMetricsCollector {
    async fn collect_metrics(&self) -> Result<Metrics> {
        let collections = self.collections.fetch_add(1, Ordering::Relaxed) + 1;
        let values = BTreeMap::from([
            (
                "agent_uptime_seconds".to_string(),
                self.started_at.elapsed().as_secs_f64(),
            ),
            ("metrics_collections_total".to_string(), collections as f64),
        ]);

        Ok(Metrics {
            collected_at_ms: chrono::Utc::now().timestamp_millis(),
            values,
        })
    }
}

/// Reports metrics as structured log events.
#[derive(Debug, Default)]
pub struct LogMetricsReporter;

#[async_trait]
impl MetricsReporter for LogMetricsReporter {
    async fn report_metrics(&self, metrics: &Metrics) -> Result<()> {
        info!(
            collected_at_ms = metrics.collected_at_ms,
            values = %serde_json::to_string(&metrics.values)?,
            "Metrics"
        );
        Ok(())
    }
}

/// Collect metrics every `interval` until cancelled.
///
/// Samples that do not fit in the buffer are dropped.
pub async fn run_metrics_collect_loop(
    collector: Arc<dyn MetricsCollector>,
    metrics_tx: mpsc::Sender<Metrics>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(
        interval_secs = interval.as_secs(),
        "Starting metrics collect loop"
    );

    let mut interval_timer = tokio::time::interval(interval);
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval_timer.tick() => {}
        }

        let metrics = match collector.collect_metrics().await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(error = %e, "Metrics collection failed");
                continue;
            }
        };

        match metrics_tx.try_send(metrics) {
            Ok(()) => debug!("Metrics queued"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(capacity = METRICS_BUFFER, "Metrics buffer full, dropping sample");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                info!("Metrics reporter gone");
                break;
            }
        }
    }

    info!("Metrics collect loop shutting down");
}

/// Report buffered metrics until cancelled, then flush what is left.
pub async fn run_metrics_report_loop(
    reporter: Arc<dyn MetricsReporter>,
    mut metrics_rx: mpsc::Receiver<Metrics>,
    cancel: CancellationToken,
) {
    info!("Starting metrics report loop");

    loop {
        let metrics = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = metrics_rx.recv() => match next {
                Some(metrics) => metrics,
                None => break,
            },
        };

        if let Err(e) = reporter.report_metrics(&metrics).await {
            warn!(error = %e, "Metrics report failed");
        }
    }

    let mut flushed = 0usize;
    while let Ok(metrics) = metrics_rx.try_recv() {
        if let Err(e) = reporter.report_metrics(&metrics).await {
            warn!(error = %e, "Metrics report failed during flush");
        }
        flushed += 1;
    }

    info!(flushed, "Metrics report loop shutting down");
}
