//! Integration tests for the agent's cycles.
//!
//! These tests drive each loop against an in-memory control plane:
//! 1. Fetch forwards only changed desired states
//! 2. Report skips snapshots equal to the last successful report
//! 3. Reconcile retries failing attributes on its interval
//! 4. The full agent converges, reports and shuts down on cancellation

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tether_agent::fetch::run_fetch_loop;
use tether_agent::report::run_report_loop;
use tether_agent::{
    Agent, AgentConfig, ControlPlane, Metrics, MetricsReporter, ProcessMetricsCollector,
    Reconciler, ReconcilerConfig,
};
use tether_state::{
    coalescing, from_fn, AchieverConfig, ActualAttribute, ActualState, ActualStatus, AttrOffset,
    Attempt, AttributeKind, DesiredAttribute, DesiredState, Factories, StateFile,
    SuperController,
};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Control plane that replays scripted fetch results, then keeps answering
/// with a fixed desired state.
#[derive(Default)]
struct MockControlPlane {
    script: Mutex<VecDeque<Result<DesiredState>>>,
    steady: Mutex<DesiredState>,
    fetches: AtomicUsize,
    fail_reports: AtomicBool,
    report_calls: AtomicUsize,
    reported: Mutex<Vec<ActualState>>,
}

impl MockControlPlane {
    fn new(script: Vec<Result<DesiredState>>, steady: DesiredState) -> Self {
        Self {
            script: Mutex::new(script.into()),
            steady: Mutex::new(steady),
            ..Self::default()
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn reported(&self) -> Vec<ActualState> {
        self.reported.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn get_desired_state(&self) -> Result<DesiredState> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => {
                // Stand-in for the long-poll wait.
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(self.steady.lock().unwrap().clone())
            }
        }
    }

    async fn report_actual_state(&self, actual: &ActualState) -> Result<()> {
        self.report_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reports.load(Ordering::SeqCst) {
            return Err(anyhow!("control plane unavailable"));
        }
        self.reported.lock().unwrap().push(actual.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingReporter {
    seen: Mutex<Vec<Metrics>>,
}

#[async_trait]
impl MetricsReporter for RecordingReporter {
    async fn report_metrics(&self, metrics: &Metrics) -> Result<()> {
        self.seen.lock().unwrap().push(metrics.clone());
        Ok(())
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}

fn shell_state(offset: u64) -> DesiredState {
    [(
        "motd",
        DesiredAttribute::new(AttributeKind::Shell, AttrOffset(offset), "configure-motd"),
    )]
    .into_iter()
    .collect()
}

fn snapshot(attempt_num: u32) -> ActualState {
    [(
        "motd",
        ActualAttribute {
            offset: AttrOffset(1),
            attempt_num,
            status: ActualStatus::Finished,
            ..ActualAttribute::empty(AttributeKind::Shell)
        },
    )]
    .into_iter()
    .collect()
}

/// Shell factory whose worker counts calls and fails when `fail` is set.
fn counting_factories(calls: Arc<AtomicUsize>, fail: bool) -> Factories {
    Factories::new().with(AttributeKind::Shell, move || {
        let calls = Arc::clone(&calls);
        from_fn(move |_cancel, desired: DesiredAttribute| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Attempt::failed(ActualStatus::Pending, "", anyhow!("{} not found", desired.value))
                } else {
                    Attempt::finished(format!("ran {}", desired.value))
                }
            }
        })
    })
}

async fn achiever_in(dir: &tempfile::TempDir, factories: Factories) -> SuperController {
    SuperController::new(
        factories,
        AchieverConfig {
            state_path: dir.path().join("actual.json"),
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_fetch_forwards_only_changes() {
    let first = shell_state(1);
    let client = Arc::new(MockControlPlane::new(
        vec![
            Ok(first.clone()),
            Err(anyhow!("connection reset")),
            Ok(first.clone()),
        ],
        first.clone(),
    ));
    let (desired_tx, mut desired_rx) = coalescing::channel();
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(run_fetch_loop(client.clone(), desired_tx, cancel.clone()));

    assert_eq!(within(desired_rx.recv()).await, Some(first));

    let seen = client.fetches();
    wait_until(|| client.fetches() >= seen + 5).await;
    assert_eq!(desired_rx.try_recv(), None);

    // A new desired state is forwarded again.
    let second = shell_state(2);
    *client.steady.lock().unwrap() = second.clone();
    assert_eq!(within(desired_rx.recv()).await, Some(second));

    cancel.cancel();
    within(handle).await.unwrap();
}

#[tokio::test]
async fn test_fetch_stops_on_cancel() {
    let client = Arc::new(MockControlPlane::new(vec![], DesiredState::new()));
    let (desired_tx, _desired_rx) = coalescing::channel();
    let cancel = CancellationToken::new();
    cancel.cancel();

    within(run_fetch_loop(client.clone(), desired_tx, cancel)).await;
    assert_eq!(client.fetches(), 0);
}

#[tokio::test]
async fn test_report_skips_unchanged_snapshots() {
    let client = Arc::new(MockControlPlane::default());
    let (actual_tx, actual_rx) = coalescing::channel();
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(run_report_loop(client.clone(), actual_rx, cancel.clone()));

    actual_tx.send(snapshot(1));
    wait_until(|| client.reported().len() == 1).await;

    actual_tx.send(snapshot(1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.report_calls.load(Ordering::SeqCst), 1);

    actual_tx.send(snapshot(2));
    wait_until(|| client.reported().len() == 2).await;
    assert_eq!(client.reported(), vec![snapshot(1), snapshot(2)]);

    cancel.cancel();
    within(handle).await.unwrap();
}

#[tokio::test]
async fn test_report_resends_after_failure() {
    let client = Arc::new(MockControlPlane::default());
    client.fail_reports.store(true, Ordering::SeqCst);
    let (actual_tx, actual_rx) = coalescing::channel();
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(run_report_loop(client.clone(), actual_rx, cancel.clone()));

    actual_tx.send(snapshot(1));
    wait_until(|| client.report_calls.load(Ordering::SeqCst) == 1).await;

    // The same snapshot is reported again once the control plane is back.
    client.fail_reports.store(false, Ordering::SeqCst);
    actual_tx.send(snapshot(1));
    wait_until(|| client.reported().len() == 1).await;
    assert_eq!(client.reported(), vec![snapshot(1)]);

    cancel.cancel();
    within(handle).await.unwrap();
}

#[tokio::test]
async fn test_report_stops_when_queue_closes() {
    let client = Arc::new(MockControlPlane::default());
    let (actual_tx, actual_rx) = coalescing::channel::<ActualState>();
    drop(actual_tx);

    within(run_report_loop(client, actual_rx, CancellationToken::new())).await;
}

#[tokio::test]
async fn test_reconcile_retries_on_interval() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let achiever = achiever_in(&dir, counting_factories(calls.clone(), true)).await;
    let reconciler = Reconciler::new(
        achiever,
        ReconcilerConfig {
            attempt_interval: Duration::from_millis(20),
        },
    );

    let (desired_tx, desired_rx) = coalescing::channel();
    let (actual_tx, mut actual_rx) = coalescing::channel();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(reconciler.run(desired_rx, actual_tx, cancel.clone()));

    // The loaded (empty) state is published before any pass.
    assert_eq!(within(actual_rx.recv()).await, Some(ActualState::new()));

    // One desired state, then nothing new: retries come from the interval.
    desired_tx.send(shell_state(1));

    let mut last_attempt = 0;
    while last_attempt < 3 {
        let actual = within(actual_rx.recv()).await.unwrap();
        let motd = actual.get("motd").unwrap();
        assert!(motd.attempt_num > last_attempt, "each forwarded state is newer");
        assert_eq!(motd.error, "configure-motd not found");
        last_attempt = motd.attempt_num;
    }
    assert!(calls.load(Ordering::SeqCst) >= 3);

    cancel.cancel();
    within(handle).await.unwrap();
}

#[tokio::test]
async fn test_reconcile_zero_interval_does_not_spin() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let achiever = achiever_in(&dir, counting_factories(calls.clone(), true)).await;
    let reconciler = Reconciler::new(
        achiever,
        ReconcilerConfig {
            attempt_interval: Duration::ZERO,
        },
    );

    let (desired_tx, desired_rx) = coalescing::channel();
    let (actual_tx, _actual_rx) = coalescing::channel();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(reconciler.run(desired_rx, actual_tx, cancel.clone()));

    desired_tx.send(shell_state(1));
    wait_until(|| calls.load(Ordering::SeqCst) >= 1).await;

    // Zero falls back to the default interval, so the failing worker is
    // not retried within this window.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cancel.cancel();
    within(handle).await.unwrap();
}

#[tokio::test]
async fn test_reconcile_keeps_running_after_desired_queue_closes() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let achiever = achiever_in(&dir, counting_factories(calls.clone(), true)).await;
    let reconciler = Reconciler::new(
        achiever,
        ReconcilerConfig {
            attempt_interval: Duration::from_millis(10),
        },
    );

    let (desired_tx, desired_rx) = coalescing::channel();
    let (actual_tx, _actual_rx) = coalescing::channel();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(reconciler.run(desired_rx, actual_tx, cancel.clone()));

    desired_tx.send(shell_state(1));
    wait_until(|| calls.load(Ordering::SeqCst) >= 1).await;
    drop(desired_tx);

    let seen = calls.load(Ordering::SeqCst);
    wait_until(|| calls.load(Ordering::SeqCst) >= seen + 2).await;

    cancel.cancel();
    within(handle).await.unwrap();
}

#[tokio::test]
async fn test_agent_converges_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let achiever = achiever_in(&dir, counting_factories(calls.clone(), false)).await;
    let client = Arc::new(MockControlPlane::new(vec![], shell_state(1)));
    let reporter = Arc::new(RecordingReporter::default());

    let config = AgentConfig {
        state_path: dir.path().join("actual.json"),
        attempt_interval: Duration::from_millis(20),
        metrics_interval: Duration::from_millis(10),
        ..AgentConfig::default()
    };
    let agent = Agent::new(
        config,
        client.clone(),
        Arc::new(ProcessMetricsCollector::new()),
        reporter.clone(),
        achiever,
    );

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(agent.run(cancel.clone()));

    wait_until(|| {
        client.reported().iter().any(|actual| {
            actual
                .get("motd")
                .is_some_and(|motd| motd.status == ActualStatus::Finished)
        })
    })
    .await;
    wait_until(|| !reporter.seen.lock().unwrap().is_empty()).await;

    cancel.cancel();
    within(handle).await.unwrap().unwrap();

    // Converged once; later passes found nothing to do.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let persisted = StateFile::new(dir.path().join("actual.json")).load().await.unwrap();
    let motd = persisted.get("motd").unwrap();
    assert_eq!(motd.status, ActualStatus::Finished);
    assert_eq!(motd.info, "ran configure-motd");
}

#[tokio::test]
async fn test_agent_fails_when_a_task_dies() {
    let dir = tempfile::tempdir().unwrap();
    // No factory for the kind the control plane asks for.
    let achiever = achiever_in(&dir, Factories::new()).await;
    let desired: DesiredState = [(
        "sensor",
        DesiredAttribute::new(AttributeKind::Other(9), AttrOffset(1), "on"),
    )]
    .into_iter()
    .collect();
    let client = Arc::new(MockControlPlane::new(vec![], desired));

    let agent = Agent::new(
        AgentConfig {
            state_path: dir.path().join("actual.json"),
            attempt_interval: Duration::from_millis(20),
            ..AgentConfig::default()
        },
        client,
        Arc::new(ProcessMetricsCollector::new()),
        Arc::new(RecordingReporter::default()),
        achiever,
    );

    let cancel = CancellationToken::new();
    let err = within(agent.run(cancel.clone())).await.unwrap_err();
    assert!(err.to_string().contains("died"));
    assert!(cancel.is_cancelled());
}
