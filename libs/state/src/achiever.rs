//! The state achiever: converts a desired-state snapshot into actual-state
//! updates.
//!
//! For every due attribute that the cached actual state does not already
//! achieve, the achiever invokes the attribute's microcontroller, records the
//! outcome with attempt bookkeeping and persists the whole actual-state
//! document. Failures are collected per attribute; one failing attribute
//! never stops the others.
//!
//! # Attempt bookkeeping
//!
//! - A new offset is a new work item: `AttemptNum` restarts at 1.
//! - The same offset after a recorded error is a retry: `AttemptNum` + 1.
//!
//! The document is persisted after each attribute update rather than once
//! per pass, so every attribute's outcome is durable on its own.

use std::path::PathBuf;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AchieveErrors, AttributeError, StoreError};
use crate::model::{ActualAttribute, ActualState, DesiredState};
use crate::registry::{Factories, Registry};
use crate::store::{StateFile, DEFAULT_STATE_FILE};

/// Achiever construction parameters.
#[derive(Debug, Clone)]
pub struct AchieverConfig {
    /// Where the actual-state document lives.
    pub state_path: PathBuf,
}

impl Default for AchieverConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from(DEFAULT_STATE_FILE),
        }
    }
}

/// Reconciles desired state into actual state.
///
/// Calls take `&mut self`: one reconciliation pass at a time, owned by a
/// single task.
#[derive(Debug)]
pub struct SuperController {
    registry: Registry,
    store: StateFile,
    actual: ActualState,
}

impl SuperController {
    /// Create an achiever, resuming from the persisted actual state.
    ///
    /// A missing state file starts from empty state; any other read or parse
    /// failure is returned, since the agent must not run on unknown state.
    pub async fn new(factories: Factories, config: AchieverConfig) -> Result<Self, StoreError> {
        let store = StateFile::new(config.state_path);
        let actual = store.load().await?;

        info!(
            path = %store.path().display(),
            attributes = actual.len(),
            "Loaded actual state"
        );

        Ok(Self {
            registry: Registry::new(factories),
            store,
            actual,
        })
    }

    /// Current actual state.
    pub fn actual(&self) -> &ActualState {
        &self.actual
    }

    /// Run one reconciliation pass against `desired`.
    ///
    /// Always returns the full actual state, including attributes that
    /// failed in this pass; the error lists every failure.
    ///
    /// # Panics
    ///
    /// Panics if a due, unachieved attribute has a kind with no registered
    /// factory (see [`Registry::get_or_create`]).
    pub async fn achieve_state(
        &mut self,
        cancel: &CancellationToken,
        desired: &DesiredState,
    ) -> (ActualState, Result<(), AchieveErrors>) {
        let mut errors = AchieveErrors::default();

        for (id, want) in desired.iter() {
            if cancel.is_cancelled() {
                debug!("Reconciliation pass cancelled");
                break;
            }

            if !want.is_due(Utc::now()) {
                debug!(id, schedule_time = ?want.schedule_time, "Attribute not due yet");
                continue;
            }

            let mut current = self
                .actual
                .get(id)
                .cloned()
                .unwrap_or_else(|| ActualAttribute::empty(want.kind));

            if current.offset != want.offset {
                current.attempt_num = 1;
            } else if current.failed() {
                current.attempt_num = current.attempt_num.saturating_add(1);
            }

            if current.achieves(want) {
                continue;
            }

            info!(
                id,
                kind = %want.kind,
                offset = %want.offset,
                attempt = current.attempt_num,
                "Achieving attribute"
            );

            let attempt = self
                .registry
                .get_or_create(want.kind, id)
                .achieve(cancel, want)
                .await;

            current.kind = want.kind;
            current.offset = want.offset;
            current.time_ms = Utc::now().timestamp_millis();
            current.status = attempt.status;
            current.info = attempt.info;
            current.error = match &attempt.error {
                Some(e) => {
                    let message = format!("{e:#}");
                    if message.is_empty() {
                        "microcontroller failed without a message".to_string()
                    } else {
                        message
                    }
                }
                None => String::new(),
            };

            match attempt.error {
                Some(source) => {
                    warn!(
                        id,
                        kind = %want.kind,
                        attempt = current.attempt_num,
                        error = %current.error,
                        "Attribute attempt failed"
                    );
                    errors.push(AttributeError::Worker {
                        id: id.to_string(),
                        kind: want.kind,
                        source,
                    });
                }
                None => {
                    debug!(id, status = %current.status, "Attribute attempt recorded");
                }
            }

            self.actual.insert(id, current);

            if let Err(source) = self.store.store(&self.actual).await {
                error!(id, error = %source, "Failed to persist actual state");
                errors.push(AttributeError::Persist {
                    id: id.to_string(),
                    kind: want.kind,
                    source,
                });
            }
        }

        // Workers for ids that left the desired state, or changed kind, are
        // not needed again.
        self.registry
            .retain(|kind, id| desired.get(id).is_some_and(|want| want.kind == kind));

        (self.actual.clone(), errors.into_result())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::model::{ActualStatus, AttrOffset, AttributeKind, DesiredAttribute};
    use crate::registry::{from_fn, Attempt};

    fn counting_factories(calls: &Arc<AtomicUsize>, fail: bool) -> Factories {
        let calls = Arc::clone(calls);
        Factories::new().with(AttributeKind::Shell, move || {
            let calls = Arc::clone(&calls);
            from_fn(move |_cancel, _desired| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if fail {
                        Attempt::failed(ActualStatus::Pending, "", anyhow::anyhow!("no shell"))
                    } else {
                        Attempt::finished("ok")
                    }
                }
            })
        })
    }

    #[tokio::test]
    async fn test_cancelled_pass_invokes_nothing() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut achiever = SuperController::new(
            counting_factories(&calls, false),
            AchieverConfig {
                state_path: dir.path().join("state.json"),
            },
        )
        .await
        .unwrap();

        let desired: DesiredState = [("cmd", DesiredAttribute::new(AttributeKind::Shell, 1, "true"))]
            .into_iter()
            .collect();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (actual, result) = achiever.achieve_state(&cancel, &desired).await;
        assert!(result.is_ok());
        assert!(actual.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unset_offset_needs_no_factory() {
        let dir = tempdir().unwrap();
        let mut achiever = SuperController::new(
            Factories::new(),
            AchieverConfig {
                state_path: dir.path().join("state.json"),
            },
        )
        .await
        .unwrap();

        let desired: DesiredState = [("gone", DesiredAttribute::new(AttributeKind::DockerStack, 0, ""))]
            .into_iter()
            .collect();
        let (actual, result) = achiever.achieve_state(&CancellationToken::new(), &desired).await;
        assert!(result.is_ok());
        assert!(actual.achieves(&desired));
    }

    #[tokio::test]
    async fn test_in_progress_is_reinvoked_without_attempt_increment() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let factories = Factories::new().with(AttributeKind::Shell, {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                from_fn(move |_cancel, _desired| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Attempt::progress(ActualStatus::InProgress, "converging") }
                })
            }
        });
        let mut achiever = SuperController::new(
            factories,
            AchieverConfig {
                state_path: dir.path().join("state.json"),
            },
        )
        .await
        .unwrap();
        let desired: DesiredState = [("cmd", DesiredAttribute::new(AttributeKind::Shell, 5, "true"))]
            .into_iter()
            .collect();
        let cancel = CancellationToken::new();

        achiever.achieve_state(&cancel, &desired).await.1.unwrap();
        let (actual, _) = achiever.achieve_state(&cancel, &desired).await;

        let attr = actual.get("cmd").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(attr.attempt_num, 1);
        assert_eq!(attr.offset, AttrOffset(5));
        assert_eq!(attr.status, ActualStatus::InProgress);
    }

    #[tokio::test]
    async fn test_workers_dropped_when_attribute_leaves_desired_state() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let factories = counting_factories(&calls, false).with(AttributeKind::DockerStack, {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                from_fn(move |_cancel, _desired| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Attempt::finished("deployed") }
                })
            }
        });
        let mut achiever = SuperController::new(
            factories,
            AchieverConfig {
                state_path: dir.path().join("state.json"),
            },
        )
        .await
        .unwrap();
        let cancel = CancellationToken::new();

        let both: DesiredState = [
            ("a", DesiredAttribute::new(AttributeKind::Shell, 1, "true")),
            ("b", DesiredAttribute::new(AttributeKind::Shell, 1, "true")),
        ]
        .into_iter()
        .collect();
        achiever.achieve_state(&cancel, &both).await.1.unwrap();
        assert_eq!(achiever.registry.len(), 2);

        // "a" is gone and "b" changed kind.
        let changed: DesiredState = [("b", DesiredAttribute::new(AttributeKind::DockerStack, 2, "v2"))]
            .into_iter()
            .collect();
        achiever.achieve_state(&cancel, &changed).await.1.unwrap();
        assert_eq!(achiever.registry.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        achiever.achieve_state(&cancel, &DesiredState::new()).await.1.unwrap();
        assert!(achiever.registry.is_empty());
    }
}
